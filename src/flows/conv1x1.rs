//! Invertible 1x1 convolution.
//!
//! A learned linear mixing of the channels applied at every spatial position.
//! The weight starts as a random rotation so the unit is volume preserving at
//! initialization.
use super::{check_shape, per_example, Flow};
use crate::Result;
use tch::{nn, Kind, Tensor};

#[derive(Debug)]
pub struct InvConv1x1 {
    weight: Tensor,
    shape: (i64, i64, i64),
}

impl InvConv1x1 {
    pub fn new(vs: nn::Path, shape: (i64, i64, i64)) -> Self {
        let channels = shape.0;
        let (rotation, _) =
            Tensor::linalg_qr(&Tensor::randn([channels, channels], (Kind::Float, vs.device())), "reduced");
        let weight = vs.var_copy("weight", &rotation);
        Self { weight, shape }
    }

    fn conv(&self, xs: &Tensor, weight: &Tensor) -> Tensor {
        let c = self.shape.0;
        xs.conv2d(&weight.view([c, c, 1, 1]), None::<Tensor>, [1, 1], [0, 0], [1, 1], 1)
    }
}

impl Flow for InvConv1x1 {
    fn forward(&self, xs: &Tensor, _cond: Option<&Tensor>) -> Result<(Tensor, Tensor)> {
        let batch = check_shape("conv1x1", xs, self.shape)?;
        let (_, h, w) = self.shape;
        let (_sign, logabsdet) = Tensor::linalg_slogdet(&self.weight);
        let logdet = per_example(&(logabsdet * (h * w) as f64), batch);
        Ok((self.conv(xs, &self.weight), logdet))
    }

    fn inverse(&self, ys: &Tensor, _cond: Option<&Tensor>) -> Result<Tensor> {
        check_shape("conv1x1", ys, self.shape)?;
        Ok(self.conv(ys, &self.weight.inverse()))
    }
}
