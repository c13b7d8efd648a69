//! Activation normalization.
//!
//! A per-channel affine transformation `y = (x - b) * exp(log_s)` whose
//! parameters are set from the statistics of the first batch seen by `init`
//! so that this batch comes out with zero mean and unit variance. They are
//! trained like any other parameter afterwards.
//!
//! Glow: Generative Flow with Invertible 1x1 Convolutions, Kingma & Dhariwal 2018.
//! https://arxiv.org/abs/1807.03039
use super::{check_shape, per_example, Flow};
use crate::Result;
use tch::{nn, Kind, Tensor};

#[derive(Debug)]
pub struct ActNorm2d {
    log_scale: Tensor,
    bias: Tensor,
    shape: (i64, i64, i64),
}

impl ActNorm2d {
    pub fn new(vs: nn::Path, shape: (i64, i64, i64)) -> Self {
        let channels = shape.0;
        let log_scale = vs.zeros("log_scale", &[channels]);
        let bias = vs.zeros("bias", &[channels]);
        Self { log_scale, bias, shape }
    }

    fn logdet(&self, batch: i64) -> Tensor {
        let (_, h, w) = self.shape;
        per_example(&(self.log_scale.sum(Kind::Float) * (h * w) as f64), batch)
    }
}

impl Flow for ActNorm2d {
    fn forward(&self, xs: &Tensor, _cond: Option<&Tensor>) -> Result<(Tensor, Tensor)> {
        let batch = check_shape("actnorm", xs, self.shape)?;
        let bias = self.bias.view([1, -1, 1, 1]);
        let scale = self.log_scale.exp().view([1, -1, 1, 1]);
        Ok(((xs - bias) * scale, self.logdet(batch)))
    }

    fn inverse(&self, ys: &Tensor, _cond: Option<&Tensor>) -> Result<Tensor> {
        check_shape("actnorm", ys, self.shape)?;
        let bias = self.bias.view([1, -1, 1, 1]);
        let inv_scale = (-&self.log_scale).exp().view([1, -1, 1, 1]);
        Ok(ys * inv_scale + bias)
    }

    fn init(
        &self,
        xs: &Tensor,
        cond: Option<&Tensor>,
        init_scale: f64,
    ) -> Result<(Tensor, Tensor)> {
        check_shape("actnorm", xs, self.shape)?;
        tch::no_grad(|| -> Result<()> {
            let dims = Some([0, 2, 3].as_slice());
            let mean = xs.mean_dim(dims, false, Kind::Float);
            let centered = xs - mean.view([1, -1, 1, 1]);
            let std = centered.square().mean_dim(dims, false, Kind::Float).sqrt();
            let log_scale = (init_scale / (std + 1e-6)).log();
            self.bias.shallow_clone().f_copy_(&mean)?;
            self.log_scale.shallow_clone().f_copy_(&log_scale)?;
            Ok(())
        })?;
        self.forward(xs, cond)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flows::testing;
    use tch::Device;

    #[test]
    fn init_normalizes_first_batch() {
        tch::manual_seed(1);
        let vs = nn::VarStore::new(Device::Cpu);
        let actnorm = ActNorm2d::new(vs.root(), (3, 4, 4));
        let xs = Tensor::randn([8, 3, 4, 4], (Kind::Float, Device::Cpu)) * 3. + 1.5;
        let (ys, _logdet) = actnorm.init(&xs, None, 1.0).unwrap();
        let dims = Some([0, 2, 3].as_slice());
        let mean = ys.mean_dim(dims, false, Kind::Float);
        let var = ys.square().mean_dim(dims, false, Kind::Float);
        assert!(mean.abs().max().double_value(&[]) < 1e-4);
        assert!((var - 1.).abs().max().double_value(&[]) < 1e-3);
    }

    #[test]
    fn round_trip_and_logdet() {
        tch::manual_seed(2);
        let vs = nn::VarStore::new(Device::Cpu);
        let actnorm = ActNorm2d::new(vs.root(), (2, 2, 2));
        testing::perturb(&vs, 0.5);
        let xs = Tensor::randn([4, 2, 2, 2], (Kind::Float, Device::Cpu));
        testing::assert_round_trip(&actnorm, &xs, None);
        testing::assert_logdet_matches_jacobian(&actnorm, &xs.narrow(0, 0, 1), None);
    }

    #[test]
    fn rejects_wrong_shape() {
        let vs = nn::VarStore::new(Device::Cpu);
        let actnorm = ActNorm2d::new(vs.root(), (3, 4, 4));
        let xs = Tensor::zeros([1, 3, 2, 2], (Kind::Float, Device::Cpu));
        assert!(matches!(actnorm.forward(&xs, None), Err(crate::Error::ShapeMismatch { .. })));
    }
}
