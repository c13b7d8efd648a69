//! # Invertible units
//!
//! Every transformation in a normalizing flow is a bijection with a tractable
//! Jacobian. A [`Flow`] maps data towards the latent space with `forward`,
//! returning the transformed tensor along with `log |det d(out)/d(in)|` for
//! each example of the batch, and maps back exactly with `inverse`.
//!
//! Units optionally take a conditioning tensor. It is only ever fed to the
//! sub-networks predicting the transformation parameters, it is never
//! transformed itself.
use crate::{Error, Result};
use tch::{Kind, Tensor};

pub mod activation;
pub mod actnorm;
pub mod conv1x1;
pub mod coupling;
pub mod masked_conv;
pub mod sequential;
pub mod squeeze;

/// An exactly invertible transformation with a per-example log-determinant.
pub trait Flow: std::fmt::Debug {
    /// Returns the transformed tensor and the log-determinant of the
    /// Jacobian, with shape `[batch]`.
    fn forward(&self, xs: &Tensor, cond: Option<&Tensor>) -> Result<(Tensor, Tensor)>;

    /// Undoes `forward`.
    fn inverse(&self, ys: &Tensor, cond: Option<&Tensor>) -> Result<Tensor>;

    /// Data-dependent initialization followed by a forward pass. Units
    /// without data-dependent parameters simply run `forward`.
    fn init(
        &self,
        xs: &Tensor,
        cond: Option<&Tensor>,
        init_scale: f64,
    ) -> Result<(Tensor, Tensor)> {
        let _ = init_scale;
        self.forward(xs, cond)
    }
}

/// Checks that `xs` is a 4D tensor with the given channels, height and width,
/// and returns its batch size.
pub(crate) fn check_shape(
    unit: &'static str,
    xs: &Tensor,
    chw: (i64, i64, i64),
) -> Result<i64> {
    let (c, h, w) = chw;
    match xs.size().as_slice() {
        &[b, c_, h_, w_] if (c_, h_, w_) == (c, h, w) => Ok(b),
        actual => Err(Error::shape(unit, &[-1, c, h, w], actual)),
    }
}

/// Sums all the dimensions but the first one, giving one value per example.
pub(crate) fn sum_per_example(xs: &Tensor) -> Tensor {
    xs.flatten(1, -1).sum_dim_intlist([1].as_slice(), false, Kind::Float)
}

/// Broadcasts a scalar tensor to a `[batch]` tensor.
pub(crate) fn per_example(value: &Tensor, batch: i64) -> Tensor {
    value.reshape([1]).repeat([batch])
}

/// Log-density of a standard normal, summed per example.
pub fn standard_normal_log_density(zs: &Tensor) -> Tensor {
    let zs = zs.flatten(1, -1);
    let dims = zs.size()[1] as f64;
    (zs.square().sum_dim_intlist([1].as_slice(), false, Kind::Float)
        + dims * (2. * std::f64::consts::PI).ln())
        * -0.5
}

/// Bounded log-scale used by the affine units: a smooth clamp of `raw` to
/// `(-bound, bound)` with unit slope at the origin.
pub(crate) fn bounded_scale(raw: &Tensor, bound: f64) -> Tensor {
    (raw / bound).tanh() * bound
}

#[cfg(test)]
pub(crate) mod testing {
    use super::Flow;
    use tch::{nn, Kind, Tensor};

    /// Adds some noise to every trainable variable so that zero-initialized
    /// layers stop being the identity.
    pub fn perturb(vs: &nn::VarStore, stdev: f64) {
        tch::no_grad(|| {
            for mut var in vs.trainable_variables() {
                let noise = var.randn_like() * stdev;
                let _ = var.f_add_(&noise).unwrap();
            }
        });
    }

    pub fn assert_round_trip(flow: &dyn Flow, xs: &Tensor, cond: Option<&Tensor>) {
        let (ys, logdet) = flow.forward(xs, cond).unwrap();
        assert_eq!(ys.size(), xs.size());
        assert_eq!(logdet.size(), vec![xs.size()[0]]);
        let xs_ = flow.inverse(&ys, cond).unwrap();
        let err = (xs_ - xs).abs().max().double_value(&[]);
        assert!(err < 1e-4, "round trip error {err}");
    }

    /// Builds the full Jacobian of a single example with autograd and
    /// compares its log-abs-determinant with the analytic one.
    pub fn assert_logdet_matches_jacobian(flow: &dyn Flow, xs: &Tensor, cond: Option<&Tensor>) {
        assert_eq!(xs.size()[0], 1);
        let xs = xs.detach().set_requires_grad(true);
        let (ys, logdet) = flow.forward(&xs, cond).unwrap();
        let ys = ys.flatten(0, -1);
        let dims = ys.size()[0];
        let rows: Vec<Tensor> = (0..dims)
            .map(|i| {
                let grads = Tensor::run_backward(&[ys.get(i)], &[&xs], true, false);
                grads[0].flatten(0, -1)
            })
            .collect();
        let jacobian = Tensor::stack(&rows, 0).to_kind(Kind::Double);
        let (_sign, expected) = Tensor::linalg_slogdet(&jacobian);
        let expected = expected.double_value(&[]);
        let actual = logdet.double_value(&[0]);
        assert!(
            (expected - actual).abs() < 1e-3 * (1. + expected.abs()),
            "logdet {actual} vs jacobian {expected}"
        );
    }
}
