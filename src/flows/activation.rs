//! Elementwise sigmoid as a flow, mapping the real line to `(0, 1)`.
use super::{sum_per_example, Flow};
use crate::Result;
use tch::Tensor;

#[derive(Debug, Clone, Copy, Default)]
pub struct SigmoidFlow;

impl Flow for SigmoidFlow {
    fn forward(&self, xs: &Tensor, _cond: Option<&Tensor>) -> Result<(Tensor, Tensor)> {
        // d sigmoid(x) / dx = sigmoid(x) * sigmoid(-x)
        let logdet = sum_per_example(&(xs.log_sigmoid() + (-xs).log_sigmoid()));
        Ok((xs.sigmoid(), logdet))
    }

    /// Exact logit. Saturated values 0 and 1 map to minus and plus infinity.
    fn inverse(&self, ys: &Tensor, _cond: Option<&Tensor>) -> Result<Tensor> {
        Ok(ys.log() - (1f64 - ys).log())
    }
}
