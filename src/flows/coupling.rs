//! # Masked convolutional coupling
//!
//! A fixed binary mask `m` splits the input into a conditioning region
//! (`m = 1`) that passes through unchanged and a transformed region
//! (`m = 0`). A convolutional network only ever sees `x * m` and predicts a
//! scale and a shift for the transformed region:
//!
//! `y = x * m + (1 - m) * (x * exp(s) + t)`
//!
//! The Jacobian is triangular with `exp(s)` on the transformed positions, so
//! the log-determinant is the sum of `s` over these positions. Stacked
//! layers alternate between a mask and its complement so that every entry
//! ends up being transformed.
//!
//! Density estimation using Real NVP, Dinh et al. 2016.
//! https://arxiv.org/abs/1605.08803
use super::{bounded_scale, check_shape, sum_per_example, Flow};
use crate::models::nets::{check_cond, CouplingNet, NetConfig};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use tch::{nn, Device, Kind, Tensor};

/// How the conditioning and transformed regions are laid out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MaskKind {
    /// Spatial checkerboard, identical on all channels.
    Checkerboard,
    /// The first `ceil(c / 2)` channels against the remaining ones.
    Channel,
}

/// A constant `[1, c, h, w]` tensor with 1 on the conditioning region.
#[derive(Debug)]
pub struct Mask {
    kind: MaskKind,
    parity: i64,
    mask: Tensor,
}

impl Mask {
    /// Builds the mask for a given layer index, odd indexes use the
    /// complement of even ones.
    pub fn new(
        kind: MaskKind,
        index: usize,
        shape: (i64, i64, i64),
        device: Device,
    ) -> Result<Self> {
        let (c, h, w) = shape;
        let parity = (index % 2) as i64;
        let mask = match kind {
            MaskKind::Checkerboard => {
                let rows = Tensor::arange(h, (Kind::Int64, device)).view([h, 1]);
                let cols = Tensor::arange(w, (Kind::Int64, device)).view([1, w]);
                let board = (rows + cols + parity).remainder(2).eq(0);
                board.to_kind(Kind::Float).view([1, 1, h, w]).repeat([1, c, 1, 1])
            }
            MaskKind::Channel => {
                if c < 2 {
                    return Err(Error::Config(format!("channel mask needs 2 channels, got {c}")));
                }
                let first = leading_channels(c - c / 2, shape, device);
                if parity == 0 {
                    first
                } else {
                    1. - first
                }
            }
        };
        Ok(Self { kind, parity, mask })
    }

    /// Channel mask conditioning on the first `retained` channels, the
    /// remaining ones being transformed. Used before factoring them out.
    pub fn split(retained: i64, shape: (i64, i64, i64), device: Device) -> Result<Self> {
        let c = shape.0;
        if retained < 1 || retained >= c {
            return Err(Error::Config(format!("cannot retain {retained} channels out of {c}")));
        }
        let mask = leading_channels(retained, shape, device);
        Ok(Self { kind: MaskKind::Channel, parity: 0, mask })
    }

    pub fn kind(&self) -> MaskKind {
        self.kind
    }

    pub fn parity(&self) -> i64 {
        self.parity
    }

    pub fn tensor(&self) -> &Tensor {
        &self.mask
    }
}

fn leading_channels(n: i64, shape: (i64, i64, i64), device: Device) -> Tensor {
    let (c, h, w) = shape;
    let first = Tensor::arange(c, (Kind::Int64, device)).lt(n);
    first.to_kind(Kind::Float).view([1, c, 1, 1]).repeat([1, 1, h, w])
}

#[derive(Debug, Clone, Copy)]
pub struct CouplingConfig {
    pub hidden_channels: i64,
    pub cond_channels: i64,
    pub scale_bound: f64,
}

#[derive(Debug)]
pub struct MaskedCoupling {
    net: CouplingNet,
    mask: Mask,
    shape: (i64, i64, i64),
    config: CouplingConfig,
}

impl MaskedCoupling {
    pub fn new(vs: nn::Path, shape: (i64, i64, i64), mask: Mask, config: CouplingConfig) -> Self {
        let channels = shape.0;
        let net_cfg = NetConfig {
            hidden_channels: config.hidden_channels,
            cond_channels: config.cond_channels,
        };
        let net = CouplingNet::new(&vs / "net", channels, 2 * channels, net_cfg);
        Self { net, mask, shape, config }
    }

    pub fn mask(&self) -> &Mask {
        &self.mask
    }

    /// Returns the log-scale and shift, both zero on the conditioning region.
    fn scale_and_shift(&self, conditioning: &Tensor, cond: Option<&Tensor>) -> (Tensor, Tensor) {
        let inv_mask = 1. - self.mask.tensor();
        let out = self.net.forward(conditioning, cond);
        let out = out.chunk(2, 1);
        let log_scale = bounded_scale(&out[0], self.config.scale_bound) * &inv_mask;
        let shift = &out[1] * inv_mask;
        (log_scale, shift)
    }

    fn check(&self, xs: &Tensor, cond: Option<&Tensor>) -> Result<i64> {
        check_cond("coupling", cond, self.config.cond_channels)?;
        check_shape("coupling", xs, self.shape)
    }
}

impl Flow for MaskedCoupling {
    fn forward(&self, xs: &Tensor, cond: Option<&Tensor>) -> Result<(Tensor, Tensor)> {
        self.check(xs, cond)?;
        let mask = self.mask.tensor();
        let conditioning = xs * mask;
        let (log_scale, shift) = self.scale_and_shift(&conditioning, cond);
        let transformed = (xs * log_scale.exp() + shift) * (1. - mask);
        Ok((conditioning + transformed, sum_per_example(&log_scale)))
    }

    fn inverse(&self, ys: &Tensor, cond: Option<&Tensor>) -> Result<Tensor> {
        self.check(ys, cond)?;
        let mask = self.mask.tensor();
        let conditioning = ys * mask;
        let (log_scale, shift) = self.scale_and_shift(&conditioning, cond);
        let transformed = ((ys - shift) * (-log_scale).exp()) * (1. - mask);
        Ok(conditioning + transformed)
    }
}
