//! # Autoregressive masked convolution flow
//!
//! The scale and shift at each position are predicted by a masked convolution
//! that only sees the rows above (order `A`), the rows below (`B`), the
//! columns on the left (`C`) or the columns on the right (`D`). The flow is
//! autoregressive over the scanning direction so the Jacobian is triangular,
//! and since the kernel is small the dependencies stay local.
//!
//! The inverse has to be computed sequentially: sweep `i` recovers line `i`
//! exactly as every line it depends on has already been recovered.
//!
//! MaCow: Masked Convolutional Generative Flow, Ma et al. 2019.
//! https://arxiv.org/abs/1902.04208
use super::{bounded_scale, check_shape, sum_per_example, Flow};
use crate::models::nets::{check_cond, MaskedConvNet, NetConfig};
use crate::{Error, Result};
use tch::{nn, Tensor};

/// Scanning direction of the masked convolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    /// Top to bottom.
    A,
    /// Bottom to top.
    B,
    /// Left to right.
    C,
    /// Right to left.
    D,
}

impl Order {
    /// Maps a tensor to the orientation where the scan goes top to bottom.
    fn to_canonical(&self, xs: &Tensor) -> Tensor {
        match self {
            Order::A => xs.shallow_clone(),
            Order::B => xs.flip([2]),
            Order::C => xs.transpose(2, 3),
            Order::D => xs.transpose(2, 3).flip([2]),
        }
    }

    fn from_canonical(&self, xs: &Tensor) -> Tensor {
        match self {
            Order::A => xs.shallow_clone(),
            Order::B => xs.flip([2]),
            Order::C => xs.transpose(2, 3),
            Order::D => xs.flip([2]).transpose(2, 3),
        }
    }

    fn transposed(&self) -> bool {
        matches!(self, Order::C | Order::D)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MaskedConvConfig {
    /// Kernel size, height (number of lines looked at) by width.
    pub kernel_size: (i64, i64),
    pub hidden_channels: i64,
    pub cond_channels: i64,
    pub scale_bound: f64,
}

#[derive(Debug)]
pub struct MaskedConvFlow {
    net: MaskedConvNet,
    order: Order,
    shape: (i64, i64, i64),
    config: MaskedConvConfig,
}

impl MaskedConvFlow {
    pub fn new(
        vs: nn::Path,
        shape: (i64, i64, i64),
        order: Order,
        config: MaskedConvConfig,
    ) -> Result<Self> {
        let (kh, kw) = config.kernel_size;
        if kh < 1 || kw < 1 || kw % 2 == 0 {
            let msg = format!("masked conv kernel needs an odd width, got {kh}x{kw}");
            return Err(Error::Config(msg));
        }
        let channels = shape.0;
        let net_cfg = NetConfig {
            hidden_channels: config.hidden_channels,
            cond_channels: config.cond_channels,
        };
        let net = MaskedConvNet::new(&vs / "net", channels, 2 * channels, (kh, kw), net_cfg);
        Ok(Self { net, order, shape, config })
    }

    pub fn order(&self) -> Order {
        self.order
    }

    /// Log-scale and shift in the canonical orientation.
    fn scale_and_shift(&self, xs: &Tensor, cond: Option<&Tensor>) -> (Tensor, Tensor) {
        let out = self.net.forward(xs, cond).chunk(2, 1);
        (bounded_scale(&out[0], self.config.scale_bound), out[1].shallow_clone())
    }

    fn check(&self, xs: &Tensor, cond: Option<&Tensor>) -> Result<i64> {
        check_cond("masked_conv", cond, self.config.cond_channels)?;
        check_shape("masked_conv", xs, self.shape)
    }
}

impl Flow for MaskedConvFlow {
    fn forward(&self, xs: &Tensor, cond: Option<&Tensor>) -> Result<(Tensor, Tensor)> {
        self.check(xs, cond)?;
        let xs = self.order.to_canonical(xs);
        let cond = cond.map(|c| self.order.to_canonical(c));
        let (log_scale, shift) = self.scale_and_shift(&xs, cond.as_ref());
        let ys = xs * log_scale.exp() + shift;
        Ok((self.order.from_canonical(&ys), sum_per_example(&log_scale)))
    }

    fn inverse(&self, ys: &Tensor, cond: Option<&Tensor>) -> Result<Tensor> {
        self.check(ys, cond)?;
        let ys = self.order.to_canonical(ys);
        let cond = cond.map(|c| self.order.to_canonical(c));
        let (_, h, w) = self.shape;
        let lines = if self.order.transposed() { w } else { h };
        let mut xs = ys.zeros_like();
        for _line in 0..lines {
            let (log_scale, shift) = self.scale_and_shift(&xs, cond.as_ref());
            xs = (&ys - shift) * (-log_scale).exp();
        }
        Ok(self.order.from_canonical(&xs))
    }
}
