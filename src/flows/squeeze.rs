//! Squeeze and split operations of the multi-scale architecture.
//!
//! Both are pure rearrangements of the entries of a tensor so they are exactly
//! invertible and have a zero log-determinant.
use crate::{Error, Result};
use tch::Tensor;

/// Moves each 2x2 spatial neighborhood into the channel dimension,
/// `[b, c, h, w] -> [b, 4c, h/2, w/2]`.
pub fn squeeze2d(xs: &Tensor) -> Result<Tensor> {
    let (b, c, h, w) = xs.size4()?;
    if h % 2 != 0 || w % 2 != 0 {
        return Err(Error::shape("squeeze2d", &[b, c, h + h % 2, w + w % 2], &[b, c, h, w]));
    }
    Ok(xs
        .reshape([b, c, h / 2, 2, w / 2, 2])
        .permute([0, 1, 3, 5, 2, 4])
        .reshape([b, c * 4, h / 2, w / 2]))
}

/// Inverse of [`squeeze2d`], `[b, 4c, h, w] -> [b, c, 2h, 2w]`.
pub fn unsqueeze2d(xs: &Tensor) -> Result<Tensor> {
    let (b, c, h, w) = xs.size4()?;
    if c % 4 != 0 {
        return Err(Error::shape("unsqueeze2d", &[b, c + 4 - c % 4, h, w], &[b, c, h, w]));
    }
    Ok(xs
        .reshape([b, c / 4, 2, 2, h, w])
        .permute([0, 1, 4, 2, 5, 3])
        .reshape([b, c / 4, h * 2, w * 2]))
}

/// Splits along the channel dimension, the first tensor gets `z1_channels`
/// channels.
pub fn split2d(xs: &Tensor, z1_channels: i64) -> Result<(Tensor, Tensor)> {
    let (_b, c, _h, _w) = xs.size4()?;
    if z1_channels <= 0 || z1_channels >= c {
        return Err(Error::Config(format!("cannot split {z1_channels} channels out of {c}")));
    }
    Ok((xs.narrow(1, 0, z1_channels), xs.narrow(1, z1_channels, c - z1_channels)))
}

pub fn unsplit2d(z1: &Tensor, z2: &Tensor) -> Tensor {
    Tensor::cat(&[z1, z2], 1)
}
