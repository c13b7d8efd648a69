//! # Masked convolutional generative flows
//!
//! A Rust implementation of [MaCow](https://arxiv.org/abs/1902.04208), a
//! normalizing flow for images, using Torch via
//! [tch-rs](https://github.com/LaurentMazare/tch-rs).
//!
//! This library includes:
//! - Invertible units with exact log-determinants: masked convolution flows,
//!   masked couplings, actnorm, invertible 1x1 convolutions, squeeze and split.
//! - The multi-scale MaCow flow.
//! - Uniform and variational dequantization of discrete images.
//! - Maximum likelihood training with gradient accumulation, sampling and
//!   checkpoints.

pub mod error;
pub mod flows;
pub mod models;
pub mod pipelines;
pub mod utils;

pub use error::{Error, Result};
