//! # Models
//!
//! The MaCow flow, the dequantizers and the generative model combining them.

pub mod dequant;
pub mod flow_gen;
pub mod macow;
pub mod nets;
