//! # Pipelines
//!
//! Training, evaluation and persistence of the generative model.

pub mod checkpoint;
pub mod experiment;
pub mod training;
