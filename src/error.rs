//! Error type shared by the flows, models and pipelines.
use tch::TchError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A unit was called on a tensor whose shape does not match the shape it
    /// was built for.
    #[error("{unit}: expected shape {expected:?}, got {actual:?}")]
    ShapeMismatch { unit: &'static str, expected: Vec<i64>, actual: Vec<i64> },

    /// The model or experiment configuration cannot be realized.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Input data outside of the domain of the model, e.g. pixel levels
    /// that do not fit the configured bit depth.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A NaN or an infinity showed up in a likelihood computation.
    #[error("non-finite value in {0}")]
    NonFinite(&'static str),

    /// An optimizer update was requested before all the sub-batches of a
    /// logical batch had been accumulated.
    #[error("gradient accumulation incomplete: {received}/{expected} sub-batches")]
    PartialAccumulation { received: usize, expected: usize },

    /// The checkpoint on disk does not match the requested architecture.
    #[error("incompatible checkpoint {path}:\n  {}", .report.join("\n  "))]
    IncompatibleCheckpoint { path: String, report: Vec<String> },

    #[error(transparent)]
    Tch(#[from] TchError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn shape(unit: &'static str, expected: &[i64], actual: &[i64]) -> Self {
        Self::ShapeMismatch { unit, expected: expected.to_vec(), actual: actual.to_vec() }
    }
}
