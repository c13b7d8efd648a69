//! Experiment configuration, read from a json document.
//!
//! The model part of the document is flattened at the top level:
//!
//! ```json
//! {
//!   "image_size": 32,
//!   "n_bits": 8,
//!   "flow": { "in_channels": 3, "height": 32, "width": 32, ... },
//!   "dequant": { "type": "uniform" },
//!   "batch_size": 64,
//!   ...
//! }
//! ```
use super::training::TrainingConfig;
use crate::models::flow_gen::FlowGenConfig;
use crate::utils::file_open;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentConfig {
    pub image_size: i64,
    #[serde(flatten)]
    pub model: FlowGenConfig,
    pub batch_size: usize,
    pub batch_steps: usize,
    /// Number of dequantization samples per image during training.
    pub train_k: i64,
    /// Number of importance samples used for evaluation.
    #[serde(default = "default_eval_k")]
    pub eval_k: i64,
    pub data_path: PathBuf,
    pub model_path: PathBuf,
    pub seed: i64,
    pub epochs: usize,
    pub learning_rate: f64,
    pub warmup_steps: usize,
    pub lr_decay: f64,
    #[serde(default)]
    pub weight_decay: f64,
    #[serde(default)]
    pub grad_clip: Option<f64>,
    /// Number of images used for the data-dependent initialization.
    pub init_batch_size: i64,
    /// Number of images sampled after each epoch.
    pub num_samples: i64,
}

fn default_eval_k() -> i64 {
    1
}

impl ExperimentConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config: Self = serde_json::from_reader(file_open(path)?)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let (size, steps) = (self.batch_size, self.batch_steps);
        if size == 0 || steps == 0 || size % steps != 0 {
            return Err(Error::Config(format!(
                "batch size {size} is not a multiple of batch steps {steps}"
            )));
        }
        if self.train_k < 1 || self.eval_k < 1 {
            return Err(Error::Config(format!(
                "invalid sample counts train_k {} eval_k {}",
                self.train_k, self.eval_k
            )));
        }
        let flow = &self.model.flow;
        if (flow.height, flow.width) != (self.image_size, self.image_size) {
            return Err(Error::Config(format!(
                "image size {} does not match the {}x{} flow",
                self.image_size, flow.height, flow.width
            )));
        }
        if self.init_batch_size < 1 {
            return Err(Error::Config("empty initialization batch".to_string()));
        }
        self.model.validate()?;
        self.training().validate()
    }

    pub fn training(&self) -> TrainingConfig {
        TrainingConfig {
            learning_rate: self.learning_rate,
            weight_decay: self.weight_decay,
            warmup_steps: self.warmup_steps,
            lr_decay: self.lr_decay,
            grad_clip: self.grad_clip,
            batch_steps: self.batch_steps,
            train_k: self.train_k,
            ..Default::default()
        }
    }
}
