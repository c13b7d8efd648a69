//! Maximum likelihood training with gradient accumulation.
//!
//! A logical batch is processed as `batch_steps` sub-batches. Backpropagating
//! the summed negative log-likelihood of each sub-batch accumulates the
//! gradients of the whole batch, they are then rescaled by the number of
//! examples so that a single optimizer step is the same as the one for the
//! full batch processed at once.
use crate::models::flow_gen::FlowGenModel;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use tch::{nn, nn::OptimizerConfig, Kind, Tensor};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    pub learning_rate: f64,
    pub betas: (f64, f64),
    pub eps: f64,
    pub weight_decay: f64,
    pub amsgrad: bool,
    /// Number of steps of linear warm-up to the base learning rate.
    pub warmup_steps: usize,
    /// Multiplicative decay of the learning rate applied at every step
    /// after the warm-up.
    pub lr_decay: f64,
    /// Maximum norm of the gradients, no clipping when unset.
    pub grad_clip: Option<f64>,
    /// Number of sub-batches each batch is split into.
    pub batch_steps: usize,
    /// Number of dequantization samples per image.
    pub train_k: i64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-3,
            betas: (0.9, 0.999),
            eps: 1e-8,
            weight_decay: 1e-6,
            amsgrad: false,
            warmup_steps: 50,
            lr_decay: 0.999997,
            grad_clip: None,
            batch_steps: 1,
            train_k: 1,
        }
    }
}

impl TrainingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.batch_steps == 0 || self.train_k < 1 {
            return Err(Error::Config(format!(
                "invalid batch steps {} or train_k {}",
                self.batch_steps, self.train_k
            )));
        }
        if self.learning_rate <= 0. || self.lr_decay <= 0. || self.lr_decay > 1. {
            return Err(Error::Config(format!(
                "invalid learning rate {} or decay {}",
                self.learning_rate, self.lr_decay
            )));
        }
        Ok(())
    }

    /// Learning rate used for the update number `step`, starting from 0.
    pub fn learning_rate_at(&self, step: usize) -> f64 {
        if step < self.warmup_steps {
            self.learning_rate * (step + 1) as f64 / self.warmup_steps as f64
        } else {
            self.learning_rate * self.lr_decay.powi((step - self.warmup_steps) as i32)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccumulationState {
    Accumulating { received: usize },
    ReadyToStep,
}

/// Tracks the sub-batches of a logical batch, the update is only allowed once
/// all of them have been accumulated.
#[derive(Debug, Clone)]
pub struct GradAccumulator {
    expected: usize,
    examples: i64,
    state: AccumulationState,
}

impl GradAccumulator {
    pub fn new(expected: usize) -> Self {
        let state = AccumulationState::Accumulating { received: 0 };
        Self { expected: expected.max(1), examples: 0, state }
    }

    pub fn state(&self) -> AccumulationState {
        self.state
    }

    /// Records a sub-batch of `examples` examples.
    pub fn record(&mut self, examples: i64) -> Result<AccumulationState> {
        let received = match self.state {
            AccumulationState::Accumulating { received } => received + 1,
            AccumulationState::ReadyToStep => {
                return Err(Error::InvalidInput(format!(
                    "all the {} sub-batches have already been recorded",
                    self.expected
                )))
            }
        };
        self.examples += examples;
        self.state = if received == self.expected {
            AccumulationState::ReadyToStep
        } else {
            AccumulationState::Accumulating { received }
        };
        Ok(self.state)
    }

    /// Returns the factor turning the accumulated gradient sums into means,
    /// and starts a new batch.
    pub fn take_scale(&mut self) -> Result<f64> {
        match self.state {
            AccumulationState::ReadyToStep if self.examples > 0 => {
                let scale = 1. / self.examples as f64;
                self.reset();
                Ok(scale)
            }
            AccumulationState::ReadyToStep => Err(Error::InvalidInput("empty batch".to_string())),
            AccumulationState::Accumulating { received } => {
                Err(Error::PartialAccumulation { received, expected: self.expected })
            }
        }
    }

    pub fn reset(&mut self) {
        self.examples = 0;
        self.state = AccumulationState::Accumulating { received: 0 };
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StepOutcome {
    Updated { nll: f64, bits_per_dim: f64, learning_rate: f64 },
    /// A non-finite value showed up, no update was made.
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Evaluation {
    pub nll: f64,
    pub bits_per_dim: f64,
}

pub struct Trainer {
    optimizer: nn::Optimizer,
    variables: Vec<Tensor>,
    accumulator: GradAccumulator,
    config: TrainingConfig,
    step: usize,
}

impl Trainer {
    pub fn new(vs: &nn::VarStore, config: TrainingConfig) -> Result<Self> {
        config.validate()?;
        let adam = nn::Adam {
            beta1: config.betas.0,
            beta2: config.betas.1,
            wd: config.weight_decay,
            eps: config.eps,
            amsgrad: config.amsgrad,
        };
        let mut optimizer = adam.build(vs, config.learning_rate)?;
        optimizer.set_lr(config.learning_rate_at(0));
        let accumulator = GradAccumulator::new(config.batch_steps);
        Ok(Self { optimizer, variables: vs.trainable_variables(), accumulator, config, step: 0 })
    }

    /// Number of updates made so far.
    pub fn step(&self) -> usize {
        self.step
    }

    pub fn learning_rate(&self) -> f64 {
        self.config.learning_rate_at(self.step)
    }

    fn skip(&mut self, what: &str) -> StepOutcome {
        self.optimizer.zero_grad();
        self.accumulator.reset();
        warn!(step = self.step, "non-finite {what}, skipping batch");
        StepOutcome::Skipped
    }

    /// Runs forward and backward passes on the batch in `batch_steps`
    /// sub-batches, then makes a single update.
    pub fn train_batch(&mut self, model: &FlowGenModel, images: &Tensor) -> Result<StepOutcome> {
        let batch = images.size()[0];
        let steps = self.config.batch_steps as i64;
        if batch == 0 || batch % steps != 0 {
            return Err(Error::InvalidInput(format!(
                "batch of {batch} cannot be split in {steps} sub-batches"
            )));
        }
        self.optimizer.zero_grad();
        self.accumulator.reset();
        let mut nll_sum = 0.;
        for sub_batch in images.chunk(steps, 0) {
            let nll = model.nll(&sub_batch, self.config.train_k)?.sum(Kind::Float);
            let value = nll.double_value(&[]);
            if !value.is_finite() {
                return Ok(self.skip("loss"));
            }
            nll.backward();
            nll_sum += value;
            self.accumulator.record(sub_batch.size()[0])?;
        }
        let scale = self.accumulator.take_scale()?;
        let mut grad_norm = 0.;
        tch::no_grad(|| {
            for var in self.variables.iter() {
                let mut grad = var.grad();
                if grad.defined() {
                    let _ = grad.g_mul_scalar_(scale);
                    grad_norm += grad.square().sum(Kind::Float).double_value(&[]);
                }
            }
        });
        if !grad_norm.is_finite() {
            return Ok(self.skip("gradient"));
        }
        if let Some(max_norm) = self.config.grad_clip {
            self.optimizer.clip_grad_norm(max_norm);
        }
        let learning_rate = self.learning_rate();
        self.optimizer.step();
        self.step += 1;
        self.optimizer.set_lr(self.learning_rate());
        let nll = nll_sum / batch as f64;
        let bits_per_dim = model.bits_per_dim(&Tensor::from(nll)).double_value(&[]);
        debug!(step = self.step, nll, bits_per_dim, grad_norm = grad_norm.sqrt(), "update");
        Ok(StepOutcome::Updated { nll, bits_per_dim, learning_rate })
    }

    /// Mean importance weighted negative log-likelihood over a set of images,
    /// processed in batches of `batch_size`.
    pub fn evaluate(
        model: &FlowGenModel,
        images: &Tensor,
        nsamples: i64,
        batch_size: i64,
    ) -> Result<Evaluation> {
        let total = images.size()[0];
        if total == 0 || batch_size < 1 {
            return Err(Error::InvalidInput("nothing to evaluate".to_string()));
        }
        let nll_sum = tch::no_grad(|| -> Result<f64> {
            let mut nll_sum = 0.;
            for start in (0..total).step_by(batch_size as usize) {
                let len = batch_size.min(total - start);
                let nll = model.importance_weighted_nll(&images.narrow(0, start, len), nsamples)?;
                nll_sum += nll.sum(Kind::Float).double_value(&[]);
            }
            Ok(nll_sum)
        })?;
        if !nll_sum.is_finite() {
            return Err(Error::NonFinite("evaluation"));
        }
        let nll = nll_sum / total as f64;
        let bits_per_dim = model.bits_per_dim(&Tensor::from(nll)).double_value(&[]);
        Ok(Evaluation { nll, bits_per_dim })
    }
}
