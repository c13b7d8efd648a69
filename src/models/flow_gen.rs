//! # Flow based generative model over discrete images
//!
//! Wraps the MaCow flow with a dequantizer. For an image `v` with `n_bits`
//! bits per channel and `D` dimensions:
//!
//! `log p(v) >= log N(z) + logdet - D * n_bits * ln 2 - log q(u | v)`
//!
//! where `z` is the encoding of the continuous value `(v + u) / 2^n_bits`.
use super::dequant::{self, cell_log_volume, repeat_samples, DequantConfig, Dequantizer};
use super::macow::{Latents, MaCow, MaCowConfig};
use crate::flows::{check_shape, Flow};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use tch::{nn, Kind, Tensor};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowGenConfig {
    pub flow: MaCowConfig,
    pub dequant: DequantConfig,
    pub n_bits: u32,
}

impl Default for FlowGenConfig {
    fn default() -> Self {
        Self { flow: MaCowConfig::default(), dequant: DequantConfig::Uniform, n_bits: 8 }
    }
}

impl FlowGenConfig {
    pub fn validate(&self) -> Result<()> {
        if !(1..=8).contains(&self.n_bits) {
            return Err(Error::Config(format!("n_bits should be in 1..=8, got {}", self.n_bits)));
        }
        if self.flow.cond_channels != 0 {
            return Err(Error::Config("the image flow cannot be conditioned".to_string()));
        }
        self.flow.validate()?;
        self.dequant.validate((self.flow.in_channels, self.flow.height, self.flow.width))
    }
}

#[derive(Debug)]
pub struct FlowGenModel {
    flow: MaCow,
    dequantizer: Box<dyn Dequantizer>,
    config: FlowGenConfig,
}

impl FlowGenModel {
    pub fn new(vs: nn::Path, config: &FlowGenConfig) -> Result<Self> {
        config.validate()?;
        let dequantizer = dequant::build(&vs / "dequant", &config.dequant, config.n_bits)?;
        Self::with_dequantizer(vs, config, dequantizer)
    }

    /// Builds the model around a custom dequantizer, `config.dequant` is
    /// ignored.
    pub fn with_dequantizer(
        vs: nn::Path,
        config: &FlowGenConfig,
        dequantizer: Box<dyn Dequantizer>,
    ) -> Result<Self> {
        config.validate()?;
        let flow = MaCow::new(&vs / "flow", &config.flow)?;
        tracing::info!(
            image = ?(config.flow.in_channels, config.flow.height, config.flow.width),
            levels = config.flow.levels.len(),
            n_bits = config.n_bits,
            "built flow model"
        );
        Ok(Self { flow, dequantizer, config: config.clone() })
    }

    pub fn config(&self) -> &FlowGenConfig {
        &self.config
    }

    pub fn flow(&self) -> &MaCow {
        &self.flow
    }

    fn levels(&self) -> f64 {
        (1i64 << self.config.n_bits) as f64
    }

    /// Checks the shape and range of a batch of discrete images and returns
    /// it as floats.
    fn check_images(&self, images: &Tensor) -> Result<Tensor> {
        let cfg = &self.config.flow;
        check_shape("flow_gen", images, (cfg.in_channels, cfg.height, cfg.width))?;
        let images = images.to_kind(Kind::Float);
        if images.numel() == 0 {
            return Ok(images);
        }
        let (min, max) = (images.min().double_value(&[]), images.max().double_value(&[]));
        let top = self.levels() - 1.;
        if !(min >= 0. && max <= top) {
            return Err(Error::InvalidInput(format!(
                "pixel levels in [{min}, {max}] do not fit in {} bits",
                self.config.n_bits
            )));
        }
        Ok(images)
    }

    /// Lower bounds of the log-likelihood of each image, one for each of the
    /// `nsamples` dequantization samples, `[batch, nsamples]`.
    pub fn log_likelihood(&self, images: &Tensor, nsamples: i64) -> Result<Tensor> {
        if nsamples < 1 {
            return Err(Error::InvalidInput(format!("invalid number of samples {nsamples}")));
        }
        let images = self.check_images(images)?;
        let batch = images.size()[0];
        let (u, log_q) = self.dequantizer.dequantize(&images, nsamples)?;
        let xs = (repeat_samples(&images, nsamples)? + u) / self.levels();
        let (latents, logdet) = self.flow.encode(&xs, None)?;
        let cell = cell_log_volume(self.config.n_bits) * self.config.flow.dims() as f64;
        let log_px = latents.log_density() + logdet + cell;
        Ok(log_px.view([batch, nsamples]) - log_q)
    }

    /// Negative log-likelihood bound averaged over the dequantization
    /// samples, `[batch]`.
    pub fn nll(&self, images: &Tensor, nsamples: i64) -> Result<Tensor> {
        let ll = self.log_likelihood(images, nsamples)?;
        Ok(-ll.mean_dim(Some([1].as_slice()), false, Kind::Float))
    }

    /// Importance weighted bound, tighter than `nll` for more than one
    /// sample, `[batch]`.
    pub fn importance_weighted_nll(&self, images: &Tensor, nsamples: i64) -> Result<Tensor> {
        let ll = self.log_likelihood(images, nsamples)?;
        Ok((nsamples as f64).ln() - ll.logsumexp([1].as_slice(), false))
    }

    pub fn bits_per_dim(&self, nll: &Tensor) -> Tensor {
        nll / (self.config.flow.dims() as f64 * std::f64::consts::LN_2)
    }

    /// Data-dependent initialization of the dequantizer then of the flow.
    pub fn init(&self, images: &Tensor, init_scale: f64) -> Result<()> {
        tch::no_grad(|| -> Result<()> {
            let images = self.check_images(images)?;
            self.dequantizer.init(&images, init_scale)?;
            let (u, _) = self.dequantizer.dequantize(&images, 1)?;
            let xs = (images + u) / self.levels();
            let (_, logdet) = self.flow.init(&xs, None, init_scale)?;
            tracing::info!(logdet = logdet.mean(Kind::Float).double_value(&[]), "initialized");
            Ok(())
        })
    }

    /// Maps continuous images in `[0, 1)` to their latents.
    pub fn encode(&self, xs: &Tensor) -> Result<(Latents, Tensor)> {
        self.flow.encode(xs, None)
    }

    pub fn decode(&self, latents: &Latents) -> Result<Tensor> {
        self.flow.decode(latents, None)
    }

    /// Samples `n` discrete images, returned as `Int64` levels.
    pub fn sample(&self, n: i64, temperature: f64) -> Result<Tensor> {
        tch::no_grad(|| -> Result<Tensor> {
            let latents = self.flow.sample_latents(n, temperature);
            let xs = self.flow.decode(&latents, None)?;
            let top = self.levels() - 1.;
            Ok((xs * self.levels()).floor().clamp(0., top).to_kind(Kind::Int64))
        })
    }
}
