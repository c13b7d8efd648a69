//! # Dequantization
//!
//! Flows model continuous densities, pixel levels are discrete. A level `v`
//! is turned into the continuous value `(v + u) / 2^bits` with `u` in
//! `[0, 1)`, and the likelihood of the continuous value, corrected by the
//! volume of the cell and by `log q(u | v)`, lower bounds the discrete
//! log-likelihood.
//!
//! Uniform dequantization draws `u` uniformly. Variational dequantization
//! learns `q(u | v)` with a conditional flow trained jointly with the model,
//! the flow being conditioned on learned features of the image.
//!
//! Flow++: Improving Flow-Based Generative Models with Variational
//! Dequantization and Architecture Design, Ho et al. 2019.
//! https://arxiv.org/abs/1902.00275
use super::macow::{MaCow, MaCowConfig};
use super::nets::CondEncoder;
use crate::flows::{activation::SigmoidFlow, standard_normal_log_density, Flow};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use tch::{nn, Kind, Tensor};

/// Log-volume of the cell of a single dimension once levels are scaled to
/// `[0, 1)`.
pub fn cell_log_volume(n_bits: u32) -> f64 {
    -(n_bits as f64) * std::f64::consts::LN_2
}

/// Repeats each example `nsamples` times, the copies of an example being
/// next to each other.
pub(crate) fn repeat_samples(xs: &Tensor, nsamples: i64) -> Result<Tensor> {
    let (b, c, h, w) = xs.size4()?;
    Ok(xs.unsqueeze(1).expand([b, nsamples, c, h, w], false).reshape([b * nsamples, c, h, w]))
}

pub trait Dequantizer: std::fmt::Debug {
    /// Draws `nsamples` dequantization noises per image. Returns `u` in
    /// `[0, 1)` with shape `[batch * nsamples, c, h, w]` and `log q(u | v)`
    /// with shape `[batch, nsamples]`.
    fn dequantize(&self, images: &Tensor, nsamples: i64) -> Result<(Tensor, Tensor)>;

    /// Data-dependent initialization.
    fn init(&self, images: &Tensor, init_scale: f64) -> Result<()> {
        let _ = (images, init_scale);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DequantConfig {
    Uniform,
    Variational { flow: MaCowConfig },
}

impl DequantConfig {
    /// The default variational dequantizer for images of a given shape.
    pub fn variational(in_channels: i64, height: i64, width: i64) -> Self {
        Self::Variational { flow: MaCowConfig::dequantizer(in_channels, height, width) }
    }

    /// Checks the dequantizer against the `(channels, height, width)` shape
    /// of the images.
    pub fn validate(&self, image: (i64, i64, i64)) -> Result<()> {
        match self {
            Self::Uniform => Ok(()),
            Self::Variational { flow } => {
                if (flow.in_channels, flow.height, flow.width) != image {
                    return Err(Error::Config(format!(
                        "dequantization flow on {}x{}x{} for {image:?} images",
                        flow.in_channels, flow.height, flow.width
                    )));
                }
                check_variational(flow)
            }
        }
    }
}

/// The encoder goes down once per flow level and feeds `cond_channels`
/// features to the flow.
fn check_variational(flow: &MaCowConfig) -> Result<()> {
    flow.validate()?;
    if flow.cond_channels < 1 {
        return Err(Error::Config("the dequantization flow needs conditioning".to_string()));
    }
    let factor = 1i64 << flow.levels.len();
    if flow.height % factor != 0 || flow.width % factor != 0 {
        return Err(Error::Config(format!(
            "the conditioning encoder cannot downsample {}x{} images by {factor}",
            flow.height, flow.width
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, Default)]
pub struct UniformDequantizer;

impl Dequantizer for UniformDequantizer {
    fn dequantize(&self, images: &Tensor, nsamples: i64) -> Result<(Tensor, Tensor)> {
        let (b, c, h, w) = images.size4()?;
        let u = Tensor::rand([b * nsamples, c, h, w], (Kind::Float, images.device()));
        let log_q = Tensor::zeros([b, nsamples], (Kind::Float, images.device()));
        Ok((u, log_q))
    }
}

/// `u = sigmoid(g(eps; e(v)))` with `eps ~ N(0, I)`, `g` a MaCow flow and
/// `e` a [`CondEncoder`] of the image.
#[derive(Debug)]
pub struct VariationalDequantizer {
    encoder: CondEncoder,
    flow: MaCow,
    sigmoid: SigmoidFlow,
    n_bits: u32,
}

impl VariationalDequantizer {
    pub fn new(vs: nn::Path, config: &MaCowConfig, n_bits: u32) -> Result<Self> {
        check_variational(config)?;
        let encoder = CondEncoder::new(
            &vs / "encoder",
            config.in_channels,
            config.cond_channels,
            config.levels.len(),
        );
        let flow = MaCow::new(&vs / "flow", config)?;
        Ok(Self { encoder, flow, sigmoid: SigmoidFlow, n_bits })
    }

    /// Image levels centered around zero.
    fn centered(&self, images: &Tensor) -> Tensor {
        images.to_kind(Kind::Float) / (1i64 << self.n_bits) as f64 - 0.5
    }

    fn run(
        &self,
        images: &Tensor,
        nsamples: i64,
        init_scale: Option<f64>,
    ) -> Result<(Tensor, Tensor)> {
        let batch = images.size()[0];
        let xs = self.centered(images);
        let features = match init_scale {
            None => self.encoder.forward(&xs),
            Some(init_scale) => self.encoder.init(&xs, init_scale)?,
        };
        let cond = repeat_samples(&features, nsamples)?;
        let eps = repeat_samples(&xs, nsamples)?.randn_like();
        let (ys, flow_logdet) = match init_scale {
            None => self.flow.forward(&eps, Some(&cond))?,
            Some(init_scale) => self.flow.init(&eps, Some(&cond), init_scale)?,
        };
        let (u, sigmoid_logdet) = self.sigmoid.forward(&ys, None)?;
        let log_q = standard_normal_log_density(&eps) - flow_logdet - sigmoid_logdet;
        Ok((u, log_q.view([batch, nsamples])))
    }
}

impl Dequantizer for VariationalDequantizer {
    fn dequantize(&self, images: &Tensor, nsamples: i64) -> Result<(Tensor, Tensor)> {
        self.run(images, nsamples, None)
    }

    fn init(&self, images: &Tensor, init_scale: f64) -> Result<()> {
        self.run(images, 1, Some(init_scale))?;
        Ok(())
    }
}

pub fn build(vs: nn::Path, config: &DequantConfig, n_bits: u32) -> Result<Box<dyn Dequantizer>> {
    let dequantizer: Box<dyn Dequantizer> = match config {
        DequantConfig::Uniform => Box::new(UniformDequantizer),
        DequantConfig::Variational { flow } => {
            Box::new(VariationalDequantizer::new(vs, flow, n_bits)?)
        }
    };
    Ok(dequantizer)
}
