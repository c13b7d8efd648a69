//! # MaCow multi-scale flow
//!
//! The flow is a stack of levels. Each level squeezes the image (trading
//! spatial resolution for channels) and runs a sequence of steps. Internal
//! levels then factor channels out to the Gaussian prior: with a factor `f`,
//! `f - 1` groups of steps each end with a prior coupling and hand `c / f`
//! channels over to the latent. The optional bottom level works at full
//! resolution and the last level keeps all its channels.
//! Each step is made of MaCow units, i.e. masked convolution flows scanning
//! in the four directions, followed by a Glow step.
//!
//! MaCow: Masked Convolutional Generative Flow, Ma et al. 2019.
//! https://arxiv.org/abs/1902.04208
use crate::flows::{
    actnorm::ActNorm2d,
    check_shape,
    conv1x1::InvConv1x1,
    coupling::{CouplingConfig, Mask, MaskKind, MaskedCoupling},
    masked_conv::{MaskedConvConfig, MaskedConvFlow, Order},
    sequential::{zero_logdet, FlowSequence, Pass},
    squeeze::{split2d, squeeze2d, unsplit2d, unsqueeze2d},
    standard_normal_log_density, Flow,
};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use tch::{nn, Device, Kind, Tensor};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelConfig {
    /// Steps run before each split, or in total for levels that do not split.
    pub num_steps: usize,
    pub hidden_channels: i64,
    /// The level factors out `factor - 1` slices of `c / factor` channels.
    /// Ignored by the bottom and last levels.
    #[serde(default = "default_factor")]
    pub factor: usize,
}

fn default_factor() -> usize {
    2
}

impl LevelConfig {
    pub fn new(num_steps: usize, hidden_channels: i64) -> Self {
        Self { num_steps, hidden_channels, factor: default_factor() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaCowConfig {
    pub in_channels: i64,
    pub height: i64,
    pub width: i64,
    pub levels: Vec<LevelConfig>,
    /// Kernel of the masked convolutions: lines looked at, then width.
    pub kernel_size: (i64, i64),
    /// Number of MaCow units in front of the Glow part of each step.
    pub num_units: usize,
    pub coupling_mask: MaskKind,
    /// Channels of the conditioning tensor, 0 for an unconditioned flow.
    #[serde(default)]
    pub cond_channels: i64,
    pub scale_bound: f64,
    /// When set the first level works at full resolution, without squeezing.
    pub bottom: bool,
}

impl Default for MaCowConfig {
    fn default() -> Self {
        Self {
            in_channels: 3,
            height: 32,
            width: 32,
            levels: vec![
                LevelConfig::new(2, 96),
                LevelConfig::new(4, 256),
                LevelConfig::new(4, 256),
            ],
            kernel_size: (2, 3),
            num_units: 2,
            coupling_mask: MaskKind::Checkerboard,
            cond_channels: 0,
            scale_bound: 2.,
            bottom: true,
        }
    }
}

impl MaCowConfig {
    /// A single level flow conditioned on 16 feature maps at the image
    /// resolution, as used by the variational dequantizer.
    pub fn dequantizer(in_channels: i64, height: i64, width: i64) -> Self {
        Self {
            in_channels,
            height,
            width,
            levels: vec![LevelConfig::new(2, 64)],
            kernel_size: (2, 3),
            num_units: 1,
            coupling_mask: MaskKind::Checkerboard,
            cond_channels: 16,
            scale_bound: 2.,
            bottom: true,
        }
    }

    /// Number of levels that start with a squeeze.
    pub fn squeezes(&self) -> usize {
        (0..self.levels.len()).filter(|&i| self.squeezes_at(i)).count()
    }

    fn squeezes_at(&self, level: usize) -> bool {
        level > 0 || !self.bottom
    }

    /// Whether a level factors channels out, only internal levels do.
    fn splits_at(&self, level: usize) -> bool {
        level + 1 < self.levels.len() && self.squeezes_at(level)
    }

    /// Number of dimensions of an example.
    pub fn dims(&self) -> i64 {
        self.in_channels * self.height * self.width
    }

    pub fn validate(&self) -> Result<()> {
        if self.levels.is_empty() {
            return Err(Error::Config("a flow needs at least one level".to_string()));
        }
        if self.in_channels < 1 || self.cond_channels < 0 {
            return Err(Error::Config(format!(
                "invalid channels: {} in, {} cond",
                self.in_channels, self.cond_channels
            )));
        }
        if let Some(level) = self.levels.iter().find(|l| l.hidden_channels < 1) {
            return Err(Error::Config(format!("invalid hidden channels {}", level.hidden_channels)));
        }
        if self.scale_bound <= 0. {
            return Err(Error::Config(format!("invalid scale bound {}", self.scale_bound)));
        }
        let factor = 1i64 << self.squeezes();
        let (h, w) = (self.height, self.width);
        if h < 1 || w < 1 || h % factor != 0 || w % factor != 0 {
            return Err(Error::Config(format!(
                "image size {h}x{w} is not divisible by {factor}"
            )));
        }
        let mut c = self.in_channels;
        for (i, level) in self.levels.iter().enumerate() {
            if self.squeezes_at(i) {
                c *= 4;
            }
            if self.splits_at(i) {
                let factor = level.factor as i64;
                if factor < 2 || c % factor != 0 {
                    return Err(Error::Config(format!(
                        "level {i} cannot factor {c} channels by {factor}"
                    )));
                }
                c /= factor;
            }
        }
        Ok(())
    }
}

/// Latent representation of a batch: one piece per split, then the output of
/// the last level.
#[derive(Debug)]
pub struct Latents {
    pieces: Vec<Tensor>,
}

impl Latents {
    pub fn new(pieces: Vec<Tensor>) -> Self {
        Self { pieces }
    }

    pub fn pieces(&self) -> &[Tensor] {
        &self.pieces
    }

    pub fn into_pieces(self) -> Vec<Tensor> {
        self.pieces
    }

    pub fn shapes(&self) -> Vec<Vec<i64>> {
        self.pieces.iter().map(|p| p.size()).collect()
    }

    /// Standard normal log-density summed over all the pieces, `[batch]`.
    pub fn log_density(&self) -> Tensor {
        self.pieces
            .iter()
            .map(standard_normal_log_density)
            .reduce(|acc, d| acc + d)
            .unwrap_or_else(|| Tensor::zeros([0], (Kind::Float, Device::Cpu)))
    }
}

fn macow_unit(
    vs: nn::Path,
    shape: (i64, i64, i64),
    config: MaskedConvConfig,
) -> Result<FlowSequence> {
    let mcf = |name: &str, order| MaskedConvFlow::new(&vs / name, shape, order, config);
    Ok(FlowSequence::new()
        .add(ActNorm2d::new(&vs / "actnorm1", shape))
        .add(mcf("conv_a", Order::A)?)
        .add(mcf("conv_b", Order::B)?)
        .add(ActNorm2d::new(&vs / "actnorm2", shape))
        .add(mcf("conv_c", Order::C)?)
        .add(mcf("conv_d", Order::D)?))
}

#[derive(Debug, Clone, Copy)]
struct StepConfig {
    num_units: usize,
    mask: MaskKind,
    masked_conv: MaskedConvConfig,
    coupling: CouplingConfig,
}

fn macow_step(
    vs: nn::Path,
    index: usize,
    shape: (i64, i64, i64),
    config: StepConfig,
) -> Result<FlowSequence> {
    let vs_units = &vs / "units";
    let mut step = FlowSequence::new();
    for i in 0..config.num_units {
        step = step.add(macow_unit(&vs_units / i, shape, config.masked_conv)?);
    }
    let mask = Mask::new(config.mask, index, shape, vs.device())?;
    Ok(step
        .add(ActNorm2d::new(&vs / "actnorm", shape))
        .add(InvConv1x1::new(&vs / "conv1x1", shape))
        .add(MaskedCoupling::new(&vs / "coupling", shape, mask, config.coupling)))
}

/// Coupling of the factored channels on the retained ones, run before
/// splitting them off.
#[derive(Debug)]
struct Split {
    prior: MaskedCoupling,
    retained: i64,
}

#[derive(Debug)]
struct Stage {
    steps: FlowSequence,
    split: Option<Split>,
}

#[derive(Debug)]
struct Level {
    squeeze: bool,
    stages: Vec<Stage>,
}

#[derive(Debug)]
pub struct MaCow {
    levels: Vec<Level>,
    /// Per-example shapes of the latent pieces.
    latent_dims: Vec<(i64, i64, i64)>,
    config: MaCowConfig,
    device: Device,
}

impl MaCow {
    pub fn new(vs: nn::Path, config: &MaCowConfig) -> Result<Self> {
        config.validate()?;
        let (mut c, mut h, mut w) = (config.in_channels, config.height, config.width);
        let mut cond_channels = config.cond_channels;
        let vs_levels = &vs / "levels";
        let mut levels = Vec::with_capacity(config.levels.len());
        let mut latent_dims = vec![];
        for (i, level_cfg) in config.levels.iter().enumerate() {
            let vs = &vs_levels / i;
            let squeeze = config.squeezes_at(i);
            if squeeze {
                (c, h, w) = (4 * c, h / 2, w / 2);
                cond_channels *= 4;
            }
            let coupling = CouplingConfig {
                hidden_channels: level_cfg.hidden_channels,
                cond_channels,
                scale_bound: config.scale_bound,
            };
            let step_cfg = StepConfig {
                num_units: config.num_units,
                mask: config.coupling_mask,
                masked_conv: MaskedConvConfig {
                    kernel_size: config.kernel_size,
                    hidden_channels: level_cfg.hidden_channels,
                    cond_channels,
                    scale_bound: config.scale_bound,
                },
                coupling,
            };
            let (vs_steps, vs_priors) = (&vs / "steps", &vs / "priors");
            let (groups, slice) = if config.splits_at(i) {
                (level_cfg.factor - 1, c / level_cfg.factor as i64)
            } else {
                (1, 0)
            };
            let mut stages = Vec::with_capacity(groups);
            let mut index = 0;
            for g in 0..groups {
                let shape = (c, h, w);
                let mut steps = FlowSequence::new();
                for _ in 0..level_cfg.num_steps {
                    steps = steps.add(macow_step(&vs_steps / index, index, shape, step_cfg)?);
                    index += 1;
                }
                let split = if slice > 0 {
                    let retained = c - slice;
                    let mask = Mask::split(retained, shape, vs.device())?;
                    let prior = MaskedCoupling::new(&vs_priors / g, shape, mask, coupling);
                    latent_dims.push((slice, h, w));
                    c = retained;
                    Some(Split { prior, retained })
                } else {
                    None
                };
                stages.push(Stage { steps, split });
            }
            tracing::debug!(level = i, squeeze, steps = index, stages = groups, "built level");
            levels.push(Level { squeeze, stages });
        }
        latent_dims.push((c, h, w));
        Ok(Self { levels, latent_dims, config: config.clone(), device: vs.device() })
    }

    pub fn config(&self) -> &MaCowConfig {
        &self.config
    }

    pub fn device(&self) -> Device {
        self.device
    }

    /// Shapes of the latent pieces for a given batch size.
    pub fn latent_shapes(&self, batch: i64) -> Vec<Vec<i64>> {
        self.latent_dims.iter().map(|&(c, h, w)| vec![batch, c, h, w]).collect()
    }

    /// Checks the input and conditioning tensors, then returns the
    /// conditioning seen by each level.
    fn level_conds(&self, batch: i64, cond: Option<&Tensor>) -> Result<Vec<Option<Tensor>>> {
        let cfg = &self.config;
        let mut cond = match cond {
            Some(cond) => {
                let cond_batch =
                    check_shape("macow cond", cond, (cfg.cond_channels, cfg.height, cfg.width))?;
                if cond_batch != batch {
                    return Err(Error::shape(
                        "macow cond",
                        &[batch, cfg.cond_channels, cfg.height, cfg.width],
                        &cond.size(),
                    ));
                }
                Some(cond.shallow_clone())
            }
            None if cfg.cond_channels > 0 => {
                return Err(Error::InvalidInput("macow: missing conditioning tensor".to_string()))
            }
            None => None,
        };
        let mut conds = Vec::with_capacity(self.levels.len());
        for level in self.levels.iter() {
            if level.squeeze {
                cond = cond.as_ref().map(squeeze2d).transpose()?;
            }
            conds.push(cond.as_ref().map(Tensor::shallow_clone));
        }
        Ok(conds)
    }

    fn run(&self, pass: Pass, xs: &Tensor, cond: Option<&Tensor>) -> Result<(Latents, Tensor)> {
        let cfg = &self.config;
        let batch = check_shape("macow", xs, (cfg.in_channels, cfg.height, cfg.width))?;
        let conds = self.level_conds(batch, cond)?;
        let mut logdet = zero_logdet(xs);
        let mut out = xs.shallow_clone();
        let mut pieces = Vec::with_capacity(self.latent_dims.len());
        for (level, cond) in self.levels.iter().zip(conds.iter()) {
            if level.squeeze {
                out = squeeze2d(&out)?;
            }
            for stage in level.stages.iter() {
                let (ys, steps_logdet) = stage.steps.run(pass, &out, cond.as_ref())?;
                (out, logdet) = (ys, logdet + steps_logdet);
                if let Some(split) = &stage.split {
                    let (ys, prior_logdet) = pass.apply(&split.prior, &out, cond.as_ref())?;
                    logdet = logdet + prior_logdet;
                    let (retained, factored) = split2d(&ys, split.retained)?;
                    pieces.push(factored);
                    out = retained;
                }
            }
        }
        pieces.push(out);
        Ok((Latents::new(pieces), logdet))
    }

    /// Maps a batch of images to its latent pieces, along with the
    /// log-determinant of the whole transformation.
    pub fn encode(&self, xs: &Tensor, cond: Option<&Tensor>) -> Result<(Latents, Tensor)> {
        self.run(Pass::Forward, xs, cond)
    }

    fn check_latents(&self, latents: &Latents) -> Result<i64> {
        let batch = latents.pieces().first().map_or(0, |p| p.size()[0]);
        let expected = self.latent_shapes(batch);
        let actual = latents.shapes();
        if expected != actual {
            return Err(Error::InvalidInput(format!(
                "latent shapes {actual:?} do not match {expected:?}"
            )));
        }
        Ok(batch)
    }

    pub fn decode(&self, latents: &Latents, cond: Option<&Tensor>) -> Result<Tensor> {
        let batch = self.check_latents(latents)?;
        let conds = self.level_conds(batch, cond)?;
        let mut pieces = latents.pieces().iter().rev();
        let mut out = next_piece(&mut pieces)?.shallow_clone();
        for (level, cond) in self.levels.iter().zip(conds.iter()).rev() {
            for stage in level.stages.iter().rev() {
                if let Some(split) = &stage.split {
                    let ys = unsplit2d(&out, next_piece(&mut pieces)?);
                    out = split.prior.inverse(&ys, cond.as_ref())?;
                }
                out = stage.steps.inverse(&out, cond.as_ref())?;
            }
            if level.squeeze {
                out = unsqueeze2d(&out)?;
            }
        }
        Ok(out)
    }

    /// Lays the latent pieces back in a single tensor shaped as the input.
    pub fn pack(&self, latents: &Latents) -> Result<Tensor> {
        self.check_latents(latents)?;
        let mut pieces = latents.pieces().iter().rev();
        let mut out = next_piece(&mut pieces)?.shallow_clone();
        for level in self.levels.iter().rev() {
            for _ in level.stages.iter().filter(|stage| stage.split.is_some()) {
                out = unsplit2d(&out, next_piece(&mut pieces)?);
            }
            if level.squeeze {
                out = unsqueeze2d(&out)?;
            }
        }
        Ok(out)
    }

    pub fn unpack(&self, zs: &Tensor) -> Result<Latents> {
        let cfg = &self.config;
        check_shape("macow", zs, (cfg.in_channels, cfg.height, cfg.width))?;
        let mut out = zs.shallow_clone();
        let mut pieces = Vec::with_capacity(self.latent_dims.len());
        for level in self.levels.iter() {
            if level.squeeze {
                out = squeeze2d(&out)?;
            }
            for split in level.stages.iter().filter_map(|stage| stage.split.as_ref()) {
                let (retained, factored) = split2d(&out, split.retained)?;
                pieces.push(factored);
                out = retained;
            }
        }
        pieces.push(out);
        Ok(Latents::new(pieces))
    }

    /// Draws latents from the prior, scaled by `temperature`.
    pub fn sample_latents(&self, batch: i64, temperature: f64) -> Latents {
        let pieces = self
            .latent_shapes(batch)
            .iter()
            .map(|shape| Tensor::randn(shape.as_slice(), (Kind::Float, self.device)) * temperature)
            .collect();
        Latents::new(pieces)
    }
}

fn next_piece<'a>(pieces: &mut impl Iterator<Item = &'a Tensor>) -> Result<&'a Tensor> {
    pieces.next().ok_or_else(|| Error::InvalidInput("missing latent piece".to_string()))
}

impl Flow for MaCow {
    fn forward(&self, xs: &Tensor, cond: Option<&Tensor>) -> Result<(Tensor, Tensor)> {
        let (latents, logdet) = self.encode(xs, cond)?;
        Ok((self.pack(&latents)?, logdet))
    }

    fn inverse(&self, ys: &Tensor, cond: Option<&Tensor>) -> Result<Tensor> {
        self.decode(&self.unpack(ys)?, cond)
    }

    fn init(
        &self,
        xs: &Tensor,
        cond: Option<&Tensor>,
        init_scale: f64,
    ) -> Result<(Tensor, Tensor)> {
        let (latents, logdet) = self.run(Pass::Init(init_scale), xs, cond)?;
        Ok((self.pack(&latents)?, logdet))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flows::testing;

    fn toy_config() -> MaCowConfig {
        MaCowConfig {
            in_channels: 2,
            height: 4,
            width: 4,
            levels: vec![LevelConfig::new(2, 8), LevelConfig::new(1, 8)],
            kernel_size: (2, 3),
            num_units: 1,
            coupling_mask: MaskKind::Checkerboard,
            cond_channels: 0,
            scale_bound: 2.,
            bottom: false,
        }
    }

    fn log_likelihood(model: &MaCow, xs: &Tensor) -> Tensor {
        let (latents, logdet) = model.encode(xs, None).unwrap();
        latents.log_density() + logdet
    }

    #[test]
    fn latent_shapes() {
        let vs = nn::VarStore::new(Device::Cpu);
        let model = MaCow::new(vs.root(), &toy_config()).unwrap();
        assert_eq!(model.latent_shapes(3), [vec![3, 4, 2, 2], vec![3, 16, 1, 1]]);
        let xs = Tensor::randn([3, 2, 4, 4], (Kind::Float, Device::Cpu));
        let (latents, logdet) = model.encode(&xs, None).unwrap();
        assert_eq!(latents.shapes(), model.latent_shapes(3));
        assert_eq!(logdet.size(), [3]);

        // The bottom level keeps all its channels at full resolution.
        let config = MaCowConfig { bottom: true, ..toy_config() };
        let model = MaCow::new(vs.root() / "bottom", &config).unwrap();
        assert_eq!(model.latent_shapes(1), [vec![1, 8, 2, 2]]);
        let config = MaCowConfig {
            bottom: true,
            height: 8,
            width: 8,
            levels: vec![LevelConfig::new(1, 8); 3],
            ..toy_config()
        };
        let model = MaCow::new(vs.root() / "bottom3", &config).unwrap();
        assert_eq!(model.latent_shapes(1), [vec![1, 4, 4, 4], vec![1, 16, 2, 2]]);
    }

    fn factor_config(factor: usize) -> MaCowConfig {
        MaCowConfig {
            in_channels: 3,
            levels: vec![LevelConfig { factor, ..LevelConfig::new(1, 8) }, LevelConfig::new(1, 8)],
            ..toy_config()
        }
    }

    #[test]
    fn factored_level_splits_several_times() {
        tch::manual_seed(18);
        let vs = nn::VarStore::new(Device::Cpu);
        // 12 channels after the squeeze, factored out in slices of 4.
        let model = MaCow::new(vs.root(), &factor_config(3)).unwrap();
        assert_eq!(
            model.latent_shapes(2),
            [vec![2, 4, 2, 2], vec![2, 4, 2, 2], vec![2, 16, 1, 1]]
        );
        let names = vs.variables();
        assert!(names.contains_key("levels.0.steps.1.conv1x1.weight"));
        assert!(names.contains_key("levels.0.priors.1.net.conv3.weight"));
        assert!(!names.contains_key("levels.0.priors.2.net.conv3.weight"));

        testing::perturb(&vs, 0.05);
        let xs = Tensor::randn([2, 3, 4, 4], (Kind::Float, Device::Cpu));
        let (latents, logdet) = model.encode(&xs, None).unwrap();
        assert_eq!(latents.shapes(), model.latent_shapes(2));
        assert_eq!(logdet.size(), [2]);
        assert!(model.decode(&latents, None).unwrap().allclose(&xs, 1e-4, 1e-4, false));
        let zs = Tensor::randn([2, 3, 4, 4], (Kind::Float, Device::Cpu));
        assert!(model.pack(&model.unpack(&zs).unwrap()).unwrap().equal(&zs));
        testing::assert_round_trip(&model, &xs, None);
        testing::assert_logdet_matches_jacobian(&model, &xs.narrow(0, 0, 1), None);
    }

    #[test]
    fn single_channel_bottom_level() {
        tch::manual_seed(19);
        let vs = nn::VarStore::new(Device::Cpu);
        let config = MaCowConfig { in_channels: 1, bottom: true, ..toy_config() };
        let model = MaCow::new(vs.root(), &config).unwrap();
        assert_eq!(model.latent_shapes(2), [vec![2, 4, 2, 2]]);
        testing::perturb(&vs, 0.05);
        let xs = Tensor::randn([2, 1, 4, 4], (Kind::Float, Device::Cpu));
        testing::assert_round_trip(&model, &xs, None);
        testing::assert_logdet_matches_jacobian(&model, &xs.narrow(0, 0, 1), None);
    }

    #[test]
    fn pack_and_unpack() {
        let vs = nn::VarStore::new(Device::Cpu);
        let model = MaCow::new(vs.root(), &toy_config()).unwrap();
        let zs = Tensor::randn([2, 2, 4, 4], (Kind::Float, Device::Cpu));
        let latents = model.unpack(&zs).unwrap();
        assert_eq!(latents.shapes(), model.latent_shapes(2));
        assert!(model.pack(&latents).unwrap().equal(&zs));
        let wrong = Latents::new(vec![zs.shallow_clone()]);
        assert!(matches!(model.pack(&wrong), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn round_trip_and_logdet() {
        tch::manual_seed(13);
        let vs = nn::VarStore::new(Device::Cpu);
        let model = MaCow::new(vs.root(), &toy_config()).unwrap();
        testing::perturb(&vs, 0.05);
        let xs = Tensor::randn([2, 2, 4, 4], (Kind::Float, Device::Cpu));
        testing::assert_round_trip(&model, &xs, None);
        testing::assert_logdet_matches_jacobian(&model, &xs.narrow(0, 0, 1), None);
        let (latents, _) = model.encode(&xs, None).unwrap();
        let xs_ = model.decode(&latents, None).unwrap();
        assert!(xs_.allclose(&xs, 1e-4, 1e-4, false));
    }

    #[test]
    fn init_normalizes_and_stays_invertible() {
        tch::manual_seed(14);
        let vs = nn::VarStore::new(Device::Cpu);
        let model = MaCow::new(vs.root(), &toy_config()).unwrap();
        let xs = Tensor::randn([8, 2, 4, 4], (Kind::Float, Device::Cpu)) * 3. + 1.;
        let (zs, logdet) = tch::no_grad(|| model.init(&xs, None, 1.)).unwrap();
        assert!(logdet.isfinite().all().int64_value(&[]) == 1);
        // The first actnorm scales the data down by about 3.
        assert!(logdet.double_value(&[0]) < 0.);
        assert!(zs.std(true).double_value(&[]) < 2.);
        testing::assert_round_trip(&model, &xs, None);
    }

    #[test]
    fn conditional_flow() {
        tch::manual_seed(15);
        let vs = nn::VarStore::new(Device::Cpu);
        let config = MaCowConfig { cond_channels: 3, ..toy_config() };
        let model = MaCow::new(vs.root(), &config).unwrap();
        testing::perturb(&vs, 0.05);
        let xs = Tensor::randn([2, 2, 4, 4], (Kind::Float, Device::Cpu));
        let cond = Tensor::randn([2, 3, 4, 4], (Kind::Float, Device::Cpu));
        testing::assert_round_trip(&model, &xs, Some(&cond));
        let (_, l1) = model.forward(&xs, Some(&cond)).unwrap();
        let (_, l2) = model.forward(&xs, Some(&cond.zeros_like())).unwrap();
        assert!(!l1.allclose(&l2, 1e-6, 1e-6, false));
        assert!(matches!(model.forward(&xs, None), Err(Error::InvalidInput(_))));
        let cond = Tensor::randn([1, 3, 4, 4], (Kind::Float, Device::Cpu));
        assert!(matches!(model.forward(&xs, Some(&cond)), Err(Error::ShapeMismatch { .. })));
    }

    #[test]
    fn likelihood_is_deterministic_and_depends_on_parameters() {
        let xs = Tensor::randn([2, 2, 4, 4], (Kind::Float, Device::Cpu));
        let build = || {
            tch::manual_seed(16);
            let vs = nn::VarStore::new(Device::Cpu);
            let model = MaCow::new(vs.root(), &toy_config()).unwrap();
            testing::perturb(&vs, 0.05);
            (vs, model)
        };
        let (_vs1, model1) = build();
        let (vs2, model2) = build();
        let ll1 = log_likelihood(&model1, &xs);
        assert!(ll1.equal(&log_likelihood(&model2, &xs)));
        testing::perturb(&vs2, 0.05);
        assert!(!ll1.allclose(&log_likelihood(&model2, &xs), 1e-6, 1e-6, false));
    }

    #[test]
    fn gradients_reach_every_level() {
        tch::manual_seed(17);
        let vs = nn::VarStore::new(Device::Cpu);
        let model = MaCow::new(vs.root(), &toy_config()).unwrap();
        testing::perturb(&vs, 0.05);
        let xs = Tensor::randn([2, 2, 4, 4], (Kind::Float, Device::Cpu));
        log_likelihood(&model, &xs).sum(Kind::Float).backward();
        for (name, var) in vs.variables() {
            // Level 1 works on 1x1 images where some checkerboard couplings
            // have nothing to transform.
            if name.starts_with("levels.0.") && name.ends_with("conv3.weight") {
                let norm = var.grad().norm().double_value(&[]);
                assert!(norm > 0., "no gradient for {name}");
            }
        }
    }

    #[test]
    fn temperature_scales_samples() {
        let vs = nn::VarStore::new(Device::Cpu);
        let model = MaCow::new(vs.root(), &toy_config()).unwrap();
        let latents = model.sample_latents(3, 0.);
        assert_eq!(latents.shapes(), model.latent_shapes(3));
        assert!(latents.pieces().iter().all(|p| p.abs().max().double_value(&[]) == 0.));
    }

    #[test]
    fn invalid_configs() {
        let vs = nn::VarStore::new(Device::Cpu);
        let invalid = [
            MaCowConfig { levels: vec![], ..toy_config() },
            MaCowConfig { height: 6, ..toy_config() },
            MaCowConfig { kernel_size: (2, 2), ..toy_config() },
            MaCowConfig { levels: vec![LevelConfig::new(1, 0)], ..toy_config() },
            // 8 channels after the squeeze.
            MaCowConfig {
                levels: vec![LevelConfig { factor: 3, ..LevelConfig::new(1, 8) }; 2],
                ..toy_config()
            },
            MaCowConfig {
                levels: vec![LevelConfig { factor: 1, ..LevelConfig::new(1, 8) }; 2],
                ..toy_config()
            },
        ];
        for config in invalid.iter() {
            let model = MaCow::new(vs.root(), config);
            assert!(matches!(model, Err(Error::Config(_))), "{config:?}");
        }
    }
}
