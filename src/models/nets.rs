//! Convolutional sub-networks predicting the scale and shift of the affine
//! flows. Their last layer starts at zero so that a freshly built flow is the
//! identity map.
use crate::{Error, Result};
use tch::{nn, nn::Module, Kind, Tensor};

#[derive(Debug, Clone, Copy)]
pub struct NetConfig {
    pub hidden_channels: i64,
    /// Number of channels of the conditioning tensor, 0 when unconditioned.
    pub cond_channels: i64,
}

fn zero_conv(vs: nn::Path, in_channels: i64, out_channels: i64, ksize: i64) -> nn::Conv2D {
    let conv_cfg = nn::ConvConfig {
        padding: ksize / 2,
        ws_init: nn::Init::Const(0.),
        bs_init: nn::Init::Const(0.),
        ..Default::default()
    };
    nn::conv2d(vs, in_channels, out_channels, ksize, conv_cfg)
}

pub(crate) fn check_cond(
    unit: &'static str,
    cond: Option<&Tensor>,
    cond_channels: i64,
) -> Result<()> {
    match cond {
        None if cond_channels == 0 => Ok(()),
        Some(cond) if cond.size().get(1) == Some(&cond_channels) => Ok(()),
        Some(cond) => Err(Error::shape(unit, &[-1, cond_channels, -1, -1], &cond.size())),
        None => Err(Error::InvalidInput(format!("{unit}: missing conditioning tensor"))),
    }
}

/// conv3x3 -> ELU -> conv1x1 -> ELU -> conv3x3, the input being concatenated
/// with the conditioning tensor if any.
#[derive(Debug)]
pub struct CouplingNet {
    conv1: nn::Conv2D,
    conv2: nn::Conv2D,
    conv3: nn::Conv2D,
}

impl CouplingNet {
    pub fn new(vs: nn::Path, in_channels: i64, out_channels: i64, config: NetConfig) -> Self {
        let hidden = config.hidden_channels;
        let conv_cfg = nn::ConvConfig { padding: 1, ..Default::default() };
        let in_channels = in_channels + config.cond_channels;
        let conv1 = nn::conv2d(&vs / "conv1", in_channels, hidden, 3, conv_cfg);
        let conv2 = nn::conv2d(&vs / "conv2", hidden, hidden, 1, Default::default());
        let conv3 = zero_conv(&vs / "conv3", hidden, out_channels, 3);
        Self { conv1, conv2, conv3 }
    }

    pub fn forward(&self, xs: &Tensor, cond: Option<&Tensor>) -> Tensor {
        let xs = match cond {
            Some(cond) => Tensor::cat(&[xs, cond], 1),
            None => xs.shallow_clone(),
        };
        xs.apply(&self.conv1).elu().apply(&self.conv2).elu().apply(&self.conv3)
    }
}

/// Network of the autoregressive masked convolution flow. The first
/// convolution only looks at the rows strictly above each position, the
/// following layers are 1x1 convolutions so the whole network keeps that
/// property. The conditioning tensor is fully visible and added through a
/// 1x1 projection.
#[derive(Debug)]
pub struct MaskedConvNet {
    weight: Tensor,
    bias: Tensor,
    cond_proj: Option<nn::Conv2D>,
    conv2: nn::Conv2D,
    conv3: nn::Conv2D,
    kernel_size: (i64, i64),
}

impl MaskedConvNet {
    pub fn new(
        vs: nn::Path,
        in_channels: i64,
        out_channels: i64,
        kernel_size: (i64, i64),
        config: NetConfig,
    ) -> Self {
        let hidden = config.hidden_channels;
        let (kh, kw) = kernel_size;
        let bound = 1. / ((in_channels * kh * kw) as f64).sqrt();
        let init = nn::Init::Uniform { lo: -bound, up: bound };
        let masked = &vs / "masked_conv";
        let weight = masked.var("weight", &[hidden, in_channels, kh, kw], init);
        let bias = masked.var("bias", &[hidden], init);
        let cond_proj = (config.cond_channels > 0).then(|| {
            let conv_cfg = nn::ConvConfig { bias: false, ..Default::default() };
            nn::conv2d(&vs / "cond_proj", config.cond_channels, hidden, 1, conv_cfg)
        });
        let conv2 = nn::conv2d(&vs / "conv2", hidden, hidden, 1, Default::default());
        let conv3 = zero_conv(&vs / "conv3", hidden, out_channels, 1);
        Self { weight, bias, cond_proj, conv2, conv3, kernel_size }
    }

    pub fn forward(&self, xs: &Tensor, cond: Option<&Tensor>) -> Tensor {
        let (kh, kw) = self.kernel_size;
        let height = xs.size()[2];
        // Pad kh rows on top and none at the bottom, the extra output row
        // then only depends on the last input rows and is dropped.
        let xs = xs.pad([kw / 2, kw / 2, kh, 0], "constant", Some(0.)).conv2d(
            &self.weight,
            Some(&self.bias),
            [1, 1],
            [0, 0],
            [1, 1],
            1,
        );
        let xs = xs.narrow(2, 0, height);
        let xs = match (cond, &self.cond_proj) {
            (Some(cond), Some(cond_proj)) => xs + cond_proj.forward(cond),
            _ => xs,
        };
        xs.elu().apply(&self.conv2).elu().apply(&self.conv3)
    }
}

/// Rescales a convolution so that `out`, its output on some batch, gets zero
/// mean and a standard deviation of `init_scale` on every channel. Returns
/// the rescaled output. Transposed convolutions store their output channels
/// in the second dimension of the weight.
fn normalize_conv(
    ws: &Tensor,
    bs: Option<&Tensor>,
    out: &Tensor,
    init_scale: f64,
    transposed: bool,
) -> Result<Tensor> {
    tch::no_grad(|| -> Result<Tensor> {
        let dims = Some([0, 2, 3].as_slice());
        let mean = out.mean_dim(dims, false, Kind::Float);
        let centered = out - mean.view([1, -1, 1, 1]);
        let std = centered.square().mean_dim(dims, false, Kind::Float).sqrt();
        let scale = init_scale / (std + 1e-6);
        let ws_shape = if transposed { [1, -1, 1, 1] } else { [-1, 1, 1, 1] };
        let ws_scale = scale.view(ws_shape);
        ws.shallow_clone().f_copy_(&(ws * ws_scale))?;
        if let Some(bs) = bs {
            bs.shallow_clone().f_copy_(&((bs - &mean) * &scale))?;
        }
        Ok(centered * scale.view([1, -1, 1, 1]))
    })
}

fn conv3x3(vs: nn::Path, in_channels: i64, out_channels: i64, stride: i64) -> nn::Conv2D {
    let conv_cfg = nn::ConvConfig { stride, padding: 1, ..Default::default() };
    nn::conv2d(vs, in_channels, out_channels, 3, conv_cfg)
}

#[derive(Debug)]
struct ResBlock {
    conv1: nn::Conv2D,
    conv2: nn::Conv2D,
}

impl ResBlock {
    fn new(vs: nn::Path, channels: i64) -> Self {
        let conv1 = conv3x3(&vs / "conv1", channels, channels, 1);
        let conv2 = conv3x3(&vs / "conv2", channels, channels, 1);
        Self { conv1, conv2 }
    }

    fn forward(&self, xs: &Tensor) -> Tensor {
        let ys = xs.apply(&self.conv1).elu().apply(&self.conv2);
        (xs + ys).elu()
    }

    fn init(&self, xs: &Tensor, init_scale: f64) -> Result<Tensor> {
        let (c1, c2) = (&self.conv1, &self.conv2);
        let ys = normalize_conv(&c1.ws, c1.bs.as_ref(), &xs.apply(c1), init_scale, false)?;
        let ys = ys.elu();
        let ys = normalize_conv(&c2.ws, c2.bs.as_ref(), &ys.apply(c2), init_scale, false)?;
        Ok((xs + ys).elu())
    }
}

#[derive(Debug)]
enum EncoderLayer {
    Down(nn::Conv2D),
    Residual(ResBlock),
    Up(nn::ConvTranspose2D),
    Project(nn::Conv2D),
}

impl EncoderLayer {
    fn forward(&self, xs: &Tensor) -> Tensor {
        match self {
            Self::Down(conv) => xs.apply(conv).elu(),
            Self::Residual(block) => block.forward(xs),
            Self::Up(conv) => xs.apply(conv).elu(),
            Self::Project(conv) => xs.apply(conv),
        }
    }

    fn init(&self, xs: &Tensor, init_scale: f64) -> Result<Tensor> {
        let ys = match self {
            Self::Down(conv) => {
                normalize_conv(&conv.ws, conv.bs.as_ref(), &xs.apply(conv), init_scale, false)?
                    .elu()
            }
            Self::Residual(block) => block.init(xs, init_scale)?,
            Self::Up(conv) => {
                normalize_conv(&conv.ws, conv.bs.as_ref(), &xs.apply(conv), init_scale, true)?
                    .elu()
            }
            Self::Project(conv) => {
                normalize_conv(&conv.ws, conv.bs.as_ref(), &xs.apply(conv), init_scale, false)?
            }
        };
        Ok(ys)
    }
}

/// Learned features of the image conditioning the dequantization flow.
///
/// `depth` strided 3x3 convolutions, each followed by two residual blocks,
/// go down to maps `2^depth` times smaller with 24, 48, then 96 channels.
/// Transposed convolutions bring them back to full resolution and a 1x1
/// convolution projects them to `out_channels`.
#[derive(Debug)]
pub struct CondEncoder {
    layers: Vec<EncoderLayer>,
    out_channels: i64,
}

impl CondEncoder {
    pub fn new(vs: nn::Path, in_channels: i64, out_channels: i64, depth: usize) -> Self {
        let widths: Vec<i64> = (0..depth).map(|l| (24 << l).min(96)).collect();
        let mut layers = vec![];
        let mut planes = in_channels;
        for (l, &width) in widths.iter().enumerate() {
            layers.push(EncoderLayer::Down(conv3x3(&vs / format!("down{l}"), planes, width, 2)));
            for j in 0..2 {
                let block = ResBlock::new(&vs / format!("res{l}_{j}"), width);
                layers.push(EncoderLayer::Residual(block));
            }
            planes = width;
        }
        let up_cfg = nn::ConvTransposeConfig {
            stride: 2,
            padding: 1,
            output_padding: 1,
            ..Default::default()
        };
        for l in (0..depth).rev() {
            let width = if l == 0 { out_channels } else { widths[l - 1] };
            let up = nn::conv_transpose2d(&vs / format!("up{l}"), planes, width, 3, up_cfg);
            layers.push(EncoderLayer::Up(up));
            planes = width;
        }
        let proj = nn::conv2d(&vs / "proj", planes, out_channels, 1, Default::default());
        layers.push(EncoderLayer::Project(proj));
        Self { layers, out_channels }
    }

    pub fn out_channels(&self) -> i64 {
        self.out_channels
    }

    pub fn forward(&self, xs: &Tensor) -> Tensor {
        self.layers.iter().fold(xs.shallow_clone(), |xs, layer| layer.forward(&xs))
    }

    /// Data-dependent initialization, each convolution output is normalized
    /// on `xs`. Returns the encoding of `xs` with the new parameters.
    pub fn init(&self, xs: &Tensor, init_scale: f64) -> Result<Tensor> {
        self.layers.iter().try_fold(xs.shallow_clone(), |xs, layer| layer.init(&xs, init_scale))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flows::testing;
    use tch::{Device, Kind};

    #[test]
    fn masked_conv_only_sees_rows_above() {
        tch::manual_seed(5);
        let vs = nn::VarStore::new(Device::Cpu);
        let config = NetConfig { hidden_channels: 8, cond_channels: 0 };
        let net = MaskedConvNet::new(vs.root(), 2, 4, (2, 3), config);
        testing::perturb(&vs, 0.1);
        let xs = Tensor::randn([1, 2, 5, 4], (Kind::Float, Device::Cpu));
        let ys = net.forward(&xs, None);
        assert_eq!(ys.size(), [1, 4, 5, 4]);
        // Changing row 2 must leave rows 0, 1 and 2 of the output untouched.
        let xs2 = xs.copy();
        let _ = xs2.narrow(2, 2, 1).fill_(7.);
        let ys2 = net.forward(&xs2, None);
        assert!(ys.narrow(2, 0, 3).allclose(&ys2.narrow(2, 0, 3), 1e-6, 1e-6, false));
        assert!(!ys.narrow(2, 3, 1).allclose(&ys2.narrow(2, 3, 1), 1e-6, 1e-6, false));
    }

    #[test]
    fn cond_is_checked() {
        let cond = Tensor::zeros([1, 3, 2, 2], (Kind::Float, Device::Cpu));
        assert!(check_cond("net", None, 0).is_ok());
        assert!(check_cond("net", Some(&cond), 3).is_ok());
        assert!(check_cond("net", Some(&cond), 2).is_err());
        assert!(check_cond("net", None, 3).is_err());
    }

    #[test]
    fn encoder_keeps_resolution() {
        let vs = nn::VarStore::new(Device::Cpu);
        let encoder = CondEncoder::new(vs.root(), 3, 5, 2);
        let xs = Tensor::randn([2, 3, 8, 8], (Kind::Float, Device::Cpu));
        assert_eq!(encoder.forward(&xs).size(), [2, 5, 8, 8]);
        let variables = vs.variables();
        assert_eq!(variables["down1.weight"].size(), [48, 24, 3, 3]);
        assert_eq!(variables["up1.weight"].size(), [48, 24, 3, 3]);
        assert_eq!(variables["up0.weight"].size(), [24, 5, 3, 3]);
        assert_eq!(variables["proj.weight"].size(), [5, 5, 1, 1]);
    }

    #[test]
    fn encoder_init_normalizes_outputs() {
        tch::manual_seed(9);
        let vs = nn::VarStore::new(Device::Cpu);
        let encoder = CondEncoder::new(vs.root(), 3, 4, 1);
        let xs = Tensor::randn([16, 3, 4, 4], (Kind::Float, Device::Cpu)) * 5. + 2.;
        let ys = encoder.init(&xs, 1.).unwrap();
        assert!(ys.allclose(&tch::no_grad(|| encoder.forward(&xs)), 1e-4, 1e-4, false));
        let dims = Some([0, 2, 3].as_slice());
        let mean = ys.mean_dim(dims, false, Kind::Float);
        let std = ys.std_dim(dims, false, false);
        assert!(mean.abs().max().double_value(&[]) < 1e-4);
        assert!((std - 1.).abs().max().double_value(&[]) < 1e-3);
    }
}
