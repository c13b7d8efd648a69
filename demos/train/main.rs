// Trains a MaCow model on a directory of images.
//
// The experiment is described by a json file, see `ExperimentConfig`. The
// images found in `data_path` are resized to `image_size` and reduced to
// `n_bits` bits per channel. A checkpoint and a strip of samples are written
// to `model_path` after each epoch.
//
//   cargo run --release --features clap --example train -- --config macow.json
use clap::Parser;
use macow::{
    models::flow_gen::FlowGenModel,
    pipelines::{
        checkpoint::save_checkpoint,
        experiment::ExperimentConfig,
        training::{StepOutcome, Trainer},
    },
    utils,
};
use std::path::Path;
use tch::{nn, Device, Kind, Tensor};
use tracing::info;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// The experiment configuration file.
    #[arg(long, value_name = "FILE")]
    config: String,

    /// When set, use the CPU even if some accelerator is available.
    #[arg(long)]
    cpu: bool,

    /// Number of images held out for evaluation.
    #[arg(long, default_value_t = 256)]
    eval_images: i64,

    /// Temperature used when sampling.
    #[arg(long, default_value_t = 1.0)]
    temperature: f64,
}

/// Loads the images as `Int64` levels with the configured bit depth.
fn load_images(path: &Path, channels: i64, size: i64, n_bits: u32) -> anyhow::Result<Tensor> {
    let images = tch::vision::image::load_dir(path, size, size)?.to_kind(Kind::Float);
    let images = match channels {
        3 => images,
        1 => images.mean_dim(Some([1].as_slice()), true, Kind::Float).round(),
        _ => anyhow::bail!("unsupported number of channels {channels}"),
    };
    let factor = (1i64 << (8 - n_bits)) as f64;
    Ok((images / factor).floor().to_kind(Kind::Int64))
}

/// Saves samples side by side as a single 8 bits rgb image.
fn save_samples(samples: &Tensor, n_bits: u32, path: &Path) -> anyhow::Result<()> {
    let top = ((1i64 << n_bits) - 1) as f64;
    let samples = samples.to_device(Device::Cpu).to_kind(Kind::Float);
    let samples = (samples * (255. / top)).round().to_kind(Kind::Uint8);
    let samples = if samples.size()[1] == 1 { samples.repeat([1, 3, 1, 1]) } else { samples };
    let strip = Tensor::cat(&samples.unbind(0), 2);
    tch::vision::image::save(&strip, path)?;
    Ok(())
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();
    let config = ExperimentConfig::load(&args.config)?;
    tch::manual_seed(config.seed);
    let device = utils::device(args.cpu);
    info!(?device, "starting");

    let (channels, n_bits) = (config.model.flow.in_channels, config.model.n_bits);
    let images = load_images(&config.data_path, channels, config.image_size, n_bits)?;
    let total = images.size()[0];
    let n_eval = args.eval_images.clamp(0, total / 2);
    let train = images.narrow(0, 0, total - n_eval);
    let eval = images.narrow(0, total - n_eval, n_eval);
    let n_train = train.size()[0];
    info!(train = n_train, eval = n_eval, "loaded images");

    let vs = nn::VarStore::new(device);
    let model = FlowGenModel::new(vs.root(), &config.model)?;
    let init_batch = train.narrow(0, 0, config.init_batch_size.min(n_train)).to_device(device);
    model.init(&init_batch, 1.0)?;
    let mut trainer = Trainer::new(&vs, config.training())?;

    let batch_size = config.batch_size as i64;
    for epoch in 1..=config.epochs {
        let perm = Tensor::randperm(n_train, (Kind::Int64, Device::Cpu));
        let (mut nll_sum, mut bpd_sum, mut updates, mut skipped) = (0., 0., 0, 0);
        for start in (0..=n_train - batch_size).step_by(config.batch_size) {
            let indexes = perm.narrow(0, start, batch_size);
            let batch = train.index_select(0, &indexes).to_device(device);
            match trainer.train_batch(&model, &batch)? {
                StepOutcome::Updated { nll, bits_per_dim, .. } => {
                    nll_sum += nll;
                    bpd_sum += bits_per_dim;
                    updates += 1;
                }
                StepOutcome::Skipped => skipped += 1,
            }
        }
        let updates_f = f64::max(updates as f64, 1.);
        info!(
            epoch,
            nll = nll_sum / updates_f,
            bits_per_dim = bpd_sum / updates_f,
            skipped,
            lr = trainer.learning_rate(),
            "train"
        );
        if n_eval > 0 {
            let eval_images = eval.to_device(device);
            let res = Trainer::evaluate(&model, &eval_images, config.eval_k, batch_size)?;
            info!(epoch, nll = res.nll, bits_per_dim = res.bits_per_dim, "eval");
        }
        save_checkpoint(&config.model_path, &vs, &config.model)?;
        let samples = model.sample(config.num_samples, args.temperature)?;
        let path = config.model_path.join(format!("sample_{epoch}.png"));
        save_samples(&samples, n_bits, &path)?;
    }
    Ok(())
}
