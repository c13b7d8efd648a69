// Samples images from a trained MaCow checkpoint.
//
//   cargo run --release --features clap --example sample -- --checkpoint runs/cifar10
use clap::Parser;
use macow::{pipelines::checkpoint, utils};
use tch::{Kind, Tensor};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// The checkpoint directory, as written by the train example.
    #[arg(long)]
    checkpoint: String,

    /// When set, use the CPU even if some accelerator is available.
    #[arg(long)]
    cpu: bool,

    /// The number of images to sample.
    #[arg(long, default_value_t = 8)]
    num_samples: i64,

    /// Standard deviation of the prior, lower values give smoother images.
    #[arg(long, default_value_t = 0.7)]
    temperature: f64,

    #[arg(long, default_value_t = 42)]
    seed: i64,

    /// The name of the image to generate.
    #[arg(long, value_name = "FILE", default_value = "samples.png")]
    output: String,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();
    tch::manual_seed(args.seed);
    let device = utils::device(args.cpu);
    let config = checkpoint::load_config(&args.checkpoint)?;
    let (_vs, model) = checkpoint::load_checkpoint(&args.checkpoint, &config, device)?;
    let samples = model.sample(args.num_samples, args.temperature)?;

    let top = ((1i64 << config.n_bits) - 1) as f64;
    let samples = (samples.to_kind(Kind::Float) * (255. / top)).round().to_kind(Kind::Uint8);
    let samples = if samples.size()[1] == 1 { samples.repeat([1, 3, 1, 1]) } else { samples };
    let strip = Tensor::cat(&samples.to_device(tch::Device::Cpu).unbind(0), 2);
    tch::vision::image::save(&strip, &args.output)?;
    println!("{} samples written to {}", args.num_samples, args.output);
    Ok(())
}
