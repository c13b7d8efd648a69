use macow::models::{
    dequant::{DequantConfig, Dequantizer},
    flow_gen::{FlowGenConfig, FlowGenModel},
    macow::{LevelConfig, MaCowConfig},
};
use macow::pipelines::training::{StepOutcome, Trainer, TrainingConfig};
use tch::{nn, Device, Kind, Tensor};

/// Puts every continuous value in the middle of its cell.
#[derive(Debug)]
struct Midpoint;

impl Dequantizer for Midpoint {
    fn dequantize(&self, images: &Tensor, nsamples: i64) -> macow::Result<(Tensor, Tensor)> {
        let (b, c, h, w) = images.size4()?;
        let options = (Kind::Float, images.device());
        let u = Tensor::full([b * nsamples, c, h, w], 0.5, options);
        Ok((u, Tensor::zeros([b, nsamples], options)))
    }
}

fn build(seed: i64) -> (nn::VarStore, FlowGenModel) {
    let flow = MaCowConfig {
        in_channels: 3,
        height: 4,
        width: 4,
        levels: vec![LevelConfig::new(1, 8), LevelConfig::new(1, 8)],
        num_units: 1,
        bottom: true,
        ..MaCowConfig::default()
    };
    let config = FlowGenConfig { flow, dequant: DequantConfig::Uniform, n_bits: 8 };
    tch::manual_seed(seed);
    let vs = nn::VarStore::new(Device::Cpu);
    let model = FlowGenModel::with_dequantizer(vs.root(), &config, Box::new(Midpoint)).unwrap();
    (vs, model)
}

fn train_once(batch_steps: usize, images: &Tensor) -> (f64, Vec<(String, Tensor)>) {
    let (vs, model) = build(3);
    model.init(images, 1.0).unwrap();
    let config = TrainingConfig { batch_steps, ..Default::default() };
    let mut trainer = Trainer::new(&vs, config).unwrap();
    let nll = match trainer.train_batch(&model, images).unwrap() {
        StepOutcome::Updated { nll, .. } => nll,
        StepOutcome::Skipped => panic!("batch skipped"),
    };
    let mut grads: Vec<_> =
        vs.variables().into_iter().map(|(name, var)| (name, var.grad().copy())).collect();
    grads.sort_by(|a, b| a.0.cmp(&b.0));
    (nll, grads)
}

#[test]
fn accumulated_gradients_match_full_batch() {
    tch::manual_seed(4);
    let images = Tensor::randint(256, [8, 3, 4, 4], (Kind::Int64, Device::Cpu));
    let (nll_full, grads_full) = train_once(1, &images);
    let (nll_acc, grads_acc) = train_once(4, &images);
    assert!((nll_full - nll_acc).abs() < 1e-4 * nll_full.abs());
    assert_eq!(grads_full.len(), grads_acc.len());
    for ((name, full), (name_, acc)) in grads_full.iter().zip(grads_acc.iter()) {
        assert_eq!(name, name_);
        assert!(full.allclose(acc, 1e-3, 1e-6, false), "gradient mismatch for {name}");
    }
}
