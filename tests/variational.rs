use macow::models::{
    dequant::DequantConfig,
    flow_gen::{FlowGenConfig, FlowGenModel},
    macow::{LevelConfig, MaCowConfig},
};
use macow::pipelines::training::{StepOutcome, Trainer, TrainingConfig};
use tch::{nn, Device, Kind, Tensor};

fn toy_model(vs: &nn::VarStore, n_bits: u32) -> FlowGenModel {
    let flow = MaCowConfig {
        in_channels: 3,
        height: 4,
        width: 4,
        levels: vec![LevelConfig::new(2, 8)],
        num_units: 1,
        bottom: false,
        ..MaCowConfig::default()
    };
    let dequant = DequantConfig::Variational {
        flow: MaCowConfig {
            levels: vec![LevelConfig::new(1, 8)],
            ..MaCowConfig::dequantizer(3, 4, 4)
        },
    };
    let config = FlowGenConfig { flow, dequant, n_bits };
    FlowGenModel::new(vs.root(), &config).unwrap()
}

#[test]
fn variational_bounds() {
    tch::manual_seed(6);
    let vs = nn::VarStore::new(Device::Cpu);
    let model = toy_model(&vs, 5);
    let images = Tensor::randint(32, [4, 3, 4, 4], (Kind::Int64, Device::Cpu));
    model.init(&images, 1.0).unwrap();

    let ll = model.log_likelihood(&images, 3).unwrap();
    assert_eq!(ll.size(), [4, 3]);
    assert_eq!(ll.isfinite().all().int64_value(&[]), 1);
    let nll = model.nll(&images, 3).unwrap();
    let iw_nll = model.importance_weighted_nll(&images, 3).unwrap();
    assert!((&iw_nll - &nll).max().double_value(&[]) <= 1e-4);
}

#[test]
fn dequantizer_is_trained_jointly() {
    tch::manual_seed(7);
    let vs = nn::VarStore::new(Device::Cpu);
    let model = toy_model(&vs, 8);
    let images = Tensor::randint(256, [4, 3, 4, 4], (Kind::Int64, Device::Cpu));
    model.init(&images, 1.0).unwrap();
    let variables = vs.variables();
    let names = [
        "dequant.flow.levels.0.steps.0.coupling.net.conv3.weight",
        "dequant.encoder.down0.weight",
        "dequant.encoder.res0_1.conv2.weight",
        "dequant.encoder.up0.weight",
        "dequant.encoder.proj.weight",
    ];
    let before: Vec<Tensor> = names.iter().map(|name| variables[*name].copy()).collect();

    let config = TrainingConfig { warmup_steps: 0, train_k: 2, ..Default::default() };
    let mut trainer = Trainer::new(&vs, config).unwrap();
    // The encoder only gets gradients once the zero initialized output
    // layers of the flow networks have moved.
    for _ in 0..2 {
        let outcome = trainer.train_batch(&model, &images).unwrap();
        assert!(matches!(outcome, StepOutcome::Updated { .. }));
    }
    for (name, before) in names.iter().zip(before.iter()) {
        let var = &variables[*name];
        assert!(var.grad().abs().max().double_value(&[]) > 0., "no gradient for {name}");
        assert!(!var.equal(before), "{name} was not updated");
    }
}
