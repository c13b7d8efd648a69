//! Checkpoints: a directory holding the model configuration, `config.json`,
//! and its weights, `model.ot`.
//!
//! Loading is strict: the stored configuration has to match the requested one
//! and the stored variables have to match the ones of the freshly built model,
//! both in names and shapes, before anything gets copied.
use crate::models::flow_gen::{FlowGenConfig, FlowGenModel};
use crate::utils::file_open;
use crate::{Error, Result};
use serde_json::Value;
use std::collections::BTreeSet;
use std::path::Path;
use tch::{nn, Device, Tensor};

pub const CONFIG_FILE: &str = "config.json";
pub const WEIGHTS_FILE: &str = "model.ot";

pub fn save_checkpoint<P: AsRef<Path>>(
    dir: P,
    vs: &nn::VarStore,
    config: &FlowGenConfig,
) -> Result<()> {
    let dir = dir.as_ref();
    std::fs::create_dir_all(dir)?;
    let file = std::fs::File::create(dir.join(CONFIG_FILE))?;
    serde_json::to_writer_pretty(file, config)?;
    vs.save(dir.join(WEIGHTS_FILE))?;
    tracing::info!(dir = %dir.display(), variables = vs.len(), "saved checkpoint");
    Ok(())
}

/// Reads the configuration stored in a checkpoint directory.
pub fn load_config<P: AsRef<Path>>(dir: P) -> Result<FlowGenConfig> {
    let file = file_open(dir.as_ref().join(CONFIG_FILE))?;
    Ok(serde_json::from_reader(file)?)
}

/// Collects the paths of the fields that differ between two json values.
fn diff_values(path: &str, stored: &Value, requested: &Value, report: &mut Vec<String>) {
    match (stored, requested) {
        (Value::Object(stored), Value::Object(requested)) => {
            let keys: BTreeSet<&String> = stored.keys().chain(requested.keys()).collect();
            for key in keys {
                let path = if path.is_empty() { key.to_string() } else { format!("{path}.{key}") };
                match (stored.get(key), requested.get(key)) {
                    (Some(s), Some(r)) => diff_values(&path, s, r, report),
                    (s, r) => report.push(format!(
                        "{path}: stored {}, requested {}",
                        s.map_or("nothing".to_string(), Value::to_string),
                        r.map_or("nothing".to_string(), Value::to_string),
                    )),
                }
            }
        }
        (Value::Array(s), Value::Array(r)) if s.len() == r.len() => {
            for (i, (s, r)) in s.iter().zip(r.iter()).enumerate() {
                diff_values(&format!("{path}[{i}]"), s, r, report)
            }
        }
        (s, r) if s != r => report.push(format!("{path}: stored {s}, requested {r}")),
        _ => {}
    }
}

/// Copies the weights stored in `path` into `vs`, provided that they match
/// the existing variables exactly.
fn load_weights(vs: &nn::VarStore, path: &Path) -> Result<()> {
    let stored = Tensor::load_multi(path)?;
    let variables = vs.variables();
    let mut report = vec![];
    let stored_names: BTreeSet<&str> = stored.iter().map(|(name, _)| name.as_str()).collect();
    for name in variables.keys().filter(|n| !stored_names.contains(n.as_str())) {
        report.push(format!("missing variable {name}"));
    }
    for (name, tensor) in stored.iter() {
        match variables.get(name) {
            None => report.push(format!("unexpected variable {name}")),
            Some(var) if var.size() != tensor.size() => report.push(format!(
                "{name}: stored shape {:?}, expected {:?}",
                tensor.size(),
                var.size()
            )),
            Some(_) => {}
        }
    }
    if !report.is_empty() {
        report.sort();
        return Err(Error::IncompatibleCheckpoint { path: path.display().to_string(), report });
    }
    tch::no_grad(|| -> Result<()> {
        for (name, tensor) in stored.iter() {
            if let Some(var) = variables.get(name) {
                var.shallow_clone().f_copy_(tensor)?;
            }
        }
        Ok(())
    })
}

/// Builds the model described by `requested` and loads the checkpoint
/// weights into it.
pub fn load_checkpoint<P: AsRef<Path>>(
    dir: P,
    requested: &FlowGenConfig,
    device: Device,
) -> Result<(nn::VarStore, FlowGenModel)> {
    let dir = dir.as_ref();
    let config_path = dir.join(CONFIG_FILE);
    let stored: Value = serde_json::from_reader(file_open(&config_path)?)?;
    let mut report = vec![];
    diff_values("", &stored, &serde_json::to_value(requested)?, &mut report);
    if !report.is_empty() {
        let path = config_path.display().to_string();
        return Err(Error::IncompatibleCheckpoint { path, report });
    }
    let vs = nn::VarStore::new(device);
    let model = FlowGenModel::new(vs.root(), requested)?;
    load_weights(&vs, &dir.join(WEIGHTS_FILE))?;
    tracing::info!(dir = %dir.display(), variables = vs.len(), "loaded checkpoint");
    Ok((vs, model))
}
