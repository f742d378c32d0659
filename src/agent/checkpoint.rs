//! Model checkpoints.
//!
//! A checkpoint is a directory holding one `tch` variable file per model and a JSON manifest
//! recording the epoch each model was saved at.
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};
use tch::nn::VarStore;
use tch::TchError;
use thiserror::Error;

const MANIFEST: &str = "manifest.json";

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("file error {0}")]
    Io(#[from] io::Error),
    #[error("manifest (de)serialization error {0}")]
    Manifest(#[from] serde_json::Error),
    #[error("tensor file error {0}")]
    Torch(#[from] TchError),
    #[error("checkpoint {dir} has no model \"{name}\"")]
    MissingModel { dir: PathBuf, name: String },
}

/// Saved state of one model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelEntry {
    /// File name relative to the checkpoint directory.
    pub file: String,
    pub epoch: usize,
}

/// Index of the models saved in a checkpoint directory.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub models: BTreeMap<String, ModelEntry>,
}

impl Manifest {
    pub fn read<P: AsRef<Path>>(dir: P) -> Result<Self, CheckpointError> {
        let file = File::open(dir.as_ref().join(MANIFEST))?;
        Ok(serde_json::from_reader(BufReader::new(file))?)
    }

    pub fn write<P: AsRef<Path>>(&self, dir: P) -> Result<(), CheckpointError> {
        let file = File::create(dir.as_ref().join(MANIFEST))?;
        serde_json::to_writer_pretty(BufWriter::new(file), self)?;
        Ok(())
    }

    /// Epoch of the checkpoint: the latest epoch of any model.
    pub fn epoch(&self) -> usize {
        self.models.values().map(|entry| entry.epoch).max().unwrap_or(0)
    }
}

/// Save named models into `dir`, creating it if necessary.
pub fn save_models<P: AsRef<Path>>(
    dir: P,
    epoch: usize,
    models: &[(&str, &VarStore)],
) -> Result<(), CheckpointError> {
    let dir = dir.as_ref();
    fs::create_dir_all(dir)?;
    let mut manifest = Manifest::default();
    for (name, vs) in models {
        let file = format!("{}.ot", name);
        vs.save(dir.join(&file))?;
        manifest
            .models
            .insert((*name).to_string(), ModelEntry { file, epoch });
    }
    manifest.write(dir)?;
    log::info!("saved checkpoint of epoch {} to {}", epoch, dir.display());
    Ok(())
}

/// Load named models from `dir`.
///
/// Variables are matched by name. Variables missing from the saved file keep their current
/// values and are reported with a warning.
///
/// # Returns
/// The checkpoint epoch.
pub fn load_models<P: AsRef<Path>>(
    dir: P,
    models: &mut [(&str, &mut VarStore)],
) -> Result<usize, CheckpointError> {
    let dir = dir.as_ref();
    let manifest = Manifest::read(dir)?;
    for (name, vs) in models.iter_mut() {
        let entry = manifest
            .models
            .get(*name)
            .ok_or_else(|| CheckpointError::MissingModel {
                dir: dir.to_path_buf(),
                name: (*name).to_string(),
            })?;
        let missing = vs.load_partial(dir.join(&entry.file))?;
        if !missing.is_empty() {
            log::warn!(
                "{}: {} variables not in checkpoint, keeping current values: {:?}",
                name,
                missing.len(),
                missing
            );
        }
    }
    let epoch = manifest.epoch();
    log::info!("loaded checkpoint of epoch {} from {}", epoch, dir.display());
    Ok(epoch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{nn, Device, Kind, Tensor};

    fn temp_dir(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("confignav-{}-{}", name, std::process::id()))
    }

    #[test]
    fn save_load_round_trip() {
        let dir = temp_dir("checkpoint");
        let source = nn::VarStore::new(Device::Cpu);
        let x = source.root().var("x", &[3], nn::Init::Randn { mean: 0.0, stdev: 1.0 });
        save_models(&dir, 7, &[("encoder", &source)]).unwrap();

        let mut target = nn::VarStore::new(Device::Cpu);
        let y = target.root().var("x", &[3], nn::Init::Const(0.0));
        let extra = target.root().var("extra", &[2], nn::Init::Const(1.0));
        let epoch = load_models(&dir, &mut [("encoder", &mut target)]).unwrap();

        assert_eq!(epoch, 7);
        assert!(y.allclose(&x, 0.0, 0.0, false));
        assert!(extra.allclose(&Tensor::ones(&[2], (Kind::Float, Device::Cpu)), 0.0, 0.0, false));
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn missing_model_is_an_error() {
        let dir = temp_dir("checkpoint-missing");
        let source = nn::VarStore::new(Device::Cpu);
        let _ = source.root().var("x", &[1], nn::Init::Const(0.0));
        save_models(&dir, 1, &[("encoder", &source)]).unwrap();

        let mut target = nn::VarStore::new(Device::Cpu);
        let result = load_models(&dir, &mut [("decoder", &mut target)]);
        assert!(matches!(result, Err(CheckpointError::MissingModel { .. })));
        fs::remove_dir_all(&dir).unwrap();
    }
}
