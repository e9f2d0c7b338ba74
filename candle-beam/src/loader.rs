//! Checkpoint loading.
//!
//! A checkpoint is a directory holding the model hyperparameters in
//! `settings.json` and the weights in one or more `.safetensors` files.
use std::path::{Path, PathBuf};

use candle::{DType, Device};
use candle_nn::VarBuilder;

use crate::error::{Error, Result};

pub const SETTINGS_FILE: &str = "settings.json";

/// Architecture hyperparameters stored alongside the weights.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct ModelSettings {
    /// Source vocabulary size.
    pub input_dim: usize,
    /// Target vocabulary size.
    pub output_dim: usize,
    pub n_inputs_max_seq: usize,
    pub n_outputs_max_seq: usize,
    pub d_k: usize,
    pub d_v: usize,
    pub d_model: usize,
    pub d_inner_hid: usize,
    pub n_layers: usize,
    pub n_head: usize,
    /// Only used for training.
    #[serde(default)]
    pub dropout: f64,
}

/// Models that can be built from checkpoint weights.
pub trait FromCheckpoint: Sized {
    fn from_checkpoint(settings: &ModelSettings, vb: VarBuilder) -> candle::Result<Self>;
}

#[derive(Debug, Clone)]
pub struct Checkpoint {
    dir: PathBuf,
    settings: ModelSettings,
    weights: Vec<PathBuf>,
}

impl Checkpoint {
    /// Reads the settings and lists the weight files of a checkpoint directory.
    pub fn from_dir<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        if !dir.is_dir() {
            return Err(Error::load(&dir, "not a directory"));
        }
        let settings_file = dir.join(SETTINGS_FILE);
        let settings = std::fs::read_to_string(&settings_file)
            .map_err(|e| Error::load(&settings_file, e))?;
        let settings: ModelSettings =
            serde_json::from_str(&settings).map_err(|e| Error::load(&settings_file, e))?;

        let mut weights = Vec::new();
        for entry in std::fs::read_dir(&dir).map_err(|e| Error::load(&dir, e))? {
            let path = entry.map_err(|e| Error::load(&dir, e))?.path();
            if path.extension().is_some_and(|ext| ext == "safetensors") {
                weights.push(path)
            }
        }
        if weights.is_empty() {
            return Err(Error::load(&dir, "no .safetensors weight file"));
        }
        weights.sort();
        Ok(Self {
            dir,
            settings,
            weights,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn settings(&self) -> &ModelSettings {
        &self.settings
    }

    pub fn weights(&self) -> &[PathBuf] {
        &self.weights
    }

    /// Memory-maps the weights and builds the model on `device`.
    pub fn load<M: FromCheckpoint>(&self, dtype: DType, device: &Device) -> Result<M> {
        // The weight files must not be modified while the model is alive.
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(self.weights.as_slice(), dtype, device)
        }
        .map_err(|e| Error::load(&self.dir, e))?;
        let model =
            M::from_checkpoint(&self.settings, vb).map_err(|e| Error::load(&self.dir, e))?;
        tracing::info!(
            dir = ?self.dir,
            files = self.weights.len(),
            d_model = self.settings.d_model,
            n_layers = self.settings.n_layers,
            "loaded checkpoint"
        );
        Ok(model)
    }
}

/// Loads a model and its settings from a checkpoint directory.
pub fn load_model<M: FromCheckpoint, P: AsRef<Path>>(
    dir: P,
    dtype: DType,
    device: &Device,
) -> Result<(M, ModelSettings)> {
    let checkpoint = Checkpoint::from_dir(dir)?;
    let model = checkpoint.load(dtype, device)?;
    Ok((model, checkpoint.settings))
}
