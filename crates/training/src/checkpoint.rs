use burn::module::Module;
use burn::record::{BinFileRecorder, FullPrecisionSettings, RecorderError};
use burn::tensor::backend::Backend;
use models::{SegNet, SegNetConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const TRAIN_STATE_FILE: &str = "train_state.json";
pub const LOSS_CONFIG_FILE: &str = "pgc_loss.json";

/// Progress saved next to the weights so a run can continue.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainState {
    pub iteration: usize,
    pub epoch: u64,
    pub best_score: f64,
    pub num_classes: usize,
    pub dataset: String,
}

impl TrainState {
    pub fn save(&self, dir: &Path) -> anyhow::Result<PathBuf> {
        fs::create_dir_all(dir)?;
        let path = dir.join(TRAIN_STATE_FILE);
        fs::write(&path, serde_json::to_vec_pretty(self)?)?;
        Ok(path)
    }

    pub fn load(dir: &Path) -> anyhow::Result<Option<Self>> {
        let path = dir.join(TRAIN_STATE_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read(&path)?;
        let state = serde_json::from_slice(&raw)
            .map_err(|e| anyhow::anyhow!("failed to parse {}: {e}", path.display()))?;
        Ok(Some(state))
    }
}

pub fn latest_path(dir: &Path, dataset: &str) -> PathBuf {
    dir.join(format!("latest_segnet_{dataset}.bin"))
}

pub fn best_path(dir: &Path, dataset: &str) -> PathBuf {
    dir.join(format!("best_segnet_{dataset}.bin"))
}

pub fn save_segnet<B: Backend>(model: &SegNet<B>, path: &Path) -> Result<(), RecorderError> {
    let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
    model.clone().save_file(path, &recorder)
}

pub fn load_segnet_from_checkpoint<B: Backend, P: AsRef<Path>>(
    path: P,
    cfg: SegNetConfig,
    device: &B::Device,
) -> Result<SegNet<B>, RecorderError> {
    let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
    SegNet::<B>::new(cfg, device).load_file(path.as_ref(), &recorder, device)
}
