use crate::error::TrainError;
use burn::module::Module;
use burn::optim::Optimizer;
use burn::record::{BinFileRecorder, FullPrecisionSettings, Recorder};
use burn::tensor::backend::{AutodiffBackend, Backend};
use models::{NodeShape, UNet, UNetConfig};
use std::path::Path;

/// Best validation loss seen so far; a checkpoint is due only on a strictly lower loss.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointTracker {
    best: f64,
    saves: usize,
}

impl Default for CheckpointTracker {
    fn default() -> Self {
        Self::new(f64::INFINITY)
    }
}

impl CheckpointTracker {
    pub fn new(best: f64) -> Self {
        Self { best, saves: 0 }
    }

    /// Records `loss` as the new best and returns true iff it beats the current best.
    /// NaN never improves.
    pub fn observe(&mut self, loss: f64) -> bool {
        if loss < self.best {
            self.best = loss;
            self.saves += 1;
            true
        } else {
            false
        }
    }

    pub fn best(&self) -> f64 {
        self.best
    }

    pub fn saves(&self) -> usize {
        self.saves
    }
}

pub fn save_checkpoint<B: Backend>(model: &UNet<B>, path: &Path) -> Result<(), TrainError> {
    let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
    model
        .clone()
        .save_file(path.to_path_buf(), &recorder)
        .map_err(|e| TrainError::Checkpoint {
            path: path.to_path_buf(),
            message: format!("failed to save: {e}"),
        })
}

pub fn load_unet_from_checkpoint<B: Backend>(
    cfg: &UNetConfig,
    input: NodeShape,
    path: &Path,
    device: &B::Device,
) -> Result<UNet<B>, TrainError> {
    let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
    UNet::<B>::new(cfg, input, device)?
        .load_file(path.to_path_buf(), &recorder, device)
        .map_err(|e| TrainError::Checkpoint {
            path: path.to_path_buf(),
            message: format!("failed to load: {e}"),
        })
}

pub fn save_optimizer<B, O>(optim: &O, path: &Path) -> Result<(), TrainError>
where
    B: AutodiffBackend,
    O: Optimizer<UNet<B>, B>,
{
    let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
    Recorder::<B>::record(&recorder, optim.to_record(), path.to_path_buf()).map_err(|e| {
        TrainError::Checkpoint {
            path: path.to_path_buf(),
            message: format!("failed to save optimizer state: {e}"),
        }
    })
}

/// Loads the optimizer state at `path` into `optim`.
pub fn load_optimizer<B, O>(optim: O, path: &Path, device: &B::Device) -> Result<O, TrainError>
where
    B: AutodiffBackend,
    O: Optimizer<UNet<B>, B>,
{
    let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
    let record = Recorder::<B>::load(&recorder, path.to_path_buf(), device).map_err(|e| {
        TrainError::Checkpoint {
            path: path.to_path_buf(),
            message: format!("failed to load optimizer state: {e}"),
        }
    })?;
    Ok(optim.load_record(record))
}
