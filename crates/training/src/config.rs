//! Run configuration: a TOML file deserialised into `TrainConfig`, with CLI overrides on top.

use crate::error::TrainError;
use models::{NodeShape, SpatialDims, UNetConfig};
use patch_dataset::{AugmentConfig, ImageId, SamplerConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

/// Segmentation objective applied to each output head.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LossKind {
    BinaryCrossEntropy,
    /// Cross-entropy with the positive class scaled by the false-negative class weight.
    WeightedBinaryCrossEntropy,
    Dice,
}

/// Source of the false-negative class weight used by the weighted loss.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ClassWeight {
    Fixed { value: f64 },
    /// Estimated from `samples` unnormalised patches drawn across training and validation volumes.
    Auto { samples: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EarlyStoppingConfig {
    pub enabled: bool,
    /// Iterations without a validation improvement before the run stops.
    pub patience: usize,
    /// On resume, restart the patience counter instead of carrying it over.
    pub reset_patience: bool,
}

impl Default for EarlyStoppingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            patience: 1000,
            reset_patience: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub model_name: String,
    /// Runs are written to `<output_root>/<model_name>/`.
    pub output_root: PathBuf,
    /// JSON volume manifest read by the manifest loader.
    pub manifest: PathBuf,
    pub training_ids: Vec<ImageId>,
    pub validation_ids: Vec<ImageId>,
    /// Volumes served as artificial positives in offline mode; never used for validation.
    pub artificial_ids: Vec<ImageId>,
    /// Total iterations, counted across resumed runs.
    pub iterations: usize,
    pub batch_size: usize,
    /// Patches drawn for each validation check.
    pub validation_patches: usize,
    /// Validation patches are evaluated in chunks of this size.
    pub validation_batch_size: usize,
    pub validate_every: usize,
    pub learning_rate: f64,
    pub loss: LossKind,
    pub class_weight: ClassWeight,
    pub main_loss_weight: f64,
    pub aux_loss_weight: f64,
    pub early_stopping: EarlyStoppingConfig,
    /// Continue from the checkpoint and log under the run directory.
    pub resume: bool,
    /// On resume, forget the best validation loss so the next check always saves.
    pub reset_val_loss: bool,
    pub seed: Option<u64>,
    pub sampler: SamplerConfig,
    pub augment: AugmentConfig,
    /// Pre-drawn variants per window in offline augmentation mode.
    pub offline_variants: usize,
    pub model: UNetConfig,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            model_name: "unet".to_string(),
            output_root: PathBuf::from("runs"),
            manifest: PathBuf::from("data/manifest.json"),
            training_ids: Vec::new(),
            validation_ids: Vec::new(),
            artificial_ids: Vec::new(),
            iterations: 10_000,
            batch_size: 4,
            validation_patches: 64,
            validation_batch_size: 8,
            validate_every: 100,
            learning_rate: 1e-4,
            loss: LossKind::WeightedBinaryCrossEntropy,
            class_weight: ClassWeight::Auto { samples: 200 },
            main_loss_weight: 1.0,
            aux_loss_weight: 0.5,
            early_stopping: EarlyStoppingConfig::default(),
            resume: false,
            reset_val_loss: false,
            seed: None,
            sampler: SamplerConfig::default(),
            augment: AugmentConfig::default(),
            offline_variants: 4,
            model: UNetConfig::default(),
        }
    }
}

impl TrainConfig {
    pub fn from_path(path: &Path) -> Result<Self, TrainError> {
        let raw = fs::read_to_string(path).map_err(|source| TrainError::ConfigIo {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| TrainError::ConfigParse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Checks the settings that cannot be fixed up silently.
    pub fn validate(&self) -> Result<(), TrainError> {
        if self.training_ids.is_empty() {
            return Err(TrainError::EmptyTrainingSet);
        }
        if self.validation_ids.is_empty() {
            return Err(TrainError::Config("no validation volumes configured".into()));
        }
        let training: HashSet<_> = self.training_ids.iter().collect();
        if let Some(id) = self.validation_ids.iter().find(|id| training.contains(id)) {
            return Err(TrainError::Config(format!(
                "volume {id} is listed for both training and validation"
            )));
        }
        if self.batch_size == 0 || self.validation_patches == 0 || self.validate_every == 0 {
            return Err(TrainError::Config(
                "batch_size, validation_patches and validate_every must be positive".into(),
            ));
        }
        if self.model.dims == SpatialDims::Two && self.sampler.patch_size[0] != 1 {
            return Err(TrainError::Config(format!(
                "planar networks need patch depth 1, got {}",
                self.sampler.patch_size[0]
            )));
        }
        if self.model.aux_head
            && self.sampler.aux_target == patch_dataset::AuxTarget::AuxLabel
            && self.aux_loss_weight == 0.0
        {
            tracing::warn!("auxiliary labels are loaded but the auxiliary loss weight is zero");
        }
        Ok(())
    }

    /// Sampler settings with the network depth filled in.
    pub fn sampler_config(&self) -> SamplerConfig {
        SamplerConfig {
            unet_depth: self.model.depth,
            seed: self.sampler.seed.or(self.seed),
            ..self.sampler.clone()
        }
    }

    /// Network settings with the input channel count taken from the sampler.
    pub fn model_config(&self) -> UNetConfig {
        UNetConfig {
            in_channels: self.input_channels(),
            ..self.model.clone()
        }
    }

    pub fn input_channels(&self) -> usize {
        if self.sampler.aux_input {
            2
        } else {
            1
        }
    }

    /// Shape the network is planned against. Variable-size patches are only known
    /// to be multiples of `2^depth` in-plane, so the smallest such plane stands in.
    pub fn input_shape(&self) -> NodeShape {
        let [d, h, w] = self.sampler.patch_size;
        if self.sampler.variable_patch_size {
            let side = 1usize << self.model.depth;
            NodeShape::new(self.input_channels(), d, side, side)
        } else {
            NodeShape::new(self.input_channels(), d, h, w)
        }
    }

    /// Overall positive weight used by the loss when no auto estimate applies.
    pub fn fixed_class_weight(&self) -> Option<f64> {
        match (self.loss, self.class_weight) {
            (LossKind::WeightedBinaryCrossEntropy, ClassWeight::Fixed { value }) => Some(value),
            (LossKind::WeightedBinaryCrossEntropy, ClassWeight::Auto { .. }) => None,
            _ => Some(1.0),
        }
    }

    pub fn settings_snapshot(&self) -> Result<serde_json::Value, TrainError> {
        Ok(serde_json::to_value(self)?)
    }
}
