//! Shared data contracts for volume manifests and training logs.

pub mod training_log;
pub mod volume;

pub use training_log::{LogError, TrainingLog};
pub use volume::{VolumeEntry, VolumeManifest, VolumeManifestSchemaVersion, VolumeValidationError};
