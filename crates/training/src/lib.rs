//! Training loop for the U-Net segmentation models.
//!
//! `Trainer` owns one run: it samples patch batches, steps an Adam optimizer,
//! validates every `validate_every` iterations, checkpoints on strictly lower
//! validation loss and persists a resumable `TrainingLog` after every iteration,
//! alongside the latest model and optimizer state.
#![recursion_limit = "256"]

pub mod checkpoint;
pub mod config;
pub mod early_stopping;
pub mod error;
pub mod loss;
pub mod metrics;
pub mod paths;
pub mod trainer;
pub mod util;

pub use checkpoint::{
    load_optimizer, load_unet_from_checkpoint, save_checkpoint, save_optimizer, CheckpointTracker,
};
pub use config::{ClassWeight, EarlyStoppingConfig, LossKind, TrainConfig};
pub use early_stopping::EarlyStopping;
pub use error::TrainError;
pub use loss::{binary_accuracy, binary_cross_entropy, dice_loss, Objective};
pub use metrics::{JsonlMetricSink, MemorySink, MetricRecord, MetricSink, StepMetrics};
pub use paths::RunPaths;
pub use trainer::{iteration_seed, TrainSummary, Trainer};
pub use util::{load_run_checkpoint, run_train, TrainArgs};

/// Backend alias for training (NdArray by default; WGPU if enabled).
#[cfg(feature = "backend-wgpu")]
pub type TrainBackend = burn_wgpu::Wgpu<f32>;
#[cfg(not(feature = "backend-wgpu"))]
pub type TrainBackend = burn_ndarray::NdArray<f32>;
