use burn::backend::Autodiff;
use burn::tensor::backend::Backend;
use clap::{Parser, ValueEnum};
use cli_support::{RunOutputArgs, RunOutputOpts};
use models::UNet;
use patch_dataset::{ImageId, ManifestLoader};
use std::path::PathBuf;
use tracing::info;

use crate::checkpoint::load_unet_from_checkpoint;
use crate::config::TrainConfig;
use crate::error::TrainError;
use crate::metrics::JsonlMetricSink;
use crate::paths::RunPaths;
use crate::trainer::Trainer;
use crate::TrainBackend;

type ADBackend = Autodiff<TrainBackend>;

#[derive(ValueEnum, Debug, Clone, Copy)]
pub enum BackendKind {
    NdArray,
    Wgpu,
}

#[derive(Parser, Debug)]
#[command(
    name = "train",
    about = "Train a U-Net segmentation model on patches sampled from labelled volumes"
)]
pub struct TrainArgs {
    /// TOML run configuration; built-in defaults apply when omitted.
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Backend to use (ndarray or wgpu if enabled).
    #[arg(long, value_enum, default_value_t = BackendKind::NdArray)]
    pub backend: BackendKind,
    #[command(flatten)]
    pub output: RunOutputArgs,
    /// Volume manifest (JSON).
    #[arg(long)]
    pub manifest: Option<PathBuf>,
    /// Comma-separated training volume ids.
    #[arg(long, value_delimiter = ',')]
    pub training_ids: Vec<ImageId>,
    /// Comma-separated validation volume ids.
    #[arg(long, value_delimiter = ',')]
    pub validation_ids: Vec<ImageId>,
    /// Total iterations, including those of earlier runs when resuming.
    #[arg(long)]
    pub iterations: Option<usize>,
    #[arg(long)]
    pub batch_size: Option<usize>,
    /// Learning rate.
    #[arg(long)]
    pub lr: Option<f64>,
    #[arg(long)]
    pub validate_every: Option<usize>,
    /// Enable early stopping with this patience.
    #[arg(long)]
    pub patience: Option<usize>,
    #[arg(long)]
    pub seed: Option<u64>,
    /// Continue the run found under the output directory.
    #[arg(long, default_value_t = false)]
    pub resume: bool,
    #[arg(long, default_value_t = false)]
    pub reset_val_loss: bool,
    #[arg(long, default_value_t = false)]
    pub reset_patience: bool,
}

impl TrainArgs {
    /// Layers the flags that were given over `cfg`.
    pub fn apply(&self, cfg: &mut TrainConfig) {
        let (root, name) = RunOutputOpts::from(&self.output).resolve(&cfg.output_root, &cfg.model_name);
        cfg.output_root = root;
        cfg.model_name = name;
        if let Some(manifest) = &self.manifest {
            cfg.manifest = manifest.clone();
        }
        if !self.training_ids.is_empty() {
            cfg.training_ids = self.training_ids.clone();
        }
        if !self.validation_ids.is_empty() {
            cfg.validation_ids = self.validation_ids.clone();
        }
        if let Some(v) = self.iterations {
            cfg.iterations = v;
        }
        if let Some(v) = self.batch_size {
            cfg.batch_size = v;
        }
        if let Some(v) = self.lr {
            cfg.learning_rate = v;
        }
        if let Some(v) = self.validate_every {
            cfg.validate_every = v;
        }
        if let Some(v) = self.patience {
            cfg.early_stopping.enabled = true;
            cfg.early_stopping.patience = v;
        }
        if self.seed.is_some() {
            cfg.seed = self.seed;
        }
        cfg.resume |= self.resume;
        cfg.reset_val_loss |= self.reset_val_loss;
        cfg.early_stopping.reset_patience |= self.reset_patience;
    }
}

pub fn run_train(args: TrainArgs) -> anyhow::Result<()> {
    validate_backend_choice(args.backend)?;

    let mut cfg = match &args.config {
        Some(path) => TrainConfig::from_path(path)?,
        None => TrainConfig::default(),
    };
    args.apply(&mut cfg);

    let loader = ManifestLoader::from_path(&cfg.manifest).map_err(|e| {
        anyhow::anyhow!(
            "failed to load volume manifest at {}: {e}",
            cfg.manifest.display()
        )
    })?;
    let paths = RunPaths::new(&cfg.output_root, &cfg.model_name);
    let sink = JsonlMetricSink::open(&paths.metrics_path(), cfg.resume).map_err(|e| {
        anyhow::anyhow!(
            "failed to open metrics stream {}: {e}",
            paths.metrics_path().display()
        )
    })?;

    let device = <ADBackend as Backend>::Device::default();
    let mut trainer = Trainer::<ADBackend>::new(&cfg, &loader, sink, device)?;
    let summary = trainer.run()?;
    info!(
        iterations = summary.completed_iterations,
        lowest_val_loss = ?summary.lowest_val_loss,
        checkpoint = %paths.model_path().display(),
        "run complete"
    );
    Ok(())
}

pub fn validate_backend_choice(kind: BackendKind) -> anyhow::Result<()> {
    let built_wgpu = cfg!(feature = "backend-wgpu");
    match (kind, built_wgpu) {
        (BackendKind::Wgpu, false) => {
            anyhow::bail!("backend-wgpu feature not enabled; rebuild with --features backend-wgpu or choose ndarray backend")
        }
        (BackendKind::NdArray, true) => {
            tracing::warn!("built with backend-wgpu; training will still use the WGPU backend despite --backend ndarray");
        }
        _ => {}
    }
    Ok(())
}

/// Rebuilds the network described by `cfg` and loads the run's best checkpoint into it.
pub fn load_run_checkpoint(
    cfg: &TrainConfig,
    device: &<TrainBackend as Backend>::Device,
) -> Result<UNet<TrainBackend>, TrainError> {
    let paths = RunPaths::new(&cfg.output_root, &cfg.model_name);
    load_unet_from_checkpoint::<TrainBackend>(
        &cfg.model_config(),
        cfg.input_shape(),
        &paths.model_path(),
        device,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_config_values() {
        let args = TrainArgs::parse_from([
            "train",
            "--model-name",
            "kidney",
            "--training-ids",
            "1,2,3",
            "--patience",
            "7",
            "--resume",
        ]);
        let mut cfg = TrainConfig {
            validation_ids: vec![9],
            ..Default::default()
        };
        args.apply(&mut cfg);
        assert_eq!(cfg.model_name, "kidney");
        assert_eq!(cfg.output_root, PathBuf::from("runs"));
        assert_eq!(cfg.training_ids, vec![1, 2, 3]);
        assert_eq!(cfg.validation_ids, vec![9]);
        assert!(cfg.early_stopping.enabled);
        assert_eq!(cfg.early_stopping.patience, 7);
        assert!(cfg.resume);
        assert!(!cfg.reset_val_loss);
    }

    #[test]
    fn wgpu_requires_feature() {
        if cfg!(feature = "backend-wgpu") {
            assert!(validate_backend_choice(BackendKind::Wgpu).is_ok());
        } else {
            assert!(validate_backend_choice(BackendKind::Wgpu).is_err());
        }
        assert!(validate_backend_choice(BackendKind::NdArray).is_ok());
    }
}
