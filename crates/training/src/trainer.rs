//! The training loop: INIT in `Trainer::new`, then ITERATE, STOPPED and FINALIZE in `Trainer::run`.

use crate::checkpoint::{
    load_optimizer, load_unet_from_checkpoint, save_checkpoint, save_optimizer, CheckpointTracker,
};
use crate::config::{ClassWeight, TrainConfig};
use crate::early_stopping::EarlyStopping;
use crate::error::TrainError;
use crate::loss::Objective;
use crate::metrics::{MetricSink, StepMetrics};
use crate::paths::RunPaths;
use burn::module::AutodiffModule;
use burn::optim::{AdamConfig, GradientsParams, Optimizer};
use burn::tensor::backend::AutodiffBackend;
use data_contracts::TrainingLog;
use models::UNet;
use patch_dataset::{
    assemble, class_weight_auto, AugmentMode, OfflineAugmenter, OnlineAugmenter, PatchBatch,
    PatchSampler, SliceIndex, SplitRole, VolumeLoader, VolumeSet,
};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Outcome of one `Trainer::run` call.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainSummary {
    /// Iteration the run started at; non-zero when resuming.
    pub start_iteration: usize,
    /// Total completed iterations recorded in the log.
    pub completed_iterations: usize,
    pub stopped_early: bool,
    pub lowest_val_loss: Option<f64>,
    pub lowest_val_loss_iteration: Option<usize>,
    /// Checkpoints written during this run.
    pub checkpoints_saved: usize,
    pub duration_secs: f64,
}

pub struct Trainer<B: AutodiffBackend> {
    cfg: TrainConfig,
    paths: RunPaths,
    device: B::Device,
    training: VolumeSet,
    validation: VolumeSet,
    sampler: PatchSampler,
    model: UNet<B>,
    objective: Objective,
    log: TrainingLog,
    tracker: CheckpointTracker,
    early_stopping: EarlyStopping,
    start_iteration: usize,
    sampling_seed: u64,
    sink: Box<dyn MetricSink>,
}

impl<B: AutodiffBackend> Trainer<B> {
    /// Loads the volumes, builds the slice index and sampler, resolves the class
    /// weight, then either builds a fresh model and log or restores both from the run directory.
    pub fn new(
        cfg: &TrainConfig,
        loader: &dyn VolumeLoader,
        sink: impl MetricSink + 'static,
        device: B::Device,
    ) -> Result<Self, TrainError> {
        cfg.validate()?;
        let paths = RunPaths::new(&cfg.output_root, &cfg.model_name);
        paths.create_dirs()?;

        let training = loader.load(&cfg.training_ids)?;
        let validation = loader.load(&cfg.validation_ids)?;
        if training.is_empty() {
            return Err(TrainError::EmptyTrainingSet);
        }
        info!(
            training = training.len(),
            validation = validation.len(),
            "loaded volumes"
        );

        let mut sampler = build_sampler(cfg, loader, &training, &validation)?;

        if let Some(seed) = cfg.seed {
            B::seed(seed);
        }
        let model_cfg = cfg.model_config();
        let input = cfg.input_shape();

        let (model, mut log, fn_class_weight) = if cfg.resume {
            let log = TrainingLog::load(&paths.log_path())?;
            let last = paths.last_model_path();
            let source = if last.exists() {
                last
            } else {
                warn!("no last-iteration model in run directory, resuming from the best checkpoint");
                paths.model_path()
            };
            let model = load_unet_from_checkpoint::<B>(&model_cfg, input, &source, &device)?;
            // Reuse the logged auto weight so the loss stays the same across the resume.
            let weight = match cfg.class_weight {
                ClassWeight::Auto { .. } => log.fn_class_weight,
                ClassWeight::Fixed { .. } => {
                    resolve_class_weight(cfg, &mut sampler, &training, &validation)?
                }
            };
            info!(
                iterations = log.iterations(),
                lowest_val_loss = ?log.lowest_val_loss,
                "resuming from {}",
                paths.run_dir().display()
            );
            (model, log, weight)
        } else {
            if paths.log_path().exists() {
                warn!(
                    "overwriting existing run at {}",
                    paths.run_dir().display()
                );
            }
            for stale in [paths.last_model_path(), paths.optimizer_path()] {
                if stale.exists() {
                    std::fs::remove_file(stale)?;
                }
            }
            let weight = resolve_class_weight(cfg, &mut sampler, &training, &validation)?;
            let model = UNet::<B>::new(&model_cfg, input, &device)?;
            let log = TrainingLog::new(cfg.settings_snapshot()?, weight);
            (model, log, weight)
        };

        let sampling_seed = match log.sampling_seed.or(cfg.sampler_config().seed) {
            Some(seed) => seed,
            None => sampler.draw_seed(),
        };
        log.sampling_seed = Some(sampling_seed);

        let start_iteration = log.iterations();
        let best = if cfg.resume && !cfg.reset_val_loss {
            log.lowest_val_loss_or_inf()
        } else {
            f64::INFINITY
        };
        let counter = if cfg.resume && !cfg.early_stopping.reset_patience {
            start_iteration.saturating_sub(log.lowest_val_loss_iteration.unwrap_or(0))
        } else {
            0
        };
        log.save(&paths.log_path())?;

        info!(
            parameters = model.plan().parameter_count(),
            fn_class_weight, start_iteration, "model ready"
        );

        Ok(Self {
            objective: Objective {
                kind: cfg.loss,
                fn_class_weight,
                main_weight: cfg.main_loss_weight,
                aux_weight: cfg.aux_loss_weight,
            },
            cfg: cfg.clone(),
            paths,
            device,
            training,
            validation,
            sampler,
            model,
            log,
            tracker: CheckpointTracker::new(best),
            early_stopping: EarlyStopping::new(&cfg.early_stopping, counter),
            start_iteration,
            sampling_seed,
            sink: Box::new(sink),
        })
    }

    pub fn model(&self) -> &UNet<B> {
        &self.model
    }

    pub fn log(&self) -> &TrainingLog {
        &self.log
    }

    pub fn paths(&self) -> &RunPaths {
        &self.paths
    }

    pub fn objective(&self) -> &Objective {
        &self.objective
    }

    pub fn start_iteration(&self) -> usize {
        self.start_iteration
    }

    pub fn run(&mut self) -> Result<TrainSummary, TrainError> {
        let mut optim = AdamConfig::new().init::<B, UNet<B>>();
        if self.cfg.resume {
            let path = self.paths.optimizer_path();
            if path.exists() {
                optim = load_optimizer::<B, _>(optim, &path, &self.device)?;
                debug!("restored optimizer state from {}", path.display());
            } else {
                warn!("no optimizer state in run directory, resuming with a fresh optimizer");
            }
        }
        let mut model = self.model.clone();
        let total = self.cfg.iterations;
        let prior_secs = self.log.training_duration_secs;
        let clock = Instant::now();
        let saves_before = self.tracker.saves();
        let normalize = self.sampler.config().normalize;

        info!(start = self.start_iteration, total, "starting training");
        for i in self.start_iteration..total {
            if self.early_stopping.should_stop() {
                self.log.stopped_early = true;
                info!(
                    iteration = i,
                    patience = self.early_stopping.patience(),
                    "early stopping"
                );
                break;
            }
            self.early_stopping.tick();

            let step_seed = iteration_seed(self.sampling_seed, i);
            self.sampler.reseed(step_seed);
            B::seed(step_seed);

            let patches =
                self.sampler
                    .sample_batch(&self.training, self.cfg.batch_size, SplitRole::Training)?;
            let batch = assemble::<B>(&patches, normalize, &self.device)?;
            let (next, train) = self.train_step(model, &mut optim, batch);
            model = next;
            self.emit("train", i, &train)?;

            if i % self.cfg.validate_every == 0 {
                let val = self.validate(&model)?;
                self.emit("val", i, &val)?;
                if self.tracker.observe(val.loss) {
                    save_checkpoint(&model, &self.paths.model_path())?;
                    self.log.lowest_val_loss = Some(val.loss);
                    self.log.lowest_val_loss_iteration = Some(i);
                    self.early_stopping.reset();
                    info!(iteration = i, val_loss = val.loss, "validation loss improved, checkpoint saved");
                }
                self.log.push_validation(i, val.entries());
            }
            self.log.push_training(train.entries());
            save_checkpoint(&model, &self.paths.last_model_path())?;
            save_optimizer::<B, _>(&optim, &self.paths.optimizer_path())?;

            let elapsed = prior_secs + clock.elapsed().as_secs_f64();
            self.log.training_duration_secs = elapsed;
            self.log.save(&self.paths.log_path())?;
            info!(
                iteration = i + 1,
                total,
                loss = train.loss,
                lowest_train_loss = self.log.lowest_training("loss").unwrap_or(f64::NAN),
                lowest_val_loss = self.tracker.best(),
                eta_secs = eta_secs(elapsed, i + 1, total),
                "iteration done"
            );
        }

        self.model = model;
        self.log.training_duration_secs = prior_secs + clock.elapsed().as_secs_f64();
        self.log.save(&self.paths.log_path())?;
        self.sink.flush()?;
        info!(
            iterations = self.log.iterations(),
            secs = self.log.training_duration_secs,
            stopped_early = self.log.stopped_early,
            "training finished"
        );

        Ok(TrainSummary {
            start_iteration: self.start_iteration,
            completed_iterations: self.log.iterations(),
            stopped_early: self.log.stopped_early,
            lowest_val_loss: self.log.lowest_val_loss,
            lowest_val_loss_iteration: self.log.lowest_val_loss_iteration,
            checkpoints_saved: self.tracker.saves() - saves_before,
            duration_secs: self.log.training_duration_secs,
        })
    }

    /// One optimizer step on `batch`.
    pub fn train_step<O: Optimizer<UNet<B>, B>>(
        &self,
        model: UNet<B>,
        optim: &mut O,
        batch: PatchBatch<B>,
    ) -> (UNet<B>, StepMetrics) {
        let output = model.forward(batch.images.clone());
        let (loss, metrics) = self.objective.evaluate(output, &batch);
        let grads = GradientsParams::from_grads(loss.backward(), &model);
        (optim.step(self.cfg.learning_rate, model, grads), metrics)
    }

    /// Scores `model` on a fresh validation draw without touching its parameters.
    pub fn validate(&mut self, model: &UNet<B>) -> Result<StepMetrics, TrainError> {
        if self.sampler.config().variable_patch_size {
            return Err(TrainError::VariablePatchValidation);
        }
        let patches = self.sampler.sample_batch(
            &self.validation,
            self.cfg.validation_patches,
            SplitRole::Validation,
        )?;
        let normalize = self.sampler.config().normalize;
        let model = model.valid();
        let mut parts = Vec::new();
        for chunk in patches.chunks(self.cfg.validation_batch_size.max(1)) {
            let batch = assemble::<B::InnerBackend>(chunk, normalize, &self.device)?;
            let output = model.forward(batch.images.clone());
            parts.push(self.objective.evaluate(output, &batch).1);
        }
        debug!(sub_batches = parts.len(), "validation done");
        Ok(StepMetrics::mean(&parts))
    }

    fn emit(&mut self, prefix: &str, step: usize, metrics: &StepMetrics) -> Result<(), TrainError> {
        for (name, value) in metrics.entries() {
            self.sink.record(&format!("{prefix}_{name}"), step, value)?;
        }
        Ok(())
    }
}

fn build_sampler(
    cfg: &TrainConfig,
    loader: &dyn VolumeLoader,
    training: &VolumeSet,
    validation: &VolumeSet,
) -> Result<PatchSampler, TrainError> {
    let sampler_cfg = cfg.sampler_config();
    let mut index = SliceIndex::build(training);
    index.update(&validation.ids, &validation.labels);
    let seed = sampler_cfg.seed.unwrap_or(0);
    let mode = sampler_cfg.augment;
    let sampler = PatchSampler::new(sampler_cfg, index);
    Ok(match mode {
        AugmentMode::Online => sampler.with_online(OnlineAugmenter::new(cfg.augment.clone())),
        AugmentMode::Offline => {
            let mut augmenter =
                OfflineAugmenter::new(cfg.augment.clone(), cfg.offline_variants, seed);
            if !cfg.artificial_ids.is_empty() {
                let pool = loader.load(&cfg.artificial_ids)?;
                augmenter = augmenter.with_artificial((0..pool.len()).map(|i| pool.pair(i)));
                info!(artificial = augmenter.artificial_len(), "artificial positives ready");
            }
            sampler.with_offline(augmenter)
        }
    })
}

/// The weighted loss's foreground weight. `Auto` draws label patches from both
/// splits; normalisation is irrelevant since only labels are counted.
fn resolve_class_weight(
    cfg: &TrainConfig,
    sampler: &mut PatchSampler,
    training: &VolumeSet,
    validation: &VolumeSet,
) -> Result<f64, TrainError> {
    if let Some(weight) = cfg.fixed_class_weight() {
        return Ok(weight);
    }
    let ClassWeight::Auto { samples } = cfg.class_weight else {
        return Ok(1.0);
    };
    let merged = training.merged(validation);
    let patches = sampler.sample_batch(&merged, samples.max(1), SplitRole::Training)?;
    let weight = class_weight_auto(&patches);
    info!(samples, weight, "estimated false-negative class weight");
    Ok(weight)
}

/// Seed of iteration `i`'s sampling and dropout streams.
pub fn iteration_seed(base: u64, i: usize) -> u64 {
    base ^ (i as u64).wrapping_add(1).wrapping_mul(0x9E37_79B9_7F4A_7C15)
}

/// Remaining seconds, extrapolated linearly from the completed share.
pub fn eta_secs(elapsed: f64, completed: usize, total: usize) -> f64 {
    if completed == 0 || total == 0 {
        return f64::NAN;
    }
    elapsed * (total as f64 / completed as f64 - 1.0)
}
