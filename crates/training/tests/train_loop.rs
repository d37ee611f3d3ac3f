use burn::backend::Autodiff;
use burn::tensor::Tensor;
use burn_ndarray::NdArray;
use data_contracts::TrainingLog;
use models::{SpatialDims, UNetConfig};
use patch_dataset::{InMemoryLoader, SamplerConfig, Volume, VolumePair};
use std::path::Path;
use training::{
    load_run_checkpoint, ClassWeight, EarlyStoppingConfig, LossKind, MemorySink, TrainConfig,
    TrainError, Trainer,
};

type TestBackend = Autodiff<NdArray<f32>>;

fn volume_with_voxel(y: usize, x: usize) -> VolumePair {
    let dims = [1, 16, 16];
    let image = Volume::new(dims, (0..256).map(|v| (v % 13) as f32).collect()).unwrap();
    let mut label = Volume::zeros(dims);
    label.set(0, y, x, 1.0);
    VolumePair {
        image,
        label,
        aux_label: None,
    }
}

fn loader() -> InMemoryLoader {
    InMemoryLoader::new()
        .with(1, volume_with_voxel(5, 7))
        .with(2, volume_with_voxel(9, 3))
}

fn config(root: &Path, iterations: usize) -> TrainConfig {
    TrainConfig {
        model_name: "planar".into(),
        output_root: root.to_path_buf(),
        training_ids: vec![1],
        validation_ids: vec![2],
        iterations,
        batch_size: 2,
        validation_patches: 2,
        validation_batch_size: 1,
        validate_every: 1,
        learning_rate: 1e-3,
        loss: LossKind::WeightedBinaryCrossEntropy,
        class_weight: ClassWeight::Auto { samples: 32 },
        seed: Some(3),
        sampler: SamplerConfig {
            patch_size: [1, 8, 8],
            ..Default::default()
        },
        model: UNetConfig {
            dims: SpatialDims::Two,
            start_channels: 4,
            depth: 1,
            dropout: 0.0,
            ..Default::default()
        },
        ..Default::default()
    }
}

fn trainer(cfg: &TrainConfig, sink: &MemorySink) -> Result<Trainer<TestBackend>, TrainError> {
    Trainer::<TestBackend>::new(cfg, &loader(), sink.clone(), Default::default())
}

#[test]
fn single_iteration_logs_and_checkpoints() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path(), 1);
    let sink = MemorySink::new();
    let mut trainer = trainer(&cfg, &sink).unwrap();
    assert!(trainer.objective().fn_class_weight > 1.0);

    let summary = trainer.run().unwrap();
    assert_eq!(summary.completed_iterations, 1);
    assert_eq!(summary.checkpoints_saved, 1);
    assert_eq!(summary.lowest_val_loss_iteration, Some(0));
    assert!(!summary.stopped_early);

    let paths = trainer.paths();
    assert!(paths.model_path().exists());
    let log = TrainingLog::load(&paths.log_path()).unwrap();
    assert_eq!(log.training["loss"].len(), 1);
    assert_eq!(log.training["aux_loss"].len(), 1);
    assert_eq!(log.validation_iterations, vec![0]);
    assert_eq!(log.lowest_val_loss, summary.lowest_val_loss);
    assert!(log.lowest_val_loss.is_some_and(f64::is_finite));

    assert_eq!(sink.series("train_loss").len(), 1);
    assert_eq!(sink.series("val_loss")[0].0, 0);
    assert_eq!(sink.series("val_main_accuracy").len(), 1);

    let restored = load_run_checkpoint(&cfg, &Default::default()).unwrap();
    let output = restored.forward(Tensor::zeros([1, 1, 1, 8, 8], &Default::default()));
    assert_eq!(output.main.dims(), [1, 1, 1, 8, 8]);
}

#[test]
fn resumed_run_continues_the_log() {
    let dir = tempfile::tempdir().unwrap();
    let first_cfg = config(dir.path(), 2);
    let mut first = trainer(&first_cfg, &MemorySink::new()).unwrap();
    first.run().unwrap();
    let before = first.log().clone();
    assert_eq!(before.iterations(), 2);

    let resumed_cfg = TrainConfig {
        resume: true,
        ..config(dir.path(), 4)
    };
    let sink = MemorySink::new();
    let mut resumed = trainer(&resumed_cfg, &sink).unwrap();
    assert_eq!(resumed.start_iteration(), 2);
    assert_eq!(resumed.objective().fn_class_weight, before.fn_class_weight);

    let summary = resumed.run().unwrap();
    assert_eq!(summary.start_iteration, 2);
    assert_eq!(summary.completed_iterations, 4);
    let after = resumed.log();
    for (name, values) in &before.training {
        assert_eq!(&after.training[name][..2], &values[..]);
    }
    assert_eq!(after.validation_iterations, vec![0, 1, 2, 3]);
    assert!(after.training_duration_secs >= before.training_duration_secs);
    let steps: Vec<usize> = sink.series("train_loss").iter().map(|s| s.0).collect();
    assert_eq!(steps, vec![2, 3]);
    assert!(resumed.paths().last_model_path().exists());
    assert!(resumed.paths().optimizer_path().exists());

    let straight_dir = tempfile::tempdir().unwrap();
    let mut straight = trainer(&config(straight_dir.path(), 4), &MemorySink::new()).unwrap();
    straight.run().unwrap();
    let straight = straight.log();
    assert_eq!(after.training, straight.training);
    assert_eq!(after.validation, straight.validation);
    assert_eq!(after.lowest_val_loss, straight.lowest_val_loss);
    assert_eq!(after.lowest_val_loss_iteration, straight.lowest_val_loss_iteration);
}

/// Runs `iterations` plain iterations, validating only at iteration 0.
fn validated_once(root: &Path, iterations: usize) -> TrainingLog {
    let cfg = TrainConfig {
        validate_every: 100,
        ..config(root, iterations)
    };
    let mut first = trainer(&cfg, &MemorySink::new()).unwrap();
    first.run().unwrap();
    first.log().clone()
}

fn resume_with_patience(root: &Path, patience: usize, reset_patience: bool) -> TrainConfig {
    TrainConfig {
        resume: true,
        validate_every: 100,
        early_stopping: EarlyStoppingConfig {
            enabled: true,
            patience,
            reset_patience,
        },
        ..config(root, 10)
    }
}

#[test]
fn resume_carries_the_patience_counter() {
    let dir = tempfile::tempdir().unwrap();
    let log = validated_once(dir.path(), 3);
    assert_eq!(log.lowest_val_loss_iteration, Some(0));

    let mut resumed = trainer(&resume_with_patience(dir.path(), 3, false), &MemorySink::new()).unwrap();
    let summary = resumed.run().unwrap();
    assert!(summary.stopped_early);
    assert_eq!(summary.completed_iterations, 3);
}

#[test]
fn reset_patience_restarts_the_counter() {
    let dir = tempfile::tempdir().unwrap();
    validated_once(dir.path(), 3);

    let mut resumed = trainer(&resume_with_patience(dir.path(), 3, true), &MemorySink::new()).unwrap();
    let summary = resumed.run().unwrap();
    assert!(summary.stopped_early);
    assert_eq!(summary.completed_iterations, 6);
}

#[test]
fn reset_val_loss_checkpoints_on_the_next_validation() {
    let dir = tempfile::tempdir().unwrap();
    let mut first = trainer(&config(dir.path(), 2), &MemorySink::new()).unwrap();
    first.run().unwrap();

    let cfg = TrainConfig {
        resume: true,
        reset_val_loss: true,
        ..config(dir.path(), 3)
    };
    let mut resumed = trainer(&cfg, &MemorySink::new()).unwrap();
    let summary = resumed.run().unwrap();
    assert_eq!(summary.checkpoints_saved, 1);
    assert_eq!(summary.lowest_val_loss_iteration, Some(2));
}

#[test]
fn validation_without_improvement_keeps_the_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let mut first = trainer(&config(dir.path(), 1), &MemorySink::new()).unwrap();
    first.run().unwrap();
    let paths = first.paths().clone();
    let checkpoint = std::fs::read(paths.model_path()).unwrap();

    let mut log = TrainingLog::load(&paths.log_path()).unwrap();
    log.lowest_val_loss = Some(0.0);
    log.save(&paths.log_path()).unwrap();

    let cfg = TrainConfig {
        resume: true,
        ..config(dir.path(), 3)
    };
    let mut resumed = trainer(&cfg, &MemorySink::new()).unwrap();
    let summary = resumed.run().unwrap();
    assert_eq!(summary.checkpoints_saved, 0);
    assert_eq!(summary.lowest_val_loss, Some(0.0));
    assert_eq!(summary.lowest_val_loss_iteration, Some(0));
    assert_eq!(resumed.log().validation_iterations, vec![0, 1, 2]);
    assert_eq!(std::fs::read(paths.model_path()).unwrap(), checkpoint);
}

#[test]
fn resume_without_a_log_fails() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = TrainConfig {
        resume: true,
        ..config(dir.path(), 1)
    };
    assert!(matches!(
        trainer(&cfg, &MemorySink::new()),
        Err(TrainError::Log(_))
    ));
}

#[test]
fn variable_patches_cannot_be_validated() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(dir.path(), 1);
    cfg.batch_size = 1;
    cfg.sampler.variable_patch_size = true;
    let mut trainer = trainer(&cfg, &MemorySink::new()).unwrap();
    assert!(matches!(
        trainer.run(),
        Err(TrainError::VariablePatchValidation)
    ));
}

#[test]
fn patience_stops_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = TrainConfig {
        validate_every: 100,
        early_stopping: EarlyStoppingConfig {
            enabled: true,
            patience: 1,
            reset_patience: false,
        },
        ..config(dir.path(), 10)
    };
    let mut trainer = trainer(&cfg, &MemorySink::new()).unwrap();
    let summary = trainer.run().unwrap();
    assert!(summary.stopped_early);
    assert_eq!(summary.completed_iterations, 2);
    assert!(TrainingLog::load(&trainer.paths().log_path()).unwrap().stopped_early);
}

#[test]
fn missing_training_ids_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = TrainConfig {
        training_ids: Vec::new(),
        ..config(dir.path(), 1)
    };
    assert!(matches!(
        trainer(&cfg, &MemorySink::new()),
        Err(TrainError::EmptyTrainingSet)
    ));
}
