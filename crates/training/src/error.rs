use data_contracts::LogError;
use models::ArchitectureError;
use patch_dataset::DatasetError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TrainError {
    #[error("failed to read config {path}: {source}")]
    ConfigIo {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    ConfigParse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid training config: {0}")]
    Config(String),
    #[error("no training volumes configured")]
    EmptyTrainingSet,
    #[error("validation is not supported with variable patch sizes")]
    VariablePatchValidation,
    #[error(transparent)]
    Dataset(#[from] DatasetError),
    #[error(transparent)]
    Architecture(#[from] ArchitectureError),
    #[error(transparent)]
    Log(#[from] LogError),
    #[error("checkpoint {path}: {message}")]
    Checkpoint { path: PathBuf, message: String },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to snapshot settings: {0}")]
    Settings(#[from] serde_json::Error),
}
