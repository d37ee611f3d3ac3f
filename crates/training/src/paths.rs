use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// File layout of one training run under `<output_root>/<model_name>/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunPaths {
    root: PathBuf,
    model_name: String,
}

impl RunPaths {
    pub fn new(output_root: impl Into<PathBuf>, model_name: impl Into<String>) -> Self {
        Self {
            root: output_root.into(),
            model_name: model_name.into(),
        }
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    pub fn run_dir(&self) -> PathBuf {
        self.root.join(&self.model_name)
    }

    /// Checkpoint written by the burn file recorder, which owns the `.bin` extension.
    pub fn model_path(&self) -> PathBuf {
        self.run_dir().join("model.bin")
    }

    /// Model after the latest iteration, reloaded on resume.
    pub fn last_model_path(&self) -> PathBuf {
        self.run_dir().join("last_model.bin")
    }

    pub fn optimizer_path(&self) -> PathBuf {
        self.run_dir().join("optimizer.bin")
    }

    pub fn log_path(&self) -> PathBuf {
        self.run_dir().join("log.json")
    }

    pub fn metrics_path(&self) -> PathBuf {
        self.run_dir().join("metrics.jsonl")
    }

    pub fn create_dirs(&self) -> io::Result<()> {
        fs::create_dir_all(self.run_dir())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}
