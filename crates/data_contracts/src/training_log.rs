//! The resumable training log written next to the checkpoint after every iteration.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LogError {
    #[error("failed to read or write training log: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed training log: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TrainingLog {
    /// One value per iteration for every training metric.
    pub training: BTreeMap<String, Vec<f64>>,
    /// One value per validation check for every validation metric.
    pub validation: BTreeMap<String, Vec<f64>>,
    /// Iteration index of each validation check.
    #[serde(default)]
    pub validation_iterations: Vec<usize>,
    /// `None` until the first validation; JSON has no infinity.
    pub lowest_val_loss: Option<f64>,
    pub lowest_val_loss_iteration: Option<usize>,
    pub training_duration_secs: f64,
    pub stopped_early: bool,
    pub fn_class_weight: f64,
    /// Base of the per-iteration sampling seeds; a resumed run continues the same streams.
    #[serde(default)]
    pub sampling_seed: Option<u64>,
    /// Configuration snapshot of the run that produced this log.
    #[serde(default)]
    pub settings: serde_json::Value,
}

impl TrainingLog {
    pub fn new(settings: serde_json::Value, fn_class_weight: f64) -> Self {
        Self {
            settings,
            fn_class_weight,
            ..Default::default()
        }
    }

    pub fn load(path: &Path) -> Result<Self, LogError> {
        let raw = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Write through a sibling temp file so an interrupted save never truncates the log.
    pub fn save(&self, path: &Path) -> Result<(), LogError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(self)?)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Completed iterations, i.e. the length of the longest training series.
    pub fn iterations(&self) -> usize {
        self.training.values().map(Vec::len).max().unwrap_or(0)
    }

    pub fn push_training<'a>(&mut self, entries: impl IntoIterator<Item = (&'a str, f64)>) {
        for (name, value) in entries {
            self.training.entry(name.to_string()).or_default().push(value);
        }
    }

    pub fn push_validation<'a>(
        &mut self,
        iteration: usize,
        entries: impl IntoIterator<Item = (&'a str, f64)>,
    ) {
        self.validation_iterations.push(iteration);
        for (name, value) in entries {
            self.validation
                .entry(name.to_string())
                .or_default()
                .push(value);
        }
    }

    pub fn lowest_val_loss_or_inf(&self) -> f64 {
        self.lowest_val_loss.unwrap_or(f64::INFINITY)
    }

    pub fn lowest_training(&self, metric: &str) -> Option<f64> {
        self.training
            .get(metric)?
            .iter()
            .copied()
            .fold(None, |acc, v| Some(acc.map_or(v, |a: f64| a.min(v))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iterations_follow_the_longest_series() {
        let mut log = TrainingLog::default();
        assert_eq!(log.iterations(), 0);
        log.push_training([("loss", 0.5), ("accuracy", 0.9)]);
        log.push_training([("loss", 0.4)]);
        assert_eq!(log.iterations(), 2);
        assert_eq!(log.lowest_training("loss"), Some(0.4));
        assert_eq!(log.lowest_training("missing"), None);
    }

    #[test]
    fn missing_best_loss_reads_as_infinite() {
        let log = TrainingLog::default();
        assert!(log.lowest_val_loss_or_inf().is_infinite());
    }
}
