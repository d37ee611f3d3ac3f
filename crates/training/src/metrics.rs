//! Per-step metric values and the sinks they are streamed to.

use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Scalars produced by one training step or one validation check.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StepMetrics {
    pub loss: f64,
    pub main_loss: f64,
    pub main_accuracy: f64,
    pub aux_loss: Option<f64>,
    pub aux_accuracy: Option<f64>,
}

impl StepMetrics {
    /// Named values in log order. Networks without an auxiliary head report only
    /// the combined loss and the main accuracy.
    pub fn entries(&self) -> Vec<(&'static str, f64)> {
        match (self.aux_loss, self.aux_accuracy) {
            (Some(aux_loss), Some(aux_accuracy)) => vec![
                ("loss", self.loss),
                ("main_loss", self.main_loss),
                ("aux_loss", aux_loss),
                ("main_accuracy", self.main_accuracy),
                ("aux_accuracy", aux_accuracy),
            ],
            _ => vec![("loss", self.loss), ("accuracy", self.main_accuracy)],
        }
    }

    /// Unweighted per-metric mean over sub-batch results.
    pub fn mean(parts: &[StepMetrics]) -> StepMetrics {
        if parts.is_empty() {
            return StepMetrics::default();
        }
        let n = parts.len() as f64;
        let avg = |f: fn(&StepMetrics) -> f64| parts.iter().map(f).sum::<f64>() / n;
        let avg_opt = |f: fn(&StepMetrics) -> Option<f64>| {
            parts
                .iter()
                .map(f)
                .collect::<Option<Vec<_>>>()
                .map(|v| v.iter().sum::<f64>() / n)
        };
        StepMetrics {
            loss: avg(|m| m.loss),
            main_loss: avg(|m| m.main_loss),
            main_accuracy: avg(|m| m.main_accuracy),
            aux_loss: avg_opt(|m| m.aux_loss),
            aux_accuracy: avg_opt(|m| m.aux_accuracy),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    pub name: String,
    pub step: usize,
    pub value: f64,
}

/// Destination for named scalars keyed by step index.
pub trait MetricSink {
    fn record(&mut self, name: &str, step: usize, value: f64) -> io::Result<()>;

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// One JSON object per line.
pub struct JsonlMetricSink {
    writer: BufWriter<File>,
}

impl JsonlMetricSink {
    /// Opens `path` for writing; `append` keeps earlier records so a resumed run
    /// continues the same stream.
    pub fn open(path: &Path, append: bool) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }
}

impl MetricSink for JsonlMetricSink {
    fn record(&mut self, name: &str, step: usize, value: f64) -> io::Result<()> {
        let record = MetricRecord {
            name: name.to_string(),
            step,
            value,
        };
        serde_json::to_writer(&mut self.writer, &record)?;
        self.writer.write_all(b"\n")
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

/// In-process sink; clones share one buffer.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    records: Arc<Mutex<Vec<MetricRecord>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<MetricRecord> {
        match self.records.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// `(step, value)` pairs recorded under `name`, in arrival order.
    pub fn series(&self, name: &str) -> Vec<(usize, f64)> {
        self.records()
            .into_iter()
            .filter(|r| r.name == name)
            .map(|r| (r.step, r.value))
            .collect()
    }
}

impl MetricSink for MemorySink {
    fn record(&mut self, name: &str, step: usize, value: f64) -> io::Result<()> {
        let record = MetricRecord {
            name: name.to_string(),
            step,
            value,
        };
        match self.records.lock() {
            Ok(mut guard) => guard.push(record),
            Err(poisoned) => poisoned.into_inner().push(record),
        }
        Ok(())
    }
}
