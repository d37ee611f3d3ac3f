use crate::config::EarlyStoppingConfig;

/// Patience counter: ticks once per iteration, resets on every validation improvement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EarlyStopping {
    enabled: bool,
    patience: usize,
    counter: usize,
}

impl EarlyStopping {
    pub fn new(cfg: &EarlyStoppingConfig, counter: usize) -> Self {
        Self {
            enabled: cfg.enabled,
            patience: cfg.patience,
            counter,
        }
    }

    /// Checked at the top of an iteration, before the counter ticks.
    pub fn should_stop(&self) -> bool {
        self.enabled && self.counter >= self.patience
    }

    pub fn tick(&mut self) {
        self.counter += 1;
    }

    pub fn reset(&mut self) {
        self.counter = 0;
    }

    pub fn counter(&self) -> usize {
        self.counter
    }

    pub fn patience(&self) -> usize {
        self.patience
    }
}
