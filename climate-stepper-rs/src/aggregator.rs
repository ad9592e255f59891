//! Collecting batch results across a run.

use std::collections::HashMap;

use crate::error::StepperResult;
use crate::fields::TensorMap;

/// Receives the outcome of every stepped batch.
pub trait Aggregator {
    /// Record one batch. Field mappings are `(sample, time, ...)`.
    fn record_batch(
        &mut self,
        loss: f64,
        target_data: &TensorMap,
        gen_data: &TensorMap,
        target_data_norm: &TensorMap,
        gen_data_norm: &TensorMap,
    ) -> StepperResult<()>;

    /// Logs accumulated so far, keyed under `label`.
    fn get_logs(&self, label: &str) -> HashMap<String, f64>;
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullAggregator;

impl Aggregator for NullAggregator {
    fn record_batch(
        &mut self,
        _loss: f64,
        _target_data: &TensorMap,
        _gen_data: &TensorMap,
        _target_data_norm: &TensorMap,
        _gen_data_norm: &TensorMap,
    ) -> StepperResult<()> {
        Ok(())
    }

    fn get_logs(&self, _label: &str) -> HashMap<String, f64> {
        HashMap::new()
    }
}

/// Running mean of the batch loss.
#[derive(Debug, Clone, Default)]
pub struct MeanLossAggregator {
    loss_sum: f64,
    n_batches: usize,
}

impl MeanLossAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Batches recorded.
    pub fn n_batches(&self) -> usize {
        self.n_batches
    }

    /// Mean loss, or `None` before the first batch.
    pub fn mean_loss(&self) -> Option<f64> {
        (self.n_batches > 0).then(|| self.loss_sum / self.n_batches as f64)
    }
}

impl Aggregator for MeanLossAggregator {
    fn record_batch(
        &mut self,
        loss: f64,
        _target_data: &TensorMap,
        _gen_data: &TensorMap,
        _target_data_norm: &TensorMap,
        _gen_data_norm: &TensorMap,
    ) -> StepperResult<()> {
        self.loss_sum += loss;
        self.n_batches += 1;
        Ok(())
    }

    fn get_logs(&self, label: &str) -> HashMap<String, f64> {
        let mut logs = HashMap::new();
        if let Some(mean) = self.mean_loss() {
            logs.insert(format!("{label}/mean/loss"), mean);
        }
        logs
    }
}
