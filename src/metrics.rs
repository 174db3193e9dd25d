//! Per-iteration result records and the run-level result log.
//!
//! Every inner-loop iteration emits one [`IterationRecord`]; the ordered
//! [`ResultLog`] collects them for later aggregation or export. No file
//! format is mandated by the loop itself; the log serializes to JSON for
//! downstream plotting.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::timing::Duration;

/// Metrics for a single inner-loop iteration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IterationRecord {
    /// Iteration number (1-indexed).
    pub iteration: usize,

    /// Training loss of the target model on the current batch.
    pub train_loss: f32,

    /// Held-out loss after applying the generated update.
    ///
    /// Zero when the raw value was non-finite (see `nonfinite_test`).
    pub test_loss: f32,

    /// Normalized KL term of the stochastic mask (0 when masking is off).
    pub test_kld: f32,

    /// Accumulated walltime of the run up to and including this iteration.
    pub walltime: Duration,

    /// Per-layer sparsity ratios, keyed `sparse_<layer-id>`.
    ///
    /// Fraction of mask entries above the sparsity threshold, normalized
    /// by the configured unit count of the layer. Empty when masking is
    /// disabled. `BTreeMap` keeps layer ordering stable in exports.
    pub sparsity: BTreeMap<String, f32>,

    /// Mean keep probability emitted by the sampler (masking only).
    pub keep_prob_mean: Option<f32>,

    /// Whether the held-out loss came back non-finite and was replaced by
    /// a safe zero. The run continues; this flag makes the condition
    /// observable.
    pub nonfinite_test: bool,
}

/// Ordered sequence of per-iteration records for one inner-loop run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResultLog {
    records: Vec<IterationRecord>,
}

impl ResultLog {
    /// Creates an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a record.
    pub fn push(&mut self, record: IterationRecord) {
        self.records.push(record);
    }

    /// Number of recorded iterations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the log is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// All records, in iteration order.
    #[must_use]
    pub fn records(&self) -> &[IterationRecord] {
        &self.records
    }

    /// Last record, if any.
    #[must_use]
    pub fn last(&self) -> Option<&IterationRecord> {
        self.records.last()
    }

    /// Mean training loss across the run.
    #[must_use]
    pub fn mean_train_loss(&self) -> Option<f32> {
        self.mean(|r| r.train_loss)
    }

    /// Mean held-out loss across the run.
    #[must_use]
    pub fn mean_test_loss(&self) -> Option<f32> {
        self.mean(|r| r.test_loss)
    }

    /// Number of iterations whose held-out loss was non-finite.
    #[must_use]
    pub fn nonfinite_count(&self) -> usize {
        self.records.iter().filter(|r| r.nonfinite_test).count()
    }

    /// Serializes the whole log to a JSON string.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(&self.records)
    }

    fn mean(&self, f: impl Fn(&IterationRecord) -> f32) -> Option<f32> {
        if self.records.is_empty() {
            return None;
        }
        let sum: f32 = self.records.iter().map(f).sum();
        Some(sum / self.records.len() as f32)
    }
}
