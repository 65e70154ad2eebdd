//! Batch-level checkpoint for the delivery phase.
//!
//! Batches are the unit of resumability here: resume starts right after
//! `last_successful_batch_index`, which only ever moves forward. The index is
//! only meaningful for the `batch_size` it was recorded with.

use crate::models::BatchOutcome;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A batch that delivered nothing after all attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedBatch {
    pub batch_index: usize,
    pub error: String,
    pub timestamp: DateTime<Utc>,
    /// Set when a later run delivered this batch
    #[serde(default)]
    pub resolved: bool,
}

/// A batch that delivered some records and dropped others.
///
/// The dropped records are not retried; this entry is their only trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartialBatch {
    pub batch_index: usize,
    pub succeeded: usize,
    pub failed: usize,
    #[serde(default)]
    pub errors: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

/// Running totals for the delivery phase.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchStatistics {
    pub successful_units: usize,
    pub failed_units: usize,
    pub batches_completed: usize,
    pub batches_failed: usize,
    pub retries: usize,
}

/// Checkpoint state for a delivery run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchCheckpoint {
    pub total_units: usize,
    /// Records per batch; 0 in checkpoints written before it was stored
    #[serde(default)]
    pub batch_size: usize,
    pub uploaded_count: usize,
    pub current_batch_index: usize,
    /// -1 until the first batch succeeds
    pub last_successful_batch_index: i64,
    #[serde(default)]
    pub failed_batches: Vec<FailedBatch>,
    #[serde(default)]
    pub partial_batches: Vec<PartialBatch>,
    /// Remote ids of every delivered record, in delivery order
    #[serde(default)]
    pub remote_ids: Vec<String>,
    #[serde(default)]
    pub statistics: BatchStatistics,
    pub started_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

impl BatchCheckpoint {
    /// Create a new checkpoint for `total_units` records cut into `batch_size` batches.
    pub fn new(total_units: usize, batch_size: usize) -> Self {
        let now = Utc::now();
        Self {
            total_units,
            batch_size,
            uploaded_count: 0,
            current_batch_index: 0,
            last_successful_batch_index: -1,
            failed_batches: Vec::new(),
            partial_batches: Vec::new(),
            remote_ids: Vec::new(),
            statistics: BatchStatistics::default(),
            started_at: now,
            last_updated: now,
        }
    }

    /// First batch a resumed run should attempt.
    pub fn resume_index(&self) -> usize {
        usize::try_from(self.last_successful_batch_index + 1).unwrap_or(0)
    }

    /// Record a batch that delivered at least one record.
    ///
    /// Earlier failures of the same batch are marked resolved.
    pub fn record_success(&mut self, batch_index: usize, outcome: BatchOutcome) {
        let BatchOutcome {
            succeeded,
            failed,
            remote_ids,
            errors,
        } = outcome;

        self.uploaded_count += succeeded;
        self.remote_ids.extend(remote_ids);
        self.statistics.successful_units += succeeded;
        self.statistics.failed_units += failed;
        self.statistics.batches_completed += 1;

        let index = batch_index as i64;
        if index > self.last_successful_batch_index {
            self.last_successful_batch_index = index;
        }

        for earlier in self
            .failed_batches
            .iter_mut()
            .filter(|f| f.batch_index == batch_index)
        {
            earlier.resolved = true;
        }

        if failed > 0 {
            self.partial_batches.push(PartialBatch {
                batch_index,
                succeeded,
                failed,
                errors,
                timestamp: Utc::now(),
            });
        }
    }

    /// Record a batch that delivered nothing.
    pub fn record_failure(&mut self, batch_index: usize, failed: usize, error: String) {
        self.statistics.failed_units += failed;
        self.statistics.batches_failed += 1;
        self.failed_batches.push(FailedBatch {
            batch_index,
            error,
            timestamp: Utc::now(),
            resolved: false,
        });
    }

    /// Failed batches no later run has delivered.
    pub fn outstanding_failed_batches(&self) -> Vec<FailedBatch> {
        self.failed_batches
            .iter()
            .filter(|f| !f.resolved)
            .cloned()
            .collect()
    }

    /// Records dropped inside partially successful batches.
    pub fn dropped_in_partial_batches(&self) -> usize {
        self.partial_batches.iter().map(|p| p.failed).sum()
    }
}
