//! Rate-limited, resumable batch executor.
//!
//! Flow per batch:
//! deliver → (zero successes? backoff + retry) → record outcome → save checkpoint → pace
//!
//! - Retries only when a batch delivered nothing; a partial success is final
//! - Backoff before attempt `n` (0-based) is `n * backoff_unit`
//! - The checkpoint is flushed after every batch
//! - No pause after the last batch
//! - Resume requires the batch size the checkpoint was written with

use crate::checkpoint::{
    BatchCheckpoint, FailedBatch, PartialBatch, load_checkpoint, save_checkpoint,
};
use crate::models::{BatchOutcome, DeliveryConfig, MailsiftError, PreparedRecord, Result};
use crate::report::PartialReport;
use async_trait::async_trait;
use chrono::Utc;
use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{Instrument, Span, debug, error, info, info_span, warn};

/// Delivers one batch of records to the remote system.
///
/// Remote validation and transport failures must come back as an outcome
/// with zero (or partial) successes. `Err` is reserved for conditions that
/// should stop the whole run, such as rejected credentials.
#[async_trait]
pub trait BatchDelivery: Send + Sync {
    async fn deliver(&self, batch: &[PreparedRecord]) -> Result<BatchOutcome>;
}

/// Bounded linear backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts per batch, first one included
    pub max_attempts: u32,
    pub backoff_unit: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_unit: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt` (0-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        self.backoff_unit * attempt
    }
}

/// Result of a delivery run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeliveryReport {
    pub total_units: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Percent, 0 - 100
    pub success_rate: f64,
    pub total_batches: usize,
    /// First batch attempted by this run
    pub start_batch: usize,
    pub batches_completed: usize,
    /// Failed batches not delivered by a later run
    pub batches_failed: usize,
    /// Failed batches a later run delivered
    pub batches_resolved: usize,
    /// Records dropped inside partially successful batches
    pub dropped_in_partial_batches: usize,
    pub failed_batches: Vec<FailedBatch>,
    pub partial_batches: Vec<PartialBatch>,
    /// Remote ids of every delivered record across resumes
    pub remote_ids: Vec<String>,
    /// Retry attempts issued by this run
    pub retries: usize,
    /// Inter-batch pauses taken by this run
    pub pacing_sleeps: usize,
    pub runtime_secs: f64,
}

impl DeliveryReport {
    fn from_checkpoint(cp: &BatchCheckpoint, total_batches: usize, start_batch: usize) -> Self {
        let total = cp.total_units;
        let outstanding = cp.outstanding_failed_batches();
        Self {
            total_units: total,
            succeeded: cp.uploaded_count,
            failed: total.saturating_sub(cp.uploaded_count),
            success_rate: if total > 0 {
                cp.uploaded_count as f64 / total as f64 * 100.0
            } else {
                0.0
            },
            total_batches,
            start_batch,
            batches_completed: cp.statistics.batches_completed,
            batches_failed: outstanding.len(),
            batches_resolved: cp.failed_batches.len() - outstanding.len(),
            dropped_in_partial_batches: cp.dropped_in_partial_batches(),
            failed_batches: outstanding,
            partial_batches: cp.partial_batches.clone(),
            remote_ids: cp.remote_ids.clone(),
            ..Default::default()
        }
    }
}

/// Per-run counters that never reach the checkpoint.
#[derive(Debug, Default)]
struct RunCounters {
    retries: usize,
    pacing_sleeps: usize,
}

/// Drives a delivery collaborator over fixed-size batches.
pub struct BatchExecutor {
    delivery: Box<dyn BatchDelivery>,
    batch_size: usize,
    rate_limit_delay: Duration,
    retry: RetryPolicy,
    show_progress: bool,
    span: Span,
}

impl BatchExecutor {
    /// Create an executor with a 1s pause between batches and default retries.
    pub fn new(delivery: Box<dyn BatchDelivery>, batch_size: usize) -> Self {
        Self {
            delivery,
            batch_size: batch_size.max(1),
            rate_limit_delay: Duration::from_secs(1),
            retry: RetryPolicy::default(),
            show_progress: false,
            span: info_span!("batch_executor"),
        }
    }

    /// Create an executor from the delivery section of the config.
    pub fn from_config(delivery: Box<dyn BatchDelivery>, config: &DeliveryConfig) -> Self {
        Self::new(delivery, config.batch_size)
            .with_rate_limit_delay(config.rate_limit_delay())
            .with_retry_policy(RetryPolicy {
                max_attempts: config.max_retries,
                backoff_unit: config.backoff_unit(),
            })
            .with_progress(config.show_progress)
    }

    pub fn with_rate_limit_delay(mut self, delay: Duration) -> Self {
        self.rate_limit_delay = delay;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = RetryPolicy {
            max_attempts: retry.max_attempts.max(1),
            ..retry
        };
        self
    }

    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Deliver `units` in batches, checkpointing to `checkpoint_path`.
    ///
    /// With `resume`, starts after the last successful batch recorded on disk.
    /// A resume with a batch size other than the checkpoint's is refused.
    /// A collaborator `Err` aborts the run as [`MailsiftError::Aborted`] with
    /// the partial report; batches already flushed stay recorded.
    pub async fn execute(
        &self,
        units: &[PreparedRecord],
        checkpoint_path: &Path,
        resume: bool,
    ) -> Result<DeliveryReport> {
        self.execute_inner(units, checkpoint_path, resume)
            .instrument(self.span.clone())
            .await
    }

    async fn execute_inner(
        &self,
        units: &[PreparedRecord],
        checkpoint_path: &Path,
        resume: bool,
    ) -> Result<DeliveryReport> {
        let start = Instant::now();
        let total = units.len();
        let total_batches = total.div_ceil(self.batch_size);

        info!(
            total_units = total,
            batch_size = self.batch_size,
            rate_limit_ms = self.rate_limit_delay.as_millis() as u64,
            max_attempts = self.retry.max_attempts,
            total_batches,
            "Starting batch delivery"
        );

        let mut checkpoint = self.initial_checkpoint(checkpoint_path, resume, total)?;
        let start_batch = if resume { checkpoint.resume_index() } else { 0 };
        if resume {
            info!(start_batch, "Resuming delivery");
        }

        let pb = self.progress_bar(total_batches, start_batch);
        let mut counters = RunCounters::default();

        let delivered = self
            .deliver_batches(
                units,
                &mut checkpoint,
                checkpoint_path,
                start_batch..total_batches,
                &pb,
                &mut counters,
            )
            .await;

        let mut report = DeliveryReport::from_checkpoint(&checkpoint, total_batches, start_batch);
        report.retries = counters.retries;
        report.pacing_sleeps = counters.pacing_sleeps;
        report.runtime_secs = start.elapsed().as_secs_f64();

        if let Err(e) = delivered {
            pb.abandon();
            error!(
                error = %e,
                delivered = report.succeeded,
                total = report.total_units,
                success_rate = format!("{:.1}%", report.success_rate),
                batches_completed = report.batches_completed,
                batches_failed = report.batches_failed,
                "Batch delivery aborted"
            );
            return Err(MailsiftError::aborted(e, PartialReport::Delivery(report)));
        }

        pb.finish_with_message(format!("Done! {} delivered", checkpoint.uploaded_count));
        info!(
            delivered = report.succeeded,
            total = report.total_units,
            success_rate = format!("{:.1}%", report.success_rate),
            batches_failed = report.batches_failed,
            "Batch delivery complete"
        );

        Ok(report)
    }

    /// Deliver `batches` in order, flushing the checkpoint after each one.
    async fn deliver_batches(
        &self,
        units: &[PreparedRecord],
        checkpoint: &mut BatchCheckpoint,
        checkpoint_path: &Path,
        batches: Range<usize>,
        pb: &ProgressBar,
        counters: &mut RunCounters,
    ) -> Result<()> {
        let total = units.len();
        let last_batch = batches.end;

        for batch_index in batches {
            let from = batch_index * self.batch_size;
            let to = (from + self.batch_size).min(total);
            let batch = &units[from..to];

            checkpoint.current_batch_index = batch_index;

            let outcome = self
                .deliver_with_retry(batch, batch_index, &mut counters.retries)
                .await?;

            if outcome.succeeded > 0 {
                info!(
                    batch = batch_index,
                    delivered = outcome.succeeded,
                    size = batch.len(),
                    "Batch completed"
                );
                checkpoint.record_success(batch_index, outcome);
            } else {
                error!(batch = batch_index, error = %outcome.first_error(), "Batch failed completely");
                checkpoint.record_failure(batch_index, batch.len(), outcome.first_error());
            }

            checkpoint.last_updated = Utc::now();
            save_checkpoint(&*checkpoint, checkpoint_path)?;

            pb.inc(1);
            pb.set_message(format!("delivered: {}", checkpoint.uploaded_count));

            if batch_index + 1 < last_batch {
                debug!(delay_ms = self.rate_limit_delay.as_millis() as u64, "Rate limit delay");
                tokio::time::sleep(self.rate_limit_delay).await;
                counters.pacing_sleeps += 1;
            }
        }
        Ok(())
    }

    fn initial_checkpoint(
        &self,
        checkpoint_path: &Path,
        resume: bool,
        total: usize,
    ) -> Result<BatchCheckpoint> {
        if !resume {
            return Ok(BatchCheckpoint::new(total, self.batch_size));
        }

        match load_checkpoint::<BatchCheckpoint>(checkpoint_path)? {
            Some(mut cp) => {
                if cp.batch_size == 0 {
                    warn!(
                        batch_size = self.batch_size,
                        "Checkpoint has no batch size, assuming the configured one"
                    );
                    cp.batch_size = self.batch_size;
                } else if cp.batch_size != self.batch_size {
                    return Err(MailsiftError::InvalidInput(format!(
                        "Checkpoint {} was written with batch size {}, configured batch size is {}. \
                         Resume with batch_size = {} or start a fresh run",
                        checkpoint_path.display(),
                        cp.batch_size,
                        self.batch_size,
                        cp.batch_size
                    )));
                }
                if cp.total_units != total {
                    warn!(
                        checkpoint_total = cp.total_units,
                        input_total = total,
                        "Input size differs from checkpoint"
                    );
                    cp.total_units = total;
                }
                Ok(cp)
            }
            None => {
                warn!("Resume requested but no checkpoint found, starting fresh");
                Ok(BatchCheckpoint::new(total, self.batch_size))
            }
        }
    }

    /// Deliver one batch, retrying while it delivers nothing.
    ///
    /// Returns the first outcome with any success, else the last one.
    async fn deliver_with_retry(
        &self,
        batch: &[PreparedRecord],
        batch_index: usize,
        retries: &mut usize,
    ) -> Result<BatchOutcome> {
        let max_attempts = self.retry.max_attempts;
        let mut last = BatchOutcome::failed_all(batch.len(), "No delivery attempt made");

        for attempt in 0..max_attempts {
            if attempt > 0 {
                let backoff = self.retry.backoff_for(attempt);
                info!(
                    batch = batch_index,
                    attempt = attempt + 1,
                    max_attempts,
                    backoff_ms = backoff.as_millis() as u64,
                    "Retrying batch"
                );
                tokio::time::sleep(backoff).await;
                *retries += 1;
            }

            debug!(batch = batch_index, size = batch.len(), "Delivering batch");
            let outcome = self.delivery.deliver(batch).await?;

            if outcome.succeeded > 0 {
                if attempt > 0 {
                    info!(batch = batch_index, attempt = attempt + 1, "Batch succeeded on retry");
                }
                return Ok(outcome);
            }

            if attempt + 1 < max_attempts {
                warn!(batch = batch_index, error = %outcome.first_error(), "Batch delivered nothing, will retry");
            } else {
                error!(batch = batch_index, attempts = max_attempts, "Batch failed after all attempts");
            }
            last = outcome;
        }

        Ok(last)
    }

    fn progress_bar(&self, total_batches: usize, start_batch: usize) -> ProgressBar {
        if !self.show_progress {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(total_batches as u64);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} batches ({percent}%) {msg}")
        {
            pb.set_style(style.progress_chars("##-"));
        }
        pb.set_position(start_batch as u64);
        pb
    }
}
