//! Phase 2: deliver a phase-1 record file in rate-limited batches.
//!
//! The whole input file is loaded into memory before the first batch.

use crate::delivery::{BatchExecutor, DeliveryReport};
use crate::models::{PreparedRecord, Result};
use crate::pipeline::load_records;
use std::path::Path;
use tracing::{Instrument, Span, info, info_span};

pub struct DeliveryPipeline {
    executor: BatchExecutor,
    span: Span,
}

impl DeliveryPipeline {
    pub fn new(executor: BatchExecutor) -> Self {
        Self {
            executor,
            span: info_span!("deliver"),
        }
    }

    /// Log under `span`; the executor logs under a child of it.
    pub fn with_span(mut self, span: Span) -> Self {
        self.executor = self
            .executor
            .with_span(info_span!(parent: &span, "batch_executor"));
        self.span = span;
        self
    }

    /// Load `input` and deliver it, checkpointing to `checkpoint`.
    pub async fn run(&self, input: &Path, checkpoint: &Path, resume: bool) -> Result<DeliveryReport> {
        self.run_inner(input, checkpoint, resume)
            .instrument(self.span.clone())
            .await
    }

    async fn run_inner(&self, input: &Path, checkpoint: &Path, resume: bool) -> Result<DeliveryReport> {
        info!(input = %input.display(), "Loading records");
        let records: Vec<PreparedRecord> = load_records(input)?;
        info!(count = records.len(), "Loaded records");

        self.executor.execute(&records, checkpoint, resume).await
    }
}
