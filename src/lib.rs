//! mailsift - resumable, checkpointed batch pipeline from an email corpus to a
//! remote system-of-record.
//!
//! ## Phases
//!
//! - **Extraction**: scan → per unit read/parse/enrich/validate/prepare → JSON record file
//! - **Delivery**: record file → fixed-size batches → retry/backoff → remote sink
//!
//! ## Resumability
//!
//! Both phases keep an atomically written JSON checkpoint. Extraction tracks
//! completed units by id; delivery tracks the last successful batch. A rerun
//! with `resume` skips completed work and appends to existing output.
//!
//! ## Execution model
//!
//! Strictly sequential. The only waits are the pause between batches and the
//! backoff before a retry.

pub mod checkpoint;
pub mod client;
pub mod delivery;
pub mod models;
pub mod pipeline;
pub mod report;
pub mod source;
pub mod stages;

// Re-exports for convenience
pub use checkpoint::{BatchCheckpoint, Checkpoint, ProgressTracker};
pub use client::HttpDelivery;
pub use delivery::{BatchDelivery, BatchExecutor, DeliveryReport, RetryPolicy};
pub use models::{
    BatchOutcome, Config, ExtractedRecord, MailsiftError, ParsedUnit, PreparedRecord, Result,
};
pub use pipeline::{
    DeliveryPipeline, ExtractionPipeline, ExtractionReport, ExtractionSettings, PhaseState,
};
pub use report::{PartialReport, Summary, save_report};
pub use source::{DocumentSource, MailboxSource};
pub use stages::{
    ArticleParser, Enricher, MatchedEntityValidator, PassThroughEnricher, RecordPreparer,
    SourcePreparer, Validator, WholeMessageParser,
};
