//! Error types for mailsift.
//!
//! Failure taxonomy:
//! - Per-unit: a single document fails to read, parse, or enrich. Never escapes
//!   the extraction loop; the unit is marked failed and the run continues.
//! - Per-batch: a delivery batch reports zero successes. Retried by the
//!   executor, then recorded as a failed batch.
//! - Fatal: checkpoint or output I/O, corrupt checkpoint, unrecoverable
//!   collaborator errors. These abort the run; the last flushed checkpoint
//!   stays valid for a later resume. A fatal error raised mid-run comes back
//!   as `Aborted`, carrying the summary of the work done up to that point.

use crate::report::PartialReport;
use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for mailsift.
#[derive(Debug, Error)]
pub enum MailsiftError {
    // ═══════════════════════════════════════════════════════════════════
    // Input & data errors
    // ═══════════════════════════════════════════════════════════════════
    #[error("Configuration error: {0}")]
    Config(#[from] super::ConfigError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Corrupt checkpoint at {path}: {source}")]
    CorruptCheckpoint {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    // ═══════════════════════════════════════════════════════════════════
    // Infrastructure errors
    // ═══════════════════════════════════════════════════════════════════
    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Delivery error: {0}")]
    Delivery(String),

    #[error("Run aborted: {source}")]
    Aborted {
        partial: Box<PartialReport>,
        #[source]
        source: Box<MailsiftError>,
    },

    // ═══════════════════════════════════════════════════════════════════
    // Invariant violations
    // ═══════════════════════════════════════════════════════════════════
    #[error("Internal error: {0}")]
    Internal(String),
}

impl MailsiftError {
    /// Create an IO error with context.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Wrap a fatal error with the summary of the run it stopped.
    pub fn aborted(source: MailsiftError, partial: PartialReport) -> Self {
        Self::Aborted {
            partial: Box::new(partial),
            source: Box::new(source),
        }
    }

    /// The error that stopped the run, looking through `Aborted`.
    pub fn root(&self) -> &MailsiftError {
        match self {
            Self::Aborted { source, .. } => source.root(),
            other => other,
        }
    }

    /// Summary of the work done before an aborted run stopped.
    pub fn partial_report(&self) -> Option<&PartialReport> {
        match self {
            Self::Aborted { partial, .. } => Some(partial.as_ref()),
            _ => None,
        }
    }

    /// Whether this error must abort the whole run when it escapes a
    /// collaborator, as opposed to failing a single unit.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Config(_)
                | Self::CorruptCheckpoint { .. }
                | Self::Io { .. }
                | Self::Authentication(_)
                | Self::Aborted { .. }
                | Self::Internal(_)
        )
    }
}

/// Result type alias for mailsift.
pub type Result<T> = std::result::Result<T, MailsiftError>;
