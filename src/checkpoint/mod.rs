//! Checkpoint module for resumable pipeline execution.
//!
//! Provides:
//! - `store`: atomic load/save of any checkpoint document
//! - `ProgressTracker`: unit-level progress for the extraction phase
//! - `BatchCheckpoint`: batch-level progress for the delivery phase

mod batch;
mod progress;
mod store;

pub use batch::*;
pub use progress::*;
pub use store::{load_checkpoint, save_checkpoint};
