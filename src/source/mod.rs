//! Source module - where phase-1 units of work come from.

mod mailbox;

pub use mailbox::*;

use crate::models::{ParsedUnit, Result};

/// A corpus of documents addressed by string ids.
pub trait DocumentSource: Send + Sync {
    /// List every unit id in the corpus, in a stable order.
    fn scan(&self) -> Result<Vec<String>>;

    /// Decode one unit.
    fn read(&self, id: &str) -> Result<ParsedUnit>;
}
