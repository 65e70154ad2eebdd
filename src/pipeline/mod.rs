//! Pipeline module - the two resumable phases.
//!
//! - `ExtractionPipeline`: documents → record file
//! - `DeliveryPipeline`: record file → remote system

mod deliver;
mod extract;
mod output;

pub use deliver::*;
pub use extract::*;
pub use output::*;
