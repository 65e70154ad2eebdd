//! Core data models for mailsift.
//!
//! - Configuration (TOML-backed, defaults for every field)
//! - Error taxonomy (per-unit, per-batch, fatal)
//! - Record types crossing stage boundaries

mod config;
mod error;
mod record;

pub use config::*;
pub use error::*;
pub use record::*;
