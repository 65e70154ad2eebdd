//! Delivery module - rate-limited batch execution with retry and resume.

mod executor;

pub use executor::*;
