//! Client module - remote delivery sinks.

mod http;

pub use http::*;
