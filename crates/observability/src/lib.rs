//! Tracing and logging setup shared by afterhours binaries.

/// Tracing configuration (filters, formats).
pub mod tracing;

pub use tracing::{init, LogFormat};
