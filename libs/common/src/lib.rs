//! Shared infrastructure for the facility services
//!
//! - logging bootstrap
//! - signal-driven shutdown

pub mod logging;
pub mod shutdown;

// Re-export common dependencies
pub use tokio_util::sync::CancellationToken;
