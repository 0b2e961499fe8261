//! Ordered facility shutdown: servers first, then a settle delay, then the
//! breaker feeding them.

pub mod executor;
pub mod orchestrator;
pub mod sequence;

use std::time::Duration;

pub use executor::{DeviceStepExecutor, StepExecutor};
pub use orchestrator::ShutdownOrchestrator;
pub use sequence::{
    SequenceId, SequenceStatus, ShutdownSequence, ShutdownStep, StepKind, StepStatus,
};

/// Timing and retry limits applied to every new sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownSettings {
    /// Wait between the last server step and the breaker step
    pub delay: Duration,
    pub retry_backoff: Duration,
    /// Retries after the first attempt of a server or breaker step
    pub max_retries: u32,
}

impl Default for ShutdownSettings {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(30),
            retry_backoff: Duration::from_secs(5),
            max_retries: 3,
        }
    }
}
