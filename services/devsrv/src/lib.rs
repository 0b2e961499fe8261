//! Device Service (devsrv)
//!
//! Modbus TCP access to rack breakers and temperature sensors, plus the
//! orchestrator that shuts a rack down in a safe order: servers first, then a
//! settle delay, then the breaker feeding them.

pub mod collaborators;
pub mod config;
pub mod devices;
pub mod error;
pub mod protocols;
pub mod retry;
pub mod shutdown;
pub mod testing;

pub use config::DevsrvConfig;
pub use error::{DevSrvError, ErrorExt, Result};
pub use shutdown::{
    SequenceStatus, ShutdownOrchestrator, ShutdownSequence, ShutdownSettings, StepKind,
};
