//! Error handling for the device service
//!
//! Transport and protocol failures, device-side refusals and workflow aborts
//! all surface as [`DevSrvError`]. Sensor data states (open circuit, out of
//! range) are not errors; see `devices::sensor`.

use errors::{ErrorCategory, FacilityError, FacilityErrorTrait};
use thiserror::Error;

/// Device service error type
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DevSrvError {
    /// Dial failure, reset or closed connection
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Short or malformed frame, id mismatch, unexpected function code
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// Device answered with the exception bit set
    #[error("Device exception: code 0x{code:02X}")]
    DeviceException { code: u8 },

    /// Decoded value outside policy
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Per-call deadline exceeded or poll loop exhausted
    #[error("Timeout error: {0}")]
    TimeoutError(String),

    /// Step failed after exhausting retries, or sequence cancelled
    #[error("Sequence aborted: {0}")]
    SequenceAbort(String),

    /// Operation refused because the breaker is locked
    #[error("Breaker locked: {0}")]
    BreakerLocked(String),

    /// Write acknowledged but read-back did not confirm the target state
    #[error("Verification failed: {0}")]
    VerificationFailed(String),

    /// Cooperative cancellation observed
    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Operation not valid in the current state
    #[error("State error: {0}")]
    StateError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Remote shell command failed or exited non-zero
    #[error("Remote command error: {0}")]
    RemoteCommand(String),

    #[error("IO error: {0}")]
    IoError(String),
}

/// Result type alias for the device service
pub type Result<T> = std::result::Result<T, DevSrvError>;

impl DevSrvError {
    pub fn connection(msg: impl Into<String>) -> Self {
        DevSrvError::ConnectionError(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        DevSrvError::ProtocolError(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        DevSrvError::ValidationError(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        DevSrvError::TimeoutError(msg.into())
    }

    pub fn sequence_abort(msg: impl Into<String>) -> Self {
        DevSrvError::SequenceAbort(msg.into())
    }

    pub fn locked(msg: impl Into<String>) -> Self {
        DevSrvError::BreakerLocked(msg.into())
    }

    pub fn verification(msg: impl Into<String>) -> Self {
        DevSrvError::VerificationFailed(msg.into())
    }

    pub fn cancelled(msg: impl Into<String>) -> Self {
        DevSrvError::Cancelled(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        DevSrvError::NotFound(msg.into())
    }

    pub fn state(msg: impl Into<String>) -> Self {
        DevSrvError::StateError(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        DevSrvError::ConfigError(msg.into())
    }

    pub fn remote_command(msg: impl Into<String>) -> Self {
        DevSrvError::RemoteCommand(msg.into())
    }

    pub fn not_connected() -> Self {
        DevSrvError::ConnectionError("Not connected".to_string())
    }

    /// True for cooperative cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, DevSrvError::Cancelled(_))
    }
}

// ============================================================================
// From implementations for external error types
// ============================================================================

impl From<std::io::Error> for DevSrvError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof => DevSrvError::ConnectionError(err.to_string()),
            ErrorKind::TimedOut => DevSrvError::TimeoutError(err.to_string()),
            _ => DevSrvError::IoError(err.to_string()),
        }
    }
}

impl From<figment::Error> for DevSrvError {
    fn from(err: figment::Error) -> Self {
        DevSrvError::ConfigError(err.to_string())
    }
}

impl From<serde_json::Error> for DevSrvError {
    fn from(err: serde_json::Error) -> Self {
        DevSrvError::ProtocolError(format!("JSON: {err}"))
    }
}

// ============================================================================
// Extension trait for adding context to errors
// ============================================================================

/// Extension trait for adding context to errors
pub trait ErrorExt<T> {
    fn connection_error(self, msg: &str) -> Result<T>;
    fn config_error(self, msg: &str) -> Result<T>;
}

impl<T, E> ErrorExt<T> for std::result::Result<T, E>
where
    E: std::fmt::Display,
{
    fn connection_error(self, msg: &str) -> Result<T> {
        self.map_err(|e| DevSrvError::ConnectionError(format!("{msg}: {e}")))
    }

    fn config_error(self, msg: &str) -> Result<T> {
        self.map_err(|e| DevSrvError::ConfigError(format!("{msg}: {e}")))
    }
}

// ============================================================================
// Conversion to FacilityError at process boundaries
// ============================================================================

impl From<DevSrvError> for FacilityError {
    fn from(err: DevSrvError) -> Self {
        match err {
            DevSrvError::ConnectionError(msg) => FacilityError::ConnectionFailed(msg),
            DevSrvError::ProtocolError(msg) => FacilityError::Protocol {
                protocol: "modbus".to_string(),
                message: msg,
            },
            DevSrvError::DeviceException { code } => FacilityError::DeviceException { code },
            DevSrvError::ValidationError(msg) => FacilityError::Validation(msg),
            DevSrvError::TimeoutError(msg) => FacilityError::Timeout(msg),
            DevSrvError::SequenceAbort(msg) => FacilityError::SequenceAborted(msg),
            DevSrvError::BreakerLocked(msg) => FacilityError::Interlock(msg),
            DevSrvError::VerificationFailed(msg) => FacilityError::VerificationFailed(msg),
            DevSrvError::Cancelled(msg) => FacilityError::Cancelled(msg),
            DevSrvError::NotFound(msg) => FacilityError::NotFound { resource: msg },
            DevSrvError::StateError(msg) => FacilityError::InvalidState(msg),
            DevSrvError::ConfigError(msg) => FacilityError::Configuration(msg),
            DevSrvError::RemoteCommand(msg) => FacilityError::RemoteCommand(msg),
            DevSrvError::IoError(msg) => FacilityError::Io(std::io::Error::other(msg)),
        }
    }
}

impl FacilityErrorTrait for DevSrvError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::ConnectionError(_) => "DEVSRV_CONNECTION_ERROR",
            Self::ProtocolError(_) => "DEVSRV_PROTOCOL_ERROR",
            Self::DeviceException { .. } => "DEVSRV_DEVICE_EXCEPTION",
            Self::ValidationError(_) => "DEVSRV_VALIDATION_ERROR",
            Self::TimeoutError(_) => "DEVSRV_TIMEOUT",
            Self::SequenceAbort(_) => "DEVSRV_SEQUENCE_ABORT",
            Self::BreakerLocked(_) => "DEVSRV_BREAKER_LOCKED",
            Self::VerificationFailed(_) => "DEVSRV_VERIFICATION_FAILED",
            Self::Cancelled(_) => "DEVSRV_CANCELLED",
            Self::NotFound(_) => "DEVSRV_NOT_FOUND",
            Self::StateError(_) => "DEVSRV_STATE_ERROR",
            Self::ConfigError(_) => "DEVSRV_CONFIG_ERROR",
            Self::RemoteCommand(_) => "DEVSRV_REMOTE_COMMAND",
            Self::IoError(_) => "DEVSRV_IO_ERROR",
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::ConnectionError(_) => ErrorCategory::Connection,
            Self::ProtocolError(_) => ErrorCategory::Protocol,
            Self::DeviceException { .. }
            | Self::BreakerLocked(_)
            | Self::VerificationFailed(_)
            | Self::RemoteCommand(_) => ErrorCategory::Device,
            Self::ValidationError(_) => ErrorCategory::Validation,
            Self::TimeoutError(_) => ErrorCategory::Timeout,
            Self::SequenceAbort(_) | Self::Cancelled(_) => ErrorCategory::Cancelled,
            Self::NotFound(_) => ErrorCategory::NotFound,
            Self::StateError(_) => ErrorCategory::Conflict,
            Self::ConfigError(_) => ErrorCategory::Configuration,
            Self::IoError(_) => ErrorCategory::Internal,
        }
    }
}
