//! Unified error handling for the facility power services
//!
//! Each service keeps its own domain error type and converts into
//! [`FacilityError`] at process boundaries (binaries, published events).

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// ErrorInfo - serializable error summary
// ============================================================================

/// Serializable error summary attached to events and CLI output
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Stable machine-readable code, e.g. `DEVSRV_TIMEOUT`
    pub code: String,
    /// Human readable message
    pub message: String,
    /// Whether retrying the operation can help
    pub retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorInfo {
    /// Create a new ErrorInfo with code and message
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            retryable: false,
            details: None,
        }
    }

    /// Mark the error as retryable
    pub fn retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    /// Add details
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

// ============================================================================
// FacilityError - Main error type
// ============================================================================

/// Main error type shared by all facility binaries
#[derive(Debug, Error)]
pub enum FacilityError {
    // ======================================
    // Configuration Errors
    // ======================================
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid configuration: {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    // ======================================
    // Protocol & Communication Errors
    // ======================================
    #[error("Protocol error: {protocol}: {message}")]
    Protocol { protocol: String, message: String },

    #[error("Device exception: code 0x{code:02X}")]
    DeviceException { code: u8 },

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    // ======================================
    // Device & Workflow Errors
    // ======================================
    #[error("Device interlock: {0}")]
    Interlock(String),

    #[error("Verification failed: {0}")]
    VerificationFailed(String),

    #[error("Sequence aborted: {0}")]
    SequenceAborted(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Remote command failed: {0}")]
    RemoteCommand(String),

    // ======================================
    // Validation & Resource Errors
    // ======================================
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Not found: {resource}")]
    NotFound { resource: String },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    // ======================================
    // Runtime Errors
    // ======================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias using FacilityError
pub type FacilityResult<T> = Result<T, FacilityError>;

impl FacilityError {
    /// Process exit code used by the binaries
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Configuration(_) | Self::InvalidConfig { .. } | Self::Validation(_) => 2,
            Self::ConnectionFailed(_) | Self::Timeout(_) => 3,
            Self::Protocol { .. } | Self::DeviceException { .. } => 4,
            Self::Interlock(_) | Self::VerificationFailed(_) => 5,
            Self::SequenceAborted(_) | Self::Cancelled(_) => 6,
            _ => 1,
        }
    }
}

impl From<serde_json::Error> for FacilityError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("JSON: {}", err))
    }
}

// Helper macros for creating errors
#[macro_export]
macro_rules! config_error {
    ($msg:expr) => {
        $crate::FacilityError::Configuration($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::FacilityError::Configuration(format!($fmt, $($arg)*))
    };
}

#[macro_export]
macro_rules! protocol_error {
    ($protocol:expr, $msg:expr) => {
        $crate::FacilityError::Protocol {
            protocol: $protocol.to_string(),
            message: $msg.to_string(),
        }
    };
}

// ============================================================================
// Error capability trait
// ============================================================================

/// Error category enum - used for classification and log levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCategory {
    Configuration,
    Connection,
    Protocol,
    Device,
    Timeout,
    Validation,
    NotFound,
    Conflict,
    Cancelled,
    Internal,
}

/// Unified interface implemented by every service error type
///
/// Services keep their domain-specific variants and expose codes and
/// categories through this trait.
pub trait FacilityErrorTrait: std::error::Error + Send + Sync + 'static {
    /// Get error code (for events, logs, CLI output)
    fn error_code(&self) -> &'static str;

    /// Get error category
    fn category(&self) -> ErrorCategory;

    /// Whether the error is retryable (default implementation is category-based)
    fn is_retryable(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Connection | ErrorCategory::Timeout | ErrorCategory::Device
        )
    }

    /// Get log level
    fn log_level(&self) -> tracing::Level {
        use tracing::Level;
        match self.category() {
            ErrorCategory::Internal | ErrorCategory::Configuration => Level::ERROR,
            ErrorCategory::Validation | ErrorCategory::NotFound | ErrorCategory::Cancelled => {
                Level::INFO
            },
            _ => Level::WARN,
        }
    }

    /// Build a serializable summary
    fn to_error_info(&self) -> ErrorInfo {
        ErrorInfo::new(self.error_code(), self.to_string()).retryable(self.is_retryable())
    }
}

impl FacilityErrorTrait for FacilityError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "CONFIGURATION_ERROR",
            Self::InvalidConfig { .. } => "INVALID_CONFIG",
            Self::Protocol { .. } => "PROTOCOL_ERROR",
            Self::DeviceException { .. } => "DEVICE_EXCEPTION",
            Self::ConnectionFailed(_) => "CONNECTION_FAILED",
            Self::Timeout(_) => "TIMEOUT",
            Self::Interlock(_) => "INTERLOCK",
            Self::VerificationFailed(_) => "VERIFICATION_FAILED",
            Self::SequenceAborted(_) => "SEQUENCE_ABORTED",
            Self::Cancelled(_) => "CANCELLED",
            Self::RemoteCommand(_) => "REMOTE_COMMAND_FAILED",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::InvalidState(_) => "INVALID_STATE",
            Self::Io(_) => "IO_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
            Self::Other(_) => "OTHER_ERROR",
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::Configuration(_) | Self::InvalidConfig { .. } => ErrorCategory::Configuration,
            Self::Protocol { .. } => ErrorCategory::Protocol,
            Self::DeviceException { .. }
            | Self::Interlock(_)
            | Self::VerificationFailed(_)
            | Self::RemoteCommand(_) => ErrorCategory::Device,
            Self::ConnectionFailed(_) => ErrorCategory::Connection,
            Self::Timeout(_) => ErrorCategory::Timeout,
            Self::SequenceAborted(_) | Self::Cancelled(_) => ErrorCategory::Cancelled,
            Self::Validation(_) => ErrorCategory::Validation,
            Self::NotFound { .. } => ErrorCategory::NotFound,
            Self::InvalidState(_) => ErrorCategory::Conflict,
            Self::Io(_) | Self::Internal(_) | Self::Other(_) => ErrorCategory::Internal,
        }
    }
}
