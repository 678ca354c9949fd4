//! Error handling for the device service
//!
//! One error enum for the whole crate. Checksum failures inside the framers
//! never reach this type; they are resynchronized locally.

use thiserror::Error;

use crate::core::transport::TransportError;

/// Device Service Error Type
#[derive(Error, Debug, Clone)]
pub enum DevSrvError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Input/Output operation errors outside the transports
    #[error("IO error: {0}")]
    IoError(String),

    /// Physical medium failure (port lost, peer closed, write failed)
    #[error("Transport error: {0}")]
    TransportError(String),

    /// Malformed or unexpected protocol traffic
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// A structurally complete frame failed its integrity check
    #[error("Checksum error: {0}")]
    ChecksumError(String),

    /// ACK/ENQ handshake retries exhausted
    #[error("Handshake timeout: {0}")]
    HandshakeTimeout(String),

    /// No matching frame arrived before the deadline
    #[error("Frame timeout: {0}")]
    FrameTimeout(String),

    /// Operation-level deadline exceeded
    #[error("Timeout error: {0}")]
    TimeoutError(String),

    /// Operation cancelled (shutdown or channel stop)
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Connection establishment and maintenance errors
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Device driver errors (unknown device, bad command arguments)
    #[error("Device error: {0}")]
    DeviceError(String),
}

/// Result type alias for the device service
pub type Result<T> = std::result::Result<T, DevSrvError>;

impl DevSrvError {
    pub fn config(msg: impl Into<String>) -> Self {
        DevSrvError::ConfigError(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        DevSrvError::TransportError(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        DevSrvError::ProtocolError(msg.into())
    }

    pub fn checksum(msg: impl Into<String>) -> Self {
        DevSrvError::ChecksumError(msg.into())
    }

    pub fn handshake_timeout(msg: impl Into<String>) -> Self {
        DevSrvError::HandshakeTimeout(msg.into())
    }

    pub fn frame_timeout(msg: impl Into<String>) -> Self {
        DevSrvError::FrameTimeout(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        DevSrvError::TimeoutError(msg.into())
    }

    pub fn cancelled(msg: impl Into<String>) -> Self {
        DevSrvError::Cancelled(msg.into())
    }

    pub fn connection(msg: impl Into<String>) -> Self {
        DevSrvError::ConnectionError(msg.into())
    }

    pub fn device_not_found(name: impl std::fmt::Display) -> Self {
        DevSrvError::DeviceError(format!("Device not found: {}", name))
    }

    /// Timeouts of any layer; callers may mark the failed result retryable
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            DevSrvError::HandshakeTimeout(_)
                | DevSrvError::FrameTimeout(_)
                | DevSrvError::TimeoutError(_)
        )
    }

    /// Cancellation is never auto-retried
    pub fn is_cancelled(&self) -> bool {
        matches!(self, DevSrvError::Cancelled(_))
    }
}

// ============================================================================
// From implementations for external error types
// ============================================================================

impl From<std::io::Error> for DevSrvError {
    fn from(err: std::io::Error) -> Self {
        DevSrvError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for DevSrvError {
    fn from(err: serde_json::Error) -> Self {
        DevSrvError::DeviceError(format!("JSON: {err}"))
    }
}

impl From<figment::Error> for DevSrvError {
    fn from(err: figment::Error) -> Self {
        DevSrvError::ConfigError(format!("Failed to parse config: {err}"))
    }
}

impl From<TransportError> for DevSrvError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Timeout(msg) => DevSrvError::TimeoutError(msg),
            TransportError::ConfigError(msg) => DevSrvError::ConfigError(msg),
            other => DevSrvError::TransportError(other.to_string()),
        }
    }
}

// ============================================================================
// Extension trait for adding context to errors
// ============================================================================

/// Extension trait for adding context to errors
pub trait ErrorExt<T> {
    fn config_error(self, msg: &str) -> Result<T>;
    fn protocol_error(self, msg: &str) -> Result<T>;
}

impl<T, E> ErrorExt<T> for std::result::Result<T, E>
where
    E: std::fmt::Display,
{
    fn config_error(self, msg: &str) -> Result<T> {
        self.map_err(|e| DevSrvError::ConfigError(format!("{msg}: {e}")))
    }

    fn protocol_error(self, msg: &str) -> Result<T> {
        self.map_err(|e| DevSrvError::ProtocolError(format!("{msg}: {e}")))
    }
}
