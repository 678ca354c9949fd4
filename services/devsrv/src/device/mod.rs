//! Device drivers
//!
//! A driver sits between the supervisor and one protocol client. The
//! supervisor owns the lifecycle: a driver instance lives for exactly one
//! connection attempt and is disposed before the next one starts.

pub mod dispenser;
pub mod null;
pub mod registry;
pub mod scanner;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::core::config::DeviceDescriptor;
use crate::core::transport::Transport;
use crate::error::Result;
use crate::status::{ErrorCategory, ErrorCode, StatusSnapshot};

pub use dispenser::DispenserDevice;
pub use null::NullDevice;
pub use registry::{DeviceRegistry, DriverFactory, NULL_DRIVER, SSI_SCANNER, STX_DISPENSER};
pub use scanner::ScannerDevice;

/// Command name asking the device to restart and the supervisor to reconnect
pub const RESTART: &str = "RESTART";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceCommand {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<serde_json::Value>,
}

impl DeviceCommand {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into().to_ascii_uppercase(),
            args: None,
        }
    }

    pub fn restart() -> Self {
        Self::new(RESTART)
    }

    pub fn with_args(mut self, args: serde_json::Value) -> Self {
        self.args = Some(args);
        self
    }

    pub fn is_restart(&self) -> bool {
        self.name.eq_ignore_ascii_case(RESTART)
    }

    /// Unsigned integer argument by key
    pub fn arg_u64(&self, key: &str) -> Option<u64> {
        self.args.as_ref()?.get(key)?.as_u64()
    }
}

impl fmt::Display for DeviceCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.args {
            Some(args) => write!(f, "{} {}", self.name, args),
            None => f.write_str(&self.name),
        }
    }
}

/// Outcome of every device operation; only cancellation escapes as an error
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    pub success: bool,
    pub message: String,
    #[serde(default)]
    pub data: Vec<u8>,
    #[serde(default)]
    pub error_code: Option<ErrorCode>,
    #[serde(default)]
    pub retryable: bool,
}

impl CommandResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: Vec::new(),
            error_code: None,
            retryable: false,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            ..Self::ok(message)
        }
    }

    /// Failed result for a command the driver does not know
    pub fn unknown_command(device_key: &str, command: &DeviceCommand) -> Self {
        Self::failure(format!("Unknown command: {}", command.name)).with_error_code(ErrorCode::device(
            device_key,
            ErrorCategory::Command,
            "UNKNOWN_COMMAND",
        ))
    }

    pub fn with_data(mut self, data: Vec<u8>) -> Self {
        self.data = data;
        self
    }

    pub fn with_error_code(mut self, code: ErrorCode) -> Self {
        self.error_code = Some(code);
        self
    }

    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    /// Data as text, lossy
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

/// Out-of-band event raised by a driver
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeviceEvent {
    Barcode {
        device: String,
        symbology: String,
        data: String,
    },
}

/// Everything a driver gets for one connection attempt
#[derive(Debug, Clone)]
pub struct DeviceContext {
    pub descriptor: DeviceDescriptor,
    /// Already open
    pub transport: Arc<dyn Transport>,
    pub events: mpsc::Sender<DeviceEvent>,
}

#[async_trait]
pub trait Device: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// Bring the device into service; error-severity alerts in the result
    /// count as a failed connection
    async fn initialize(&self) -> Result<StatusSnapshot>;

    /// One poll
    async fn status(&self) -> Result<StatusSnapshot>;

    async fn execute(&self, command: &DeviceCommand) -> Result<CommandResult>;

    /// Release protocol state; never fails
    async fn dispose(&self);
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_command_names_are_upper_case() {
        let command = DeviceCommand::new("dispense").with_args(serde_json::json!({"cassette": 1, "count": 5}));
        assert_eq!(command.name, "DISPENSE");
        assert_eq!(command.arg_u64("count"), Some(5));
        assert_eq!(command.arg_u64("missing"), None);
        assert!(DeviceCommand::new("restart").is_restart());
    }

    #[test]
    fn test_unknown_command_result() {
        let result = CommandResult::unknown_command("CASH_1", &DeviceCommand::new("FLY"));
        assert!(!result.success);
        assert!(!result.retryable);
        assert_eq!(
            result.error_code.map(|c| c.short()),
            Some("COMMAND.UNKNOWN_COMMAND".to_string())
        );
    }
}
