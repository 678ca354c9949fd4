//! Service configuration
//!
//! Loaded with figment: built-in defaults, then the config file (format by
//! extension), then `DEVSRV_` environment variables (`__` separates nested
//! keys, e.g. `DEVSRV_SERVICE__LOG_LEVEL=debug`).

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Json, Serialized, Toml, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::core::transport::{SerialParams, TcpTransport, TransportType};
use crate::error::{DevSrvError, ErrorExt, Result};
use crate::protocols::dispenser::HandshakeConfig;
use crate::status::error_code::ErrorCategory;
use crate::status::policy::ErrorPolicy;

/// Configuration root
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DevsrvConfig {
    #[serde(default)]
    pub service: ServiceSection,

    #[serde(default)]
    pub devices: Vec<DeviceDescriptor>,

    #[serde(default)]
    pub status: StatusSection,
}

/// Service-level settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSection {
    #[serde(default = "default_service_name")]
    pub name: String,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Daily rolling log files go here; console only when unset
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

impl Default for ServiceSection {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            log_dir: None,
        }
    }
}

/// Immutable description of one peripheral
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub name: String,

    #[serde(default)]
    pub model: String,

    #[serde(default)]
    pub vendor: String,

    #[serde(default)]
    pub transport: TransportType,

    /// Serial device path, `host:port`, or SDK session key
    #[serde(default)]
    pub port: String,

    /// Transport parameters, e.g. `"9600,8,1,N"` for serial
    #[serde(default)]
    pub parameters: String,

    #[serde(default = "default_polling_interval_ms")]
    pub polling_interval_ms: u64,

    /// Device registry key ("ssi-scanner", "stx-dispenser", "null")
    pub driver: String,

    /// Deadline for each device operation
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,

    /// ACK/ENQ/NAK bounds for handshaking drivers; driver defaults when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handshake: Option<HandshakeConfig>,
}

impl Default for DeviceDescriptor {
    fn default() -> Self {
        Self {
            name: String::new(),
            model: String::new(),
            vendor: String::new(),
            transport: TransportType::default(),
            port: String::new(),
            parameters: String::new(),
            polling_interval_ms: default_polling_interval_ms(),
            driver: String::new(),
            command_timeout_ms: default_command_timeout_ms(),
            handshake: None,
        }
    }
}

impl DeviceDescriptor {
    /// Key used inside error codes: upper-cased, non-alphanumerics as `_`
    pub fn device_key(&self) -> String {
        self.name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect()
    }

    pub fn polling_interval(&self) -> Duration {
        Duration::from_millis(self.polling_interval_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    /// Check transport parameters without opening anything
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(DevSrvError::config("Device name cannot be empty"));
        }
        if self.command_timeout_ms == 0 {
            return Err(DevSrvError::config(format!(
                "[{}] command_timeout_ms must be greater than zero",
                self.name
            )));
        }

        if self.handshake.is_some_and(|h| h.ack_timeout.is_zero()) {
            return Err(DevSrvError::config(format!(
                "[{}] handshake.ack_timeout_ms must be greater than zero",
                self.name
            )));
        }

        let context = |e: crate::core::transport::TransportError| {
            DevSrvError::config(format!("[{}] {e}", self.name))
        };
        match self.transport {
            TransportType::Serial => {
                if self.port.is_empty() {
                    return Err(DevSrvError::config(format!(
                        "[{}] serial transport requires a port",
                        self.name
                    )));
                }
                self.parameters.parse::<SerialParams>().map_err(context)?;
            },
            TransportType::Tcp => {
                TcpTransport::validate_address(&self.port).map_err(context)?;
                TcpTransport::parse_timeout(&self.parameters).map_err(context)?;
            },
            TransportType::Sdk => {
                if self.port.is_empty() {
                    return Err(DevSrvError::config(format!(
                        "[{}] sdk transport requires a session key as port",
                        self.name
                    )));
                }
            },
            TransportType::None => {},
        }
        Ok(())
    }
}

/// Status pipeline settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSection {
    /// Aggregation window of the batching notifier
    #[serde(default = "default_notifier_window_ms")]
    pub notifier_window_ms: u64,

    /// Capacity of each worker queue (notifier, persistence, outbound)
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// JSON-lines file receiving every changed snapshot
    #[serde(default)]
    pub persistence_file: Option<PathBuf>,

    /// Per-category overrides keyed by "CONNECT", "STATUS" or "COMMAND"
    #[serde(default)]
    pub policies: HashMap<String, ErrorPolicy>,

    /// Human messages keyed by full code or `CATEGORY.DETAIL`
    #[serde(default)]
    pub messages: HashMap<String, String>,
}

impl Default for StatusSection {
    fn default() -> Self {
        Self {
            notifier_window_ms: default_notifier_window_ms(),
            queue_capacity: default_queue_capacity(),
            persistence_file: None,
            policies: HashMap::new(),
            messages: HashMap::new(),
        }
    }
}

impl StatusSection {
    pub fn notifier_window(&self) -> Duration {
        Duration::from_millis(self.notifier_window_ms)
    }
}

fn default_service_name() -> String {
    "devsrv".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_polling_interval_ms() -> u64 {
    1000
}

fn default_command_timeout_ms() -> u64 {
    30_000
}

fn default_notifier_window_ms() -> u64 {
    2000
}

fn default_queue_capacity() -> usize {
    256
}

impl DevsrvConfig {
    /// Load from file and environment, then validate against the given driver keys
    pub fn load<P: AsRef<Path>>(path: P, drivers: &[&str]) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(DevSrvError::config(format!(
                "Config file not found: {}",
                path.display()
            )));
        }

        let extension = path
            .extension()
            .and_then(|s| s.to_str())
            .ok_or_else(|| DevSrvError::config("Invalid file extension"))?;

        let mut figment = Figment::from(Serialized::defaults(DevsrvConfig::default()));
        figment = match extension {
            "json" => figment.merge(Json::file(path)),
            "toml" => figment.merge(Toml::file(path)),
            "yaml" | "yml" => figment.merge(Yaml::file(path)),
            _ => {
                return Err(DevSrvError::config(format!(
                    "Unsupported config format: {extension}"
                )))
            },
        };
        figment = figment.merge(Env::prefixed("DEVSRV_").split("__"));

        let config: DevsrvConfig = figment.extract()?;
        config.validate(drivers)?;

        info!(
            "Loaded {} device(s) from {}",
            config.devices.len(),
            path.display()
        );
        Ok(config)
    }

    /// Validate device list and status section
    pub fn validate(&self, drivers: &[&str]) -> Result<()> {
        let mut names = HashSet::new();
        for device in &self.devices {
            device.validate()?;

            if !names.insert(device.name.as_str()) {
                return Err(DevSrvError::config(format!(
                    "Duplicate device name: {}",
                    device.name
                )));
            }

            if !drivers.contains(&device.driver.as_str()) {
                return Err(DevSrvError::config(format!(
                    "[{}] unknown driver '{}' (known: {})",
                    device.name,
                    device.driver,
                    drivers.join(", ")
                )));
            }
            debug!(
                "[{}] {} over {} ({})",
                device.name, device.driver, device.transport, device.port
            );
        }

        for key in self.status.policies.keys() {
            key.parse::<ErrorCategory>()
                .config_error("status.policies")?;
        }

        if self.status.queue_capacity == 0 {
            return Err(DevSrvError::config(
                "status.queue_capacity must be greater than zero",
            ));
        }
        Ok(())
    }
}
