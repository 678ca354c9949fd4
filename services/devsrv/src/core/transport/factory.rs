//! Transport Factory
//!
//! Maps a device descriptor to a fresh transport instance. Every connection
//! attempt asks the factory again, so no transport state survives a
//! reconnect.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::null::NullTransport;
use super::sdk::{SdkTransport, SessionProvider};
use super::serial::{SerialParams, SerialTransport};
use super::tcp::TcpTransport;
use super::traits::{Transport, TransportError};
use crate::core::config::DeviceDescriptor;

/// Supported transport types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportType {
    Serial,
    Tcp,
    /// Vendor SDK session
    Sdk,
    /// No-op stub
    #[default]
    #[serde(alias = "null")]
    None,
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportType::Serial => write!(f, "serial"),
            TransportType::Tcp => write!(f, "tcp"),
            TransportType::Sdk => write!(f, "sdk"),
            TransportType::None => write!(f, "none"),
        }
    }
}

impl std::str::FromStr for TransportType {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "serial" | "rs232" => Ok(TransportType::Serial),
            "tcp" => Ok(TransportType::Tcp),
            "sdk" => Ok(TransportType::Sdk),
            "none" | "null" => Ok(TransportType::None),
            _ => Err(TransportError::ConfigError(format!(
                "Unknown transport type: {s}"
            ))),
        }
    }
}

/// Replaces the built-in mapping wholesale (tests, simulations)
pub type CustomBuilder =
    Arc<dyn Fn(&DeviceDescriptor) -> Result<Arc<dyn Transport>, TransportError> + Send + Sync>;

/// Transport factory
#[derive(Clone, Default)]
pub struct TransportFactory {
    sessions: Arc<DashMap<String, SessionProvider>>,
    custom: Option<CustomBuilder>,
}

impl fmt::Debug for TransportFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportFactory")
            .field("sessions", &self.sessions.len())
            .field("custom", &self.custom.is_some())
            .finish()
    }
}

impl TransportFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Factory whose every transport comes from `builder`
    pub fn custom<F>(builder: F) -> Self
    where
        F: Fn(&DeviceDescriptor) -> Result<Arc<dyn Transport>, TransportError>
            + Send
            + Sync
            + 'static,
    {
        Self {
            sessions: Arc::new(DashMap::new()),
            custom: Some(Arc::new(builder)),
        }
    }

    /// Register a vendor session provider under the key used as the descriptor port
    pub fn register_session<F>(&self, key: impl Into<String>, provider: F)
    where
        F: Fn() -> Arc<dyn super::sdk::VendorSession> + Send + Sync + 'static,
    {
        let key = key.into();
        debug!("Registered SDK session provider: {}", key);
        self.sessions.insert(key, Arc::new(provider));
    }

    pub fn has_session(&self, key: &str) -> bool {
        self.sessions.contains_key(key)
    }

    /// Build a fresh, unopened transport for the descriptor
    pub fn create(&self, descriptor: &DeviceDescriptor) -> Result<Arc<dyn Transport>, TransportError> {
        if let Some(builder) = &self.custom {
            return builder(descriptor);
        }

        let transport: Arc<dyn Transport> = match descriptor.transport {
            TransportType::Serial => {
                let params: SerialParams = descriptor.parameters.parse()?;
                Arc::new(SerialTransport::new(&descriptor.port, params)?)
            },
            TransportType::Tcp => {
                let connect_timeout = TcpTransport::parse_timeout(&descriptor.parameters)?;
                Arc::new(TcpTransport::new(&descriptor.port, connect_timeout)?)
            },
            TransportType::Sdk => {
                let provider = self
                    .sessions
                    .get(&descriptor.port)
                    .map(|entry| Arc::clone(entry.value()))
                    .ok_or_else(|| {
                        TransportError::ConfigError(format!(
                            "No SDK session registered for '{}'",
                            descriptor.port
                        ))
                    })?;
                Arc::new(SdkTransport::new(
                    &descriptor.port,
                    &descriptor.parameters,
                    provider(),
                ))
            },
            TransportType::None => Arc::new(NullTransport::new()),
        };

        debug!(
            "[{}] Created {} transport for {}",
            descriptor.name,
            descriptor.transport,
            transport.name()
        );
        Ok(transport)
    }
}
