//! Driver registry
//!
//! Maps a descriptor's driver key to a factory building a fresh device for
//! one connection attempt.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use super::{Device, DeviceContext, DispenserDevice, NullDevice, ScannerDevice};
use crate::error::{DevSrvError, Result};

pub const SSI_SCANNER: &str = "ssi-scanner";
pub const STX_DISPENSER: &str = "stx-dispenser";
pub const NULL_DRIVER: &str = "null";

pub type DriverFactory = Arc<dyn Fn(DeviceContext) -> Result<Arc<dyn Device>> + Send + Sync>;

#[derive(Clone, Default)]
pub struct DeviceRegistry {
    factories: HashMap<String, DriverFactory>,
}

impl DeviceRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the scanner, dispenser and null drivers
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.insert(SSI_SCANNER, |ctx| Ok(Arc::new(ScannerDevice::new(ctx)) as Arc<dyn Device>));
        registry.insert(STX_DISPENSER, |ctx| Ok(Arc::new(DispenserDevice::new(ctx)) as Arc<dyn Device>));
        registry.insert(NULL_DRIVER, |ctx| Ok(Arc::new(NullDevice::new(ctx)) as Arc<dyn Device>));
        registry
    }

    fn insert<F>(&mut self, key: &str, factory: F)
    where
        F: Fn(DeviceContext) -> Result<Arc<dyn Device>> + Send + Sync + 'static,
    {
        self.factories.insert(key.to_string(), Arc::new(factory));
    }

    /// Add a driver; keys are unique
    pub fn register<F>(&mut self, key: impl Into<String>, factory: F) -> Result<()>
    where
        F: Fn(DeviceContext) -> Result<Arc<dyn Device>> + Send + Sync + 'static,
    {
        let key = key.into();
        if self.factories.contains_key(&key) {
            return Err(DevSrvError::config(format!(
                "Driver '{}' is already registered",
                key
            )));
        }
        debug!("Registering driver: {}", key);
        self.factories.insert(key, Arc::new(factory));
        Ok(())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.factories.contains_key(key)
    }

    /// Registered keys, sorted
    pub fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        keys.sort_unstable();
        keys
    }

    /// Build the device named by the context's driver key
    pub fn create(&self, context: DeviceContext) -> Result<Arc<dyn Device>> {
        let factory = self.factories.get(&context.descriptor.driver).ok_or_else(|| {
            DevSrvError::config(format!(
                "[{}] unknown driver '{}'",
                context.descriptor.name, context.descriptor.driver
            ))
        })?;
        factory(context)
    }
}

impl std::fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("drivers", &self.keys())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::core::config::DeviceDescriptor;
    use crate::core::transport::NullTransport;
    use tokio::sync::mpsc;

    fn context(driver: &str) -> DeviceContext {
        let (events, _rx) = mpsc::channel(1);
        DeviceContext {
            descriptor: DeviceDescriptor {
                name: "kiosk-light".to_string(),
                driver: driver.to_string(),
                ..DeviceDescriptor::default()
            },
            transport: Arc::new(NullTransport::new()),
            events,
        }
    }

    #[test]
    fn test_builtin_keys() {
        let registry = DeviceRegistry::with_builtin();
        assert_eq!(registry.keys(), vec![NULL_DRIVER, SSI_SCANNER, STX_DISPENSER]);
    }

    #[tokio::test]
    async fn test_create_and_duplicate() {
        let mut registry = DeviceRegistry::with_builtin();
        let device = registry.create(context(NULL_DRIVER)).unwrap();
        assert_eq!(device.name(), "kiosk-light");

        assert!(registry.create(context("printer")).is_err());
        assert!(registry
            .register(NULL_DRIVER, |ctx| Ok(Arc::new(NullDevice::new(ctx)) as Arc<dyn Device>))
            .is_err());
        registry
            .register("printer", |ctx| Ok(Arc::new(NullDevice::new(ctx)) as Arc<dyn Device>))
            .unwrap();
        assert!(registry.contains("printer"));
    }
}
