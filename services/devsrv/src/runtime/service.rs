//! Device service: one supervisor per configured device

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::supervisor::{DeviceSupervisor, SupervisorHandle, SupervisorState};
use crate::core::config::DeviceDescriptor;
use crate::core::transport::TransportFactory;
use crate::device::{CommandResult, DeviceCommand, DeviceEvent, DeviceRegistry};
use crate::error::{DevSrvError, Result};
use crate::status::StatusPipeline;

pub struct DeviceService {
    handles: BTreeMap<String, SupervisorHandle>,
    tasks: Vec<JoinHandle<()>>,
    shutdown: CancellationToken,
}

impl DeviceService {
    /// Spawn a supervisor for every device
    pub fn start(
        devices: Vec<DeviceDescriptor>,
        transports: TransportFactory,
        registry: DeviceRegistry,
        pipeline: Arc<StatusPipeline>,
        events: mpsc::Sender<DeviceEvent>,
        shutdown: &CancellationToken,
    ) -> Result<Self> {
        let shutdown = shutdown.child_token();
        let mut handles = BTreeMap::new();
        let mut tasks = Vec::with_capacity(devices.len());

        for descriptor in devices {
            if handles.contains_key(&descriptor.name) {
                return Err(DevSrvError::config(format!(
                    "Duplicate device name '{}'",
                    descriptor.name
                )));
            }
            if !registry.contains(&descriptor.driver) {
                return Err(DevSrvError::config(format!(
                    "[{}] unknown driver '{}'",
                    descriptor.name, descriptor.driver
                )));
            }

            let name = descriptor.name.clone();
            let supervisor = DeviceSupervisor::new(
                descriptor,
                transports.clone(),
                registry.clone(),
                Arc::clone(&pipeline),
                events.clone(),
            );
            let (handle, task) = supervisor.spawn(&shutdown);
            handles.insert(name, handle);
            tasks.push(task);
        }

        info!("Device service started with {} device(s)", handles.len());
        Ok(Self {
            handles,
            tasks,
            shutdown,
        })
    }

    /// Device names, sorted
    pub fn devices(&self) -> Vec<&str> {
        self.handles.keys().map(String::as_str).collect()
    }

    pub fn handle(&self, device: &str) -> Option<&SupervisorHandle> {
        self.handles.get(device)
    }

    pub async fn execute(&self, device: &str, command: DeviceCommand) -> Result<CommandResult> {
        let handle = self
            .handles
            .get(device)
            .ok_or_else(|| DevSrvError::device_not_found(device))?;
        handle.execute(command).await
    }

    pub fn request_reconnect(&self, device: &str) -> Result<bool> {
        self.handles
            .get(device)
            .map(SupervisorHandle::request_reconnect)
            .ok_or_else(|| DevSrvError::device_not_found(device))
    }

    pub fn states(&self) -> BTreeMap<String, SupervisorState> {
        self.handles
            .iter()
            .map(|(name, handle)| (name.clone(), handle.state()))
            .collect()
    }

    /// Stop every supervisor and wait for them to finish tearing down
    pub async fn stop(self, timeout: Duration) {
        info!("Stopping device service");
        self.shutdown.cancel();

        match tokio::time::timeout(timeout, join_all(self.tasks)).await {
            Ok(results) => {
                for result in results {
                    if let Err(e) = result {
                        warn!("Supervisor task ended abnormally: {}", e);
                    }
                }
                info!("Device service stopped");
            },
            Err(_) => warn!("Device service stop timed out after {:?}", timeout),
        }
    }
}

impl std::fmt::Debug for DeviceService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceService")
            .field("devices", &self.devices())
            .finish()
    }
}
