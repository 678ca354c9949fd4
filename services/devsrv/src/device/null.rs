//! Device without hardware, for placeholders and dry runs

use async_trait::async_trait;
use tracing::debug;

use super::{CommandResult, Device, DeviceCommand, DeviceContext};
use crate::core::config::DeviceDescriptor;
use crate::error::Result;
use crate::status::{AlertScope, StatusSnapshot};

#[derive(Debug)]
pub struct NullDevice {
    descriptor: DeviceDescriptor,
}

impl NullDevice {
    pub fn new(context: DeviceContext) -> Self {
        Self {
            descriptor: context.descriptor,
        }
    }

    fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot::online(&self.descriptor.name, &self.descriptor.model, AlertScope::Status)
    }
}

#[async_trait]
impl Device for NullDevice {
    fn name(&self) -> &str {
        &self.descriptor.name
    }

    async fn initialize(&self) -> Result<StatusSnapshot> {
        Ok(self.snapshot())
    }

    async fn status(&self) -> Result<StatusSnapshot> {
        Ok(self.snapshot())
    }

    async fn execute(&self, command: &DeviceCommand) -> Result<CommandResult> {
        debug!("[{}] Null device accepted {}", self.descriptor.name, command);
        Ok(CommandResult::ok(format!("{} accepted", command.name)))
    }

    async fn dispose(&self) {}
}
