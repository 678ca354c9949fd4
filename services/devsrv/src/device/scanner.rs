//! SSI barcode scanner driver

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{CommandResult, Device, DeviceCommand, DeviceContext, DeviceEvent};
use crate::core::channel::{Channel, StopReason};
use crate::core::config::DeviceDescriptor;
use crate::core::framing::LengthChecksumFramer;
use crate::error::Result;
use crate::protocols::ssi::{DecodeEvent, SsiClient};
use crate::status::{AlertScope, ErrorCategory, ErrorCode, Severity, StatusEvent, StatusSnapshot};

const DECODE_QUEUE: usize = 32;
const DISPOSE_TIMEOUT: Duration = Duration::from_millis(500);
const DEFAULT_BEEP: u8 = 0x01;

pub struct ScannerDevice {
    descriptor: DeviceDescriptor,
    device_key: String,
    client: SsiClient,
    forwarder: Mutex<Option<JoinHandle<()>>>,
}

impl ScannerDevice {
    pub fn new(context: DeviceContext) -> Self {
        let DeviceContext {
            descriptor,
            transport,
            events,
        } = context;
        let device_key = descriptor.device_key();

        let channel = Arc::new(Channel::new(
            descriptor.name.clone(),
            transport,
            Arc::new(LengthChecksumFramer::new()),
        ));
        let (decode_tx, decode_rx) = mpsc::channel(DECODE_QUEUE);
        let client = SsiClient::new(descriptor.name.clone(), device_key.clone(), channel, decode_tx);
        let forwarder = tokio::spawn(forward_decodes(descriptor.name.clone(), decode_rx, events));

        Self {
            descriptor,
            device_key,
            client,
            forwarder: Mutex::new(Some(forwarder)),
        }
    }

    fn timeout(&self) -> Duration {
        self.descriptor.command_timeout()
    }

    fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot::online(&self.descriptor.name, &self.descriptor.model, AlertScope::Status)
    }

    fn rejected(&self, detail: &str, result: &CommandResult) -> StatusSnapshot {
        self.snapshot().with_alert(StatusEvent::new(
            ErrorCode::device(&self.device_key, ErrorCategory::Status, detail),
            Severity::Error,
            result.message.clone(),
            AlertScope::Status,
        ))
    }
}

async fn forward_decodes(
    device: String,
    mut decodes: mpsc::Receiver<DecodeEvent>,
    events: mpsc::Sender<DeviceEvent>,
) {
    while let Some(decode) = decodes.recv().await {
        let event = DeviceEvent::Barcode {
            device: device.clone(),
            symbology: decode.symbology_name(),
            data: decode.text(),
        };
        if events.try_send(event).is_err() {
            warn!("[{}] Event queue full, barcode dropped", device);
        }
    }
}

#[async_trait]
impl Device for ScannerDevice {
    fn name(&self) -> &str {
        &self.descriptor.name
    }

    async fn initialize(&self) -> Result<StatusSnapshot> {
        let revision = self.client.request_revision(self.timeout()).await?;
        if !revision.success {
            return Ok(self.rejected("REVISION_REJECTED", &revision));
        }
        info!("[{}] Scanner revision {}", self.descriptor.name, revision.text());

        let enable = self.client.scan_enable(self.timeout()).await?;
        if !enable.success {
            return Ok(self.rejected("SCAN_ENABLE_REJECTED", &enable));
        }
        Ok(self.snapshot())
    }

    /// Heartbeat: the decoder has no status query, so ask for its revision
    async fn status(&self) -> Result<StatusSnapshot> {
        let revision = self.client.request_revision(self.timeout()).await?;
        if revision.success {
            Ok(self.snapshot())
        } else {
            Ok(self.rejected("HEARTBEAT_REJECTED", &revision))
        }
    }

    async fn execute(&self, command: &DeviceCommand) -> Result<CommandResult> {
        let timeout = self.timeout();
        match command.name.as_str() {
            "REVISION" => self.client.request_revision(timeout).await,
            "SCAN_ENABLE" => self.client.scan_enable(timeout).await,
            "SCAN_DISABLE" => self.client.scan_disable(timeout).await,
            "START_SESSION" => self.client.start_session(timeout).await,
            "STOP_SESSION" => self.client.stop_session(timeout).await,
            "BEEP" => {
                let code = command
                    .arg_u64("code")
                    .and_then(|c| u8::try_from(c).ok())
                    .unwrap_or(DEFAULT_BEEP);
                self.client.beep(code, timeout).await
            },
            // No hardware reset over SSI; the supervisor reconnects
            super::RESTART => Ok(CommandResult::ok("Restart requested")),
            _ => Ok(CommandResult::unknown_command(&self.device_key, command)),
        }
    }

    async fn dispose(&self) {
        if self.client.channel().is_running() {
            if let Err(e) = self.client.scan_disable(DISPOSE_TIMEOUT).await {
                debug!("[{}] Scan disable on dispose failed: {}", self.descriptor.name, e);
            }
        }
        if let Some(forwarder) = self.forwarder.lock().take() {
            forwarder.abort();
        }
        self.client.channel().stop(StopReason::Cancelled);
    }
}

impl Drop for ScannerDevice {
    fn drop(&mut self) {
        if let Some(forwarder) = self.forwarder.lock().take() {
            forwarder.abort();
        }
    }
}

impl std::fmt::Debug for ScannerDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScannerDevice")
            .field("name", &self.descriptor.name)
            .field("client", &self.client)
            .finish()
    }
}
