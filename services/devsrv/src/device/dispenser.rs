//! STX/ETX cash dispenser driver

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use super::{CommandResult, Device, DeviceCommand, DeviceContext};
use crate::core::channel::{Channel, StopReason};
use crate::core::config::DeviceDescriptor;
use crate::core::framing::StxEtxFramer;
use crate::error::Result;
use crate::protocols::dispenser::{DispenserClient, HandshakeConfig, SensorFlags};
use crate::status::{AlertScope, ErrorCategory, ErrorCode, Severity, StatusEvent, StatusSnapshot};

pub struct DispenserDevice {
    descriptor: DeviceDescriptor,
    device_key: String,
    client: DispenserClient,
}

/// Severity of each sensor flag detail
fn flag_severity(detail: &str) -> Severity {
    match detail {
        "CASSETTE1_NEAR_EMPTY" | "CASSETTE2_NEAR_EMPTY" | "SHUTTER_OPEN" => Severity::Warning,
        _ => Severity::Error,
    }
}

fn flag_message(detail: &str) -> &'static str {
    match detail {
        "CASSETTE1_MISSING" => "Cassette 1 missing",
        "CASSETTE1_NEAR_EMPTY" => "Cassette 1 near empty",
        "CASSETTE2_MISSING" => "Cassette 2 missing",
        "CASSETTE2_NEAR_EMPTY" => "Cassette 2 near empty",
        "REJECT_BIN_FULL" => "Reject bin full",
        "NOTE_JAM" => "Note jam",
        "SHUTTER_OPEN" => "Shutter open",
        _ => "Sensor alert",
    }
}

impl DispenserDevice {
    /// Handshake bounds come from the descriptor, else the protocol defaults
    pub fn new(context: DeviceContext) -> Self {
        let handshake = context.descriptor.handshake.unwrap_or_default();
        Self::with_handshake(context, handshake)
    }

    pub fn with_handshake(context: DeviceContext, handshake: HandshakeConfig) -> Self {
        let descriptor = context.descriptor;
        let device_key = descriptor.device_key();
        let channel = Arc::new(Channel::new(
            descriptor.name.clone(),
            context.transport,
            Arc::new(StxEtxFramer::dispenser()),
        ));
        let client = DispenserClient::new(descriptor.name.clone(), device_key.clone(), channel, handshake);

        Self {
            descriptor,
            device_key,
            client,
        }
    }

    fn timeout(&self) -> Duration {
        self.descriptor.command_timeout()
    }

    fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot::online(&self.descriptor.name, &self.descriptor.model, AlertScope::Status)
    }

    fn alert(&self, detail: &str, severity: Severity, message: impl Into<String>) -> StatusEvent {
        StatusEvent::new(
            ErrorCode::device(&self.device_key, ErrorCategory::Status, detail),
            severity,
            message,
            AlertScope::Status,
        )
    }

    /// Sensor result to a status snapshot
    fn sensor_snapshot(&self, result: &CommandResult) -> StatusSnapshot {
        if !result.success {
            return self
                .snapshot()
                .with_alert(self.alert("SENSOR_FAILED", Severity::Error, result.message.clone()));
        }

        let flags = SensorFlags::from_byte(result.data.first().copied().unwrap_or(0));
        self.snapshot().with_alerts(
            flags
                .details()
                .into_iter()
                .map(|detail| self.alert(detail, flag_severity(detail), flag_message(detail))),
        )
    }

    fn dispense_args(&self, command: &DeviceCommand) -> Option<(u8, u16)> {
        let cassette = u8::try_from(command.arg_u64("cassette")?).ok()?;
        let count = u16::try_from(command.arg_u64("count")?).ok()?;
        (count > 0).then_some((cassette, count))
    }
}

#[async_trait]
impl Device for DispenserDevice {
    fn name(&self) -> &str {
        &self.descriptor.name
    }

    async fn initialize(&self) -> Result<StatusSnapshot> {
        let reset = self.client.reset(self.timeout()).await?;
        if !reset.success {
            return Ok(self
                .snapshot()
                .with_alert(self.alert("RESET_FAILED", Severity::Error, reset.message)));
        }

        let version = self.client.version(self.timeout()).await?;
        if version.success {
            info!("[{}] Dispenser firmware {}", self.descriptor.name, version.text());
        } else {
            warn!("[{}] Version query failed: {}", self.descriptor.name, version.message);
        }

        let sensor = self.client.sensor(self.timeout()).await?;
        Ok(self.sensor_snapshot(&sensor))
    }

    async fn status(&self) -> Result<StatusSnapshot> {
        let sensor = self.client.sensor(self.timeout()).await?;
        Ok(self.sensor_snapshot(&sensor))
    }

    async fn execute(&self, command: &DeviceCommand) -> Result<CommandResult> {
        let timeout = self.timeout();
        match command.name.as_str() {
            "RESET" | super::RESTART => self.client.reset(timeout).await,
            "SENSOR" => self.client.sensor(timeout).await,
            "PURGE" => self.client.purge(timeout).await,
            "VERSION" => self.client.version(timeout).await,
            "DISPENSE" => match self.dispense_args(command) {
                Some((cassette, count)) => {
                    info!(
                        "[{}] Dispensing {} note(s) from cassette {}",
                        self.descriptor.name, count, cassette
                    );
                    self.client.dispense(cassette, count, timeout).await
                },
                None => Ok(CommandResult::failure(
                    "DISPENSE requires {\"cassette\": u8, \"count\": u16 > 0}",
                )
                .with_error_code(ErrorCode::device(
                    &self.device_key,
                    ErrorCategory::Command,
                    "INVALID_ARGUMENTS",
                ))),
            },
            _ => Ok(CommandResult::unknown_command(&self.device_key, command)),
        }
    }

    async fn dispose(&self) {
        self.client.channel().stop(StopReason::Cancelled);
    }
}

impl std::fmt::Debug for DispenserDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispenserDevice")
            .field("name", &self.descriptor.name)
            .field("client", &self.client)
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::core::framing::stx_etx::{ACK, STX};
    use crate::core::framing::Framer;
    use crate::core::transport::{MockTransport, Transport};
    use crate::error::DevSrvError;
    use tokio::sync::mpsc;

    /// Simulated dispenser answering every command with `O` and a sensor byte
    fn simulator(sensor: u8) -> impl Fn(&[u8]) -> Vec<Vec<u8>> + Send + Sync + 'static {
        move |written: &[u8]| {
            if written.first() != Some(&STX) {
                return Vec::new();
            }
            let device = StxEtxFramer::dispenser_device();
            let response = match written.get(3) {
                Some(b'S') => device.make_frame(&[b'O', sensor]).unwrap(),
                Some(b'V') => device.make_frame(b"O1.02").unwrap(),
                _ => device.make_frame(b"O").unwrap(),
            };
            vec![vec![ACK], response]
        }
    }

    async fn dispenser(transport: Arc<MockTransport>) -> DispenserDevice {
        transport.open().await.unwrap();
        let (events, _rx) = mpsc::channel(1);
        let descriptor = DeviceDescriptor {
            name: "cash-1".to_string(),
            model: "CDM".to_string(),
            driver: "stx-dispenser".to_string(),
            command_timeout_ms: 500,
            ..DeviceDescriptor::default()
        };
        DispenserDevice::new(DeviceContext {
            descriptor,
            transport,
            events,
        })
    }

    #[tokio::test]
    async fn test_sensor_flags_become_alerts() {
        let transport = Arc::new(MockTransport::new("cash-1").with_responder(simulator(0b0010_0010)));
        let device = dispenser(transport).await;

        let snapshot = device.initialize().await.unwrap();
        let codes: Vec<(String, Severity)> = snapshot
            .alerts
            .iter()
            .map(|a| (a.code.clone(), a.severity))
            .collect();
        assert_eq!(
            codes,
            vec![
                ("DEVICE.CASH_1.STATUS.CASSETTE1_NEAR_EMPTY".to_string(), Severity::Warning),
                ("DEVICE.CASH_1.STATUS.NOTE_JAM".to_string(), Severity::Error),
            ]
        );
        assert!(snapshot.has_error_alerts());
    }

    #[tokio::test]
    async fn test_dispense_validates_arguments() {
        let transport = Arc::new(MockTransport::new("cash-1").with_responder(simulator(0)));
        let device = dispenser(transport.clone()).await;

        let bad = device
            .execute(&DeviceCommand::new("DISPENSE").with_args(serde_json::json!({"cassette": 1})))
            .await
            .unwrap();
        assert!(!bad.success);
        assert!(transport.written().is_empty());

        let good = device
            .execute(&DeviceCommand::new("dispense").with_args(serde_json::json!({"cassette": 1, "count": 3})))
            .await
            .unwrap();
        assert!(good.success);
        assert_eq!(transport.written()[0][3..7], [b'D', 1, 3, 0]);
    }

    #[tokio::test]
    async fn test_descriptor_handshake_bounds_apply() {
        // Dispenser never ACKs
        let transport = Arc::new(MockTransport::new("cash-1"));
        transport.open().await.unwrap();
        let (events, _rx) = mpsc::channel(1);
        let descriptor = DeviceDescriptor {
            name: "cash-1".to_string(),
            driver: "stx-dispenser".to_string(),
            command_timeout_ms: 500,
            handshake: Some(HandshakeConfig {
                ack_timeout: Duration::from_millis(30),
                max_enq: 0,
                max_nak: 0,
            }),
            ..DeviceDescriptor::default()
        };
        let device = DispenserDevice::new(DeviceContext {
            descriptor,
            transport: transport.clone(),
            events,
        });

        let err = device.execute(&DeviceCommand::new("SENSOR")).await.unwrap_err();
        assert!(matches!(err, DevSrvError::HandshakeTimeout(_)));
        // No ENQ follows the command frame
        assert_eq!(transport.written().len(), 1);
    }
}
