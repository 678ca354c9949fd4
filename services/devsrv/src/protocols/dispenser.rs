//! STX/ETX cash dispenser protocol client
//!
//! Host and dispenser acknowledge every frame. A command is confirmed with a
//! bare ACK (ENQ asks the dispenser to repeat it, NAK asks the host to
//! resend). The response frame is then ACKed by the host, or NAKed when its
//! checksum fails so the dispenser sends it again.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::channel::Channel;
use crate::core::framing::stx_etx::{ACK, ENQ, NAK, STX};
use crate::device::CommandResult;
use crate::error::{DevSrvError, Result};
use crate::status::{ErrorCategory, ErrorCode};

const RESULT_OK: u8 = b'O';
const RESULT_ERROR: u8 = b'E';

/// Offsets inside a response frame: `STX LEN RESULT DATA.. ETX BCC`
const RESPONSE_RESULT_OFFSET: usize = 2;
const RESPONSE_TRAILER_LEN: usize = 2;

/// Handshake retry bounds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandshakeConfig {
    #[serde(rename = "ack_timeout_ms", with = "millis")]
    pub ack_timeout: Duration,
    /// ENQ (or NAK-triggered resend) attempts after the first write
    pub max_enq: u32,
    /// NAKs sent for corrupted responses before giving up
    pub max_nak: u32,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_millis(500),
            max_enq: 3,
            max_nak: 3,
        }
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispenserCommand {
    Reset,
    Sensor,
    Dispense { cassette: u8, count: u16 },
    Purge,
    Version,
}

impl DispenserCommand {
    pub fn code(&self) -> u8 {
        match self {
            DispenserCommand::Reset => b'R',
            DispenserCommand::Sensor => b'S',
            DispenserCommand::Dispense { .. } => b'D',
            DispenserCommand::Purge => b'P',
            DispenserCommand::Version => b'V',
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DispenserCommand::Reset => "RESET",
            DispenserCommand::Sensor => "SENSOR",
            DispenserCommand::Dispense { .. } => "DISPENSE",
            DispenserCommand::Purge => "PURGE",
            DispenserCommand::Version => "VERSION",
        }
    }

    /// `CMD DATA..`
    pub fn to_payload(&self) -> Vec<u8> {
        let mut payload = vec![self.code()];
        if let DispenserCommand::Dispense { cassette, count } = self {
            payload.push(*cassette);
            payload.extend_from_slice(&count.to_le_bytes());
        }
        payload
    }
}

/// Sensor byte 0
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SensorFlags {
    pub cassette1_missing: bool,
    pub cassette1_near_empty: bool,
    pub cassette2_missing: bool,
    pub cassette2_near_empty: bool,
    pub reject_bin_full: bool,
    pub note_jam: bool,
    pub shutter_open: bool,
}

impl SensorFlags {
    pub fn from_byte(byte: u8) -> Self {
        let bit = |n: u8| byte & (1 << n) != 0;
        Self {
            cassette1_missing: bit(0),
            cassette1_near_empty: bit(1),
            cassette2_missing: bit(2),
            cassette2_near_empty: bit(3),
            reject_bin_full: bit(4),
            note_jam: bit(5),
            shutter_open: bit(6),
        }
    }

    /// Alert details of every raised flag, in bit order
    pub fn details(&self) -> Vec<&'static str> {
        [
            (self.cassette1_missing, "CASSETTE1_MISSING"),
            (self.cassette1_near_empty, "CASSETTE1_NEAR_EMPTY"),
            (self.cassette2_missing, "CASSETTE2_MISSING"),
            (self.cassette2_near_empty, "CASSETTE2_NEAR_EMPTY"),
            (self.reject_bin_full, "REJECT_BIN_FULL"),
            (self.note_jam, "NOTE_JAM"),
            (self.shutter_open, "SHUTTER_OPEN"),
        ]
        .into_iter()
        .filter_map(|(raised, detail)| raised.then_some(detail))
        .collect()
    }
}

fn is_handshake(frame: &[u8]) -> bool {
    frame.len() == 1 && (frame[0] == ACK || frame[0] == NAK)
}

fn is_response(frame: &[u8]) -> bool {
    frame.first() == Some(&STX)
}

/// Dispenser protocol client over an STX/ETX channel
pub struct DispenserClient {
    name: String,
    device_key: String,
    channel: Arc<Channel>,
    handshake: HandshakeConfig,
}

impl DispenserClient {
    pub fn new(
        name: impl Into<String>,
        device_key: impl Into<String>,
        channel: Arc<Channel>,
        handshake: HandshakeConfig,
    ) -> Self {
        channel.start();
        Self {
            name: name.into(),
            device_key: device_key.into(),
            channel,
            handshake,
        }
    }

    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    /// Run one command through the full ACK/ENQ/NAK handshake
    pub async fn send_command(&self, command: DispenserCommand, process_timeout: Duration) -> Result<CommandResult> {
        let payload = command.to_payload();
        // Registered before the first write so a fast response is never lost
        let response = self.channel.register(is_response, true);

        self.await_ack(command, &payload).await?;
        let frame = self.await_response(command, response, process_timeout).await?;

        self.channel.write_raw(&[ACK]).await?;
        Ok(self.decode(command, &frame))
    }

    async fn await_ack(&self, command: DispenserCommand, payload: &[u8]) -> Result<()> {
        let mut retries = 0u32;
        let mut ack = self.channel.register(is_handshake, false);
        self.channel.write(payload).await?;

        loop {
            match ack.wait(self.handshake.ack_timeout).await {
                Ok(byte) if byte == [ACK] => return Ok(()),
                Ok(_) => {
                    retries += 1;
                    if retries > self.handshake.max_enq {
                        break;
                    }
                    debug!("[{}] {} NAKed, resending ({})", self.name, command.name(), retries);
                    ack = self.channel.register(is_handshake, false);
                    self.channel.write(payload).await?;
                },
                Err(e) if e.is_timeout() => {
                    retries += 1;
                    if retries > self.handshake.max_enq {
                        break;
                    }
                    debug!("[{}] No ACK for {}, sending ENQ ({})", self.name, command.name(), retries);
                    ack = self.channel.register(is_handshake, false);
                    self.channel.write_raw(&[ENQ]).await?;
                },
                Err(e) => return Err(e),
            }
        }

        warn!(
            "[{}] {} not acknowledged after {} retries",
            self.name,
            command.name(),
            self.handshake.max_enq
        );
        Err(DevSrvError::handshake_timeout(format!(
            "{}: {} not acknowledged",
            self.name,
            command.name()
        )))
    }

    async fn await_response(
        &self,
        command: DispenserCommand,
        mut response: crate::core::channel::PendingResponse,
        process_timeout: Duration,
    ) -> Result<Vec<u8>> {
        let mut naks = 0u32;
        loop {
            match response.wait(process_timeout).await {
                Ok(frame) => return Ok(frame),
                Err(DevSrvError::ChecksumError(_)) => {
                    naks += 1;
                    if naks > self.handshake.max_nak {
                        return Err(DevSrvError::protocol(format!(
                            "{}: {} response corrupted {} times",
                            self.name,
                            command.name(),
                            naks
                        )));
                    }
                    debug!("[{}] Corrupted {} response, sending NAK", self.name, command.name());
                    response = self.channel.register(is_response, true);
                    self.channel.write_raw(&[NAK]).await?;
                },
                Err(e) => return Err(e),
            }
        }
    }

    fn decode(&self, command: DispenserCommand, frame: &[u8]) -> CommandResult {
        let Some(&marker) = frame.get(RESPONSE_RESULT_OFFSET) else {
            return CommandResult::failure(format!("{}: empty response", command.name()));
        };
        let data_end = frame.len().saturating_sub(RESPONSE_TRAILER_LEN);
        let data = frame
            .get(RESPONSE_RESULT_OFFSET + 1..data_end)
            .unwrap_or_default()
            .to_vec();

        match marker {
            RESULT_OK => CommandResult::ok(format!("{} completed", command.name())).with_data(data),
            RESULT_ERROR => {
                let number = data.first().copied().unwrap_or(0);
                warn!("[{}] {} failed with error {}", self.name, command.name(), number);
                CommandResult::failure(format!("{} failed: dispenser error {}", command.name(), number))
                    .with_error_code(ErrorCode::device(
                        &self.device_key,
                        ErrorCategory::Command,
                        format!("{}_E{:02}", command.name(), number),
                    ))
                    .with_data(data)
            },
            other => CommandResult::failure(format!(
                "{}: unexpected result marker 0x{:02X}",
                command.name(),
                other
            ))
            .with_data(data),
        }
    }

    pub async fn reset(&self, timeout: Duration) -> Result<CommandResult> {
        self.send_command(DispenserCommand::Reset, timeout).await
    }

    pub async fn sensor(&self, timeout: Duration) -> Result<CommandResult> {
        self.send_command(DispenserCommand::Sensor, timeout).await
    }

    pub async fn dispense(&self, cassette: u8, count: u16, timeout: Duration) -> Result<CommandResult> {
        self.send_command(DispenserCommand::Dispense { cassette, count }, timeout)
            .await
    }

    pub async fn purge(&self, timeout: Duration) -> Result<CommandResult> {
        self.send_command(DispenserCommand::Purge, timeout).await
    }

    pub async fn version(&self, timeout: Duration) -> Result<CommandResult> {
        self.send_command(DispenserCommand::Version, timeout).await
    }
}

impl std::fmt::Debug for DispenserClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispenserClient")
            .field("name", &self.name)
            .field("handshake", &self.handshake)
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::core::framing::{Framer, StxEtxFramer};
    use crate::core::transport::{MockTransport, Transport};
    use std::sync::atomic::{AtomicUsize, Ordering};

    const SENSOR_OK: [u8; 5] = [0x02, 0x04, 0x4F, 0x03, 0x48];

    fn fast() -> HandshakeConfig {
        HandshakeConfig {
            ack_timeout: Duration::from_millis(50),
            ..HandshakeConfig::default()
        }
    }

    async fn client(transport: Arc<MockTransport>, handshake: HandshakeConfig) -> DispenserClient {
        transport.open().await.unwrap();
        let channel = Arc::new(Channel::new(
            "cash-1",
            transport,
            Arc::new(StxEtxFramer::dispenser()),
        ));
        DispenserClient::new("cash-1", "CASH_1", channel, handshake)
    }

    fn command_frame(command: DispenserCommand) -> Vec<u8> {
        StxEtxFramer::dispenser().make_frame(&command.to_payload()).unwrap()
    }

    #[tokio::test]
    async fn test_sensor_ok_writes_exactly_one_ack() {
        let transport = Arc::new(MockTransport::new("cash-1").with_responder(|written| {
            if written.first() == Some(&STX) {
                vec![vec![ACK], SENSOR_OK.to_vec()]
            } else {
                Vec::new()
            }
        }));
        let client = client(transport.clone(), fast()).await;

        let result = client.sensor(Duration::from_secs(1)).await.unwrap();
        assert!(result.success);
        assert!(result.data.is_empty());

        let written = transport.written();
        assert_eq!(written, vec![command_frame(DispenserCommand::Sensor), vec![ACK]]);
        assert_eq!(written.iter().filter(|w| w.as_slice() == [ACK]).count(), 1);
    }

    #[tokio::test]
    async fn test_enq_after_missing_ack() {
        let transport = Arc::new(MockTransport::new("cash-1").with_responder(|written| {
            // Only answers after being poked with ENQ
            if written == [ENQ] {
                vec![vec![ACK], SENSOR_OK.to_vec()]
            } else {
                Vec::new()
            }
        }));
        let client = client(transport.clone(), fast()).await;

        let result = client.sensor(Duration::from_secs(1)).await.unwrap();
        assert!(result.success);
        assert_eq!(
            transport.written(),
            vec![command_frame(DispenserCommand::Sensor), vec![ENQ], vec![ACK]]
        );
    }

    #[tokio::test]
    async fn test_handshake_timeout_after_bounded_enq() {
        let transport = Arc::new(MockTransport::new("cash-1"));
        let client = client(transport.clone(), fast()).await;

        let err = client.reset(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, DevSrvError::HandshakeTimeout(_)));
        let enqs = transport.written().iter().filter(|w| w.as_slice() == [ENQ]).count();
        assert_eq!(enqs, 3);
        assert_eq!(client.channel().pending_count(), 0);
    }

    #[tokio::test]
    async fn test_nak_on_command_resends_frame() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let transport = Arc::new(MockTransport::new("cash-1").with_responder(move |written| {
            if written.first() != Some(&STX) {
                return Vec::new();
            }
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                vec![vec![NAK]]
            } else {
                vec![vec![ACK], SENSOR_OK.to_vec()]
            }
        }));
        let client = client(transport.clone(), fast()).await;

        assert!(client.sensor(Duration::from_secs(1)).await.unwrap().success);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_corrupted_response_is_naked_then_accepted() {
        let mut corrupted = SENSOR_OK.to_vec();
        corrupted[4] ^= 0xFF;
        let transport = Arc::new(MockTransport::new("cash-1").with_responder(move |written| {
            match written {
                [STX, ..] => vec![vec![ACK], corrupted.clone()],
                [NAK] => vec![SENSOR_OK.to_vec()],
                _ => Vec::new(),
            }
        }));
        let client = client(transport.clone(), fast()).await;

        assert!(client.sensor(Duration::from_secs(1)).await.unwrap().success);
        assert_eq!(
            transport.written(),
            vec![command_frame(DispenserCommand::Sensor), vec![NAK], vec![ACK]]
        );
    }

    #[tokio::test]
    async fn test_nak_budget_exhausted_is_protocol_error() {
        let mut corrupted = SENSOR_OK.to_vec();
        corrupted[4] ^= 0xFF;
        let transport = Arc::new(MockTransport::new("cash-1").with_responder(move |written| {
            match written {
                [STX, ..] => vec![vec![ACK], corrupted.clone()],
                [NAK] => vec![corrupted.clone()],
                _ => Vec::new(),
            }
        }));
        let client = client(transport.clone(), fast()).await;

        let err = client.sensor(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, DevSrvError::ProtocolError(_)));
        let naks = transport.written().iter().filter(|w| w.as_slice() == [NAK]).count();
        assert_eq!(naks, 3);
    }

    #[tokio::test]
    async fn test_error_marker_carries_error_code() {
        // STX LEN 'E' 0x07 ETX BCC
        let device = StxEtxFramer::dispenser_device();
        let response = device.make_frame(&[b'E', 0x07]).unwrap();
        let transport = Arc::new(MockTransport::new("cash-1").with_responder(move |written| {
            if written.first() == Some(&STX) {
                vec![vec![ACK], response.clone()]
            } else {
                Vec::new()
            }
        }));
        let client = client(transport, fast()).await;

        let result = client.dispense(1, 20, Duration::from_secs(1)).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.data, vec![0x07]);
        assert_eq!(
            result.error_code.map(|c| c.to_string()),
            Some("DEVICE.CASH_1.COMMAND.DISPENSE_E07".to_string())
        );
    }

    #[test]
    fn test_dispense_payload_and_sensor_flags() {
        let payload = DispenserCommand::Dispense { cassette: 2, count: 300 }.to_payload();
        assert_eq!(payload, vec![b'D', 2, 0x2C, 0x01]);

        let flags = SensorFlags::from_byte(0b0010_0010);
        assert!(flags.cassette1_near_empty);
        assert!(flags.note_jam);
        assert_eq!(flags.details(), vec!["CASSETTE1_NEAR_EMPTY", "NOTE_JAM"]);
    }
}
