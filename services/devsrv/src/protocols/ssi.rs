//! SSI (Simple Serial Interface) scanner protocol client
//!
//! Every request is answered by CMD_ACK, CMD_NAK or a reply packet. Decode
//! packets arrive unsolicited and must be acknowledged by the host.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::core::channel::Channel;
use crate::device::CommandResult;
use crate::error::{DevSrvError, Result};
use crate::status::{ErrorCategory, ErrorCode};

pub const CMD_ACK: u8 = 0xD0;
pub const CMD_NAK: u8 = 0xD1;
pub const DECODE_DATA: u8 = 0xF3;
pub const REQUEST_REVISION: u8 = 0xA3;
pub const REPLY_REVISION: u8 = 0xA4;
pub const SCAN_ENABLE: u8 = 0xE9;
pub const SCAN_DISABLE: u8 = 0xEA;
pub const START_SESSION: u8 = 0xE4;
pub const STOP_SESSION: u8 = 0xE5;
pub const BEEP: u8 = 0xE6;

pub const SOURCE_HOST: u8 = 0x04;
pub const SOURCE_DECODER: u8 = 0x00;

/// Status bit 0: packet is a retransmission
pub const STATUS_RETRANSMIT: u8 = 0x01;

const EXTENDED_MARKER: u8 = 0xFF;
const SHORT_HEADER_LEN: usize = 4;
const EXTENDED_HEADER_LEN: usize = 6;
const CHECKSUM_LEN: usize = 2;

/// Decoded SSI packet without length and checksum
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SsiPacket {
    pub opcode: u8,
    pub source: u8,
    pub status: u8,
    pub data: Vec<u8>,
}

impl SsiPacket {
    /// Packet sent by the host
    pub fn host(opcode: u8, data: Vec<u8>) -> Self {
        Self {
            opcode,
            source: SOURCE_HOST,
            status: 0,
            data,
        }
    }

    pub fn is_retransmit(&self) -> bool {
        self.status & STATUS_RETRANSMIT != 0
    }

    /// `OPCODE SOURCE STATUS DATA..`, ready for the framer
    pub fn to_payload(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(self.data.len() + 3);
        payload.push(self.opcode);
        payload.push(self.source);
        payload.push(self.status);
        payload.extend_from_slice(&self.data);
        payload
    }

    /// Parse a complete frame as emitted by the length/checksum framer
    pub fn parse(frame: &[u8]) -> Result<Self> {
        let header_len = if frame.first() == Some(&EXTENDED_MARKER) {
            EXTENDED_HEADER_LEN
        } else {
            SHORT_HEADER_LEN
        };
        if frame.len() < header_len + CHECKSUM_LEN {
            return Err(DevSrvError::protocol(format!(
                "SSI frame too short: {} byte(s)",
                frame.len()
            )));
        }

        Ok(Self {
            opcode: frame[1],
            source: frame[2],
            status: frame[3],
            data: frame[header_len..frame.len() - CHECKSUM_LEN].to_vec(),
        })
    }
}

/// Opcode of a framed packet, without full parsing
pub fn opcode_of(frame: &[u8]) -> Option<u8> {
    frame.get(1).copied()
}

/// CMD_NAK cause byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NakCause {
    Resend,
    BadContext,
    Denied,
    Other(u8),
}

impl From<u8> for NakCause {
    fn from(value: u8) -> Self {
        match value {
            1 => NakCause::Resend,
            2 => NakCause::BadContext,
            6 => NakCause::Denied,
            other => NakCause::Other(other),
        }
    }
}

impl NakCause {
    fn detail(&self) -> String {
        match self {
            NakCause::Resend => "NAK_RESEND".to_string(),
            NakCause::BadContext => "NAK_BAD_CONTEXT".to_string(),
            NakCause::Denied => "NAK_DENIED".to_string(),
            NakCause::Other(code) => format!("NAK_{code:02X}"),
        }
    }
}

/// Barcode read by the decoder
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeEvent {
    pub symbology: u8,
    pub data: Vec<u8>,
}

impl DecodeEvent {
    pub fn symbology_name(&self) -> String {
        let name = match self.symbology {
            0x01 => "Code 39",
            0x02 => "Codabar",
            0x03 => "Code 128",
            0x06 => "Interleaved 2 of 5",
            0x07 => "Code 93",
            0x08 => "UPC-A",
            0x09 => "UPC-E",
            0x0A => "EAN-8",
            0x0B => "EAN-13",
            0x11 => "PDF417",
            0x1B => "Data Matrix",
            0x1C => "QR Code",
            other => return format!("0x{other:02X}"),
        };
        name.to_string()
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

/// Reply to one request, as classified by the opcode handler
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SsiReply {
    Ack,
    Nak(NakCause),
    Revision(String),
    Decode(DecodeEvent),
    Other(SsiPacket),
}

fn handle_packet(packet: SsiPacket) -> SsiReply {
    match packet.opcode {
        CMD_ACK => SsiReply::Ack,
        CMD_NAK => SsiReply::Nak(NakCause::from(packet.data.first().copied().unwrap_or(0))),
        REPLY_REVISION => SsiReply::Revision(
            String::from_utf8_lossy(&packet.data).trim().to_string(),
        ),
        DECODE_DATA => {
            let (symbology, data) = match packet.data.split_first() {
                Some((symbology, data)) => (*symbology, data.to_vec()),
                None => (0, Vec::new()),
            };
            SsiReply::Decode(DecodeEvent { symbology, data })
        },
        _ => SsiReply::Other(packet),
    }
}

/// Acknowledge packet sent by the host
fn host_ack() -> Vec<u8> {
    SsiPacket::host(CMD_ACK, Vec::new()).to_payload()
}

async fn decode_loop(
    name: String,
    channel: Arc<Channel>,
    mut frames: mpsc::Receiver<Vec<u8>>,
    decodes: mpsc::Sender<DecodeEvent>,
) {
    let mut last: Option<DecodeEvent> = None;

    while let Some(frame) = frames.recv().await {
        let packet = match SsiPacket::parse(&frame) {
            Ok(packet) => packet,
            Err(e) => {
                warn!("[{}] {}", name, e);
                continue;
            },
        };
        if packet.opcode != DECODE_DATA {
            debug!("[{}] Unsolicited opcode 0x{:02X} ignored", name, packet.opcode);
            continue;
        }

        let retransmit = packet.is_retransmit();
        if let Err(e) = channel.write(&host_ack()).await {
            warn!("[{}] Decode ACK failed: {}", name, e);
        }

        if let SsiReply::Decode(event) = handle_packet(packet) {
            if retransmit && last.as_ref() == Some(&event) {
                debug!("[{}] Retransmitted decode dropped", name);
                continue;
            }
            info!("[{}] Barcode ({}): {}", name, event.symbology_name(), event.text());
            last = Some(event.clone());
            if decodes.try_send(event).is_err() {
                warn!("[{}] Decode subscriber lagging, barcode dropped", name);
            }
        }
    }
    debug!("[{}] Decode listener stopped", name);
}

/// SSI protocol client over a length/checksum channel
pub struct SsiClient {
    name: String,
    device_key: String,
    channel: Arc<Channel>,
    decode_task: Option<JoinHandle<()>>,
}

impl SsiClient {
    /// Start the client and its unsolicited decode listener
    pub fn new(
        name: impl Into<String>,
        device_key: impl Into<String>,
        channel: Arc<Channel>,
        decodes: mpsc::Sender<DecodeEvent>,
    ) -> Self {
        let name = name.into();
        let decode_task = channel.take_unsolicited().map(|frames| {
            tokio::spawn(decode_loop(
                name.clone(),
                Arc::clone(&channel),
                frames,
                decodes,
            ))
        });
        channel.start();

        Self {
            name,
            device_key: device_key.into(),
            channel,
            decode_task,
        }
    }

    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    /// Write `packet` and wait for `expected` or CMD_NAK
    ///
    /// A NAK asking for a resend is honored once with the retransmit bit set.
    pub async fn send_packet(&self, packet: SsiPacket, expected: u8, timeout: Duration) -> Result<SsiReply> {
        let reply = self.exchange(&packet, expected, timeout).await?;
        if reply != SsiReply::Nak(NakCause::Resend) {
            return Ok(reply);
        }

        debug!("[{}] Decoder asked for resend of 0x{:02X}", self.name, packet.opcode);
        let retry = SsiPacket {
            status: packet.status | STATUS_RETRANSMIT,
            ..packet
        };
        self.exchange(&retry, expected, timeout).await
    }

    async fn exchange(&self, packet: &SsiPacket, expected: u8, timeout: Duration) -> Result<SsiReply> {
        let frame = self
            .channel
            .send_and_wait(
                &packet.to_payload(),
                move |frame| matches!(opcode_of(frame), Some(op) if op == expected || op == CMD_NAK),
                timeout,
            )
            .await?;
        Ok(handle_packet(SsiPacket::parse(&frame)?))
    }

    pub async fn request_revision(&self, timeout: Duration) -> Result<CommandResult> {
        let reply = self
            .send_packet(SsiPacket::host(REQUEST_REVISION, Vec::new()), REPLY_REVISION, timeout)
            .await?;
        Ok(match reply {
            SsiReply::Revision(revision) => {
                CommandResult::ok(format!("Revision {revision}")).with_data(revision.into_bytes())
            },
            other => self.reply_result("REQUEST_REVISION", other),
        })
    }

    pub async fn scan_enable(&self, timeout: Duration) -> Result<CommandResult> {
        self.simple("SCAN_ENABLE", SsiPacket::host(SCAN_ENABLE, Vec::new()), timeout)
            .await
    }

    pub async fn scan_disable(&self, timeout: Duration) -> Result<CommandResult> {
        self.simple("SCAN_DISABLE", SsiPacket::host(SCAN_DISABLE, Vec::new()), timeout)
            .await
    }

    pub async fn start_session(&self, timeout: Duration) -> Result<CommandResult> {
        self.simple("START_SESSION", SsiPacket::host(START_SESSION, Vec::new()), timeout)
            .await
    }

    pub async fn stop_session(&self, timeout: Duration) -> Result<CommandResult> {
        self.simple("STOP_SESSION", SsiPacket::host(STOP_SESSION, Vec::new()), timeout)
            .await
    }

    pub async fn beep(&self, code: u8, timeout: Duration) -> Result<CommandResult> {
        self.simple("BEEP", SsiPacket::host(BEEP, vec![code]), timeout)
            .await
    }

    /// Request answered by a bare CMD_ACK
    async fn simple(&self, command: &str, packet: SsiPacket, timeout: Duration) -> Result<CommandResult> {
        let reply = self.send_packet(packet, CMD_ACK, timeout).await?;
        Ok(self.reply_result(command, reply))
    }

    fn reply_result(&self, command: &str, reply: SsiReply) -> CommandResult {
        match reply {
            SsiReply::Ack => CommandResult::ok(format!("{command} acknowledged")),
            SsiReply::Nak(cause) => {
                warn!("[{}] {} rejected: {:?}", self.name, command, cause);
                CommandResult::failure(format!("{command} rejected by decoder ({cause:?})"))
                    .with_error_code(ErrorCode::device(
                        &self.device_key,
                        ErrorCategory::Command,
                        cause.detail(),
                    ))
                    .with_retryable(cause == NakCause::Resend)
            },
            other => CommandResult::failure(format!("{command}: unexpected reply {other:?}")),
        }
    }
}

impl Drop for SsiClient {
    fn drop(&mut self) {
        if let Some(task) = self.decode_task.take() {
            task.abort();
        }
    }
}

impl std::fmt::Debug for SsiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SsiClient")
            .field("name", &self.name)
            .field("channel", &self.channel)
            .finish()
    }
}
