//! STX/ETX + XOR framing (cash dispensers)
//!
//! `STX LEN.. CMD DATA.. ETX BCC`, where LEN counts STX through ETX and BCC
//! is the XOR of every byte after STX up to and including ETX. Bare ENQ, ACK
//! and NAK bytes are frames of their own.

use super::{extract_with, Candidate, Extraction, Framer, MAX_FRAME_LEN};
use crate::error::{DevSrvError, ErrorExt, Result};

pub const STX: u8 = 0x02;
pub const ETX: u8 = 0x03;
pub const ENQ: u8 = 0x05;
pub const ACK: u8 = 0x06;
pub const NAK: u8 = 0x15;

/// Width of the length field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LengthWidth {
    U8,
    /// Little-endian u16
    U16Le,
}

impl LengthWidth {
    fn bytes(self) -> usize {
        match self {
            LengthWidth::U8 => 1,
            LengthWidth::U16Le => 2,
        }
    }

    fn read(self, field: &[u8]) -> usize {
        match self {
            LengthWidth::U8 => usize::from(field[0]),
            LengthWidth::U16Le => usize::from(u16::from_le_bytes([field[0], field[1]])),
        }
    }

    fn write(self, len: usize, out: &mut Vec<u8>) -> Result<()> {
        match self {
            LengthWidth::U8 => out.push(u8::try_from(len).protocol_error("STX/ETX length")?),
            LengthWidth::U16Le => {
                let len = u16::try_from(len).protocol_error("STX/ETX length")?;
                out.extend_from_slice(&len.to_le_bytes());
            },
        }
        Ok(())
    }
}

/// XOR over a byte slice
pub fn bcc(data: &[u8]) -> u8 {
    data.iter().fold(0, |acc, b| acc ^ b)
}

/// Framer with independent length widths for outgoing and incoming frames
#[derive(Debug, Clone, Copy)]
pub struct StxEtxFramer {
    outgoing: LengthWidth,
    incoming: LengthWidth,
}

impl StxEtxFramer {
    pub fn new(outgoing: LengthWidth, incoming: LengthWidth) -> Self {
        Self { outgoing, incoming }
    }

    /// Host side of the dispenser link: u16 commands, u8 responses
    pub fn dispenser() -> Self {
        Self::new(LengthWidth::U16Le, LengthWidth::U8)
    }

    /// Device side of the dispenser link, for simulators
    pub fn dispenser_device() -> Self {
        Self::new(LengthWidth::U8, LengthWidth::U16Le)
    }

    fn check(&self, buffer: &[u8]) -> Candidate {
        match buffer[0] {
            ENQ | ACK | NAK => return Candidate::Valid(1),
            STX => {},
            _ => return Candidate::Invalid,
        }

        let width = self.incoming.bytes();
        if buffer.len() < 1 + width {
            return Candidate::Incomplete;
        }

        let len = self.incoming.read(&buffer[1..=width]);
        // STX + length + command + ETX
        if len < width + 3 || len + 1 > MAX_FRAME_LEN {
            return Candidate::Invalid;
        }

        let total = len + 1;
        if buffer.len() < total {
            return Candidate::Incomplete;
        }
        if buffer[len - 1] != ETX {
            return Candidate::Invalid;
        }

        if bcc(&buffer[1..len]) == buffer[len] {
            Candidate::Valid(total)
        } else {
            Candidate::BadChecksum(total)
        }
    }
}

impl Framer for StxEtxFramer {
    fn try_extract_frame(&self, buffer: &[u8]) -> Option<Extraction> {
        extract_with(buffer, |b| self.check(b))
    }

    /// `payload` is `CMD DATA..`
    fn make_frame(&self, payload: &[u8]) -> Result<Vec<u8>> {
        let width = self.outgoing.bytes();
        let len = 1 + width + payload.len() + 1;
        if len + 1 > MAX_FRAME_LEN {
            return Err(DevSrvError::protocol(format!(
                "STX/ETX payload of {} bytes exceeds frame limit",
                payload.len()
            )));
        }
        let mut frame = Vec::with_capacity(len + 1);
        frame.push(STX);
        self.outgoing.write(len, &mut frame)?;
        frame.extend_from_slice(payload);
        frame.push(ETX);
        frame.push(bcc(&frame[1..]));
        Ok(frame)
    }
}
