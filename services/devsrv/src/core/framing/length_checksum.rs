//! Length + 16-bit checksum framing (SSI scanners)
//!
//! Short form:    `LEN OPCODE SOURCE STATUS DATA.. CK_HI CK_LO`
//! Extended form: `FF OPCODE SOURCE STATUS LEN_HI LEN_LO DATA.. CK_HI CK_LO`
//!
//! The length counts every byte before the checksum. The checksum is the
//! two's complement of the 16-bit sum of those bytes, big-endian.

use super::{extract_with, Candidate, Extraction, Framer, MAX_FRAME_LEN};
use crate::error::{DevSrvError, Result};

const EXTENDED_MARKER: u8 = 0xFF;
const SHORT_MIN_LEN: usize = 4;
const EXTENDED_MIN_LEN: usize = 6;
const EXTENDED_LEN_OFFSET: usize = 4;
const CHECKSUM_LEN: usize = 2;

/// Two's complement of the 16-bit byte sum
pub fn checksum(data: &[u8]) -> u16 {
    data.iter()
        .fold(0u16, |acc, &b| acc.wrapping_add(u16::from(b)))
        .wrapping_neg()
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LengthChecksumFramer;

impl LengthChecksumFramer {
    pub fn new() -> Self {
        Self
    }

    fn check(buffer: &[u8]) -> Candidate {
        let declared = if buffer[0] == EXTENDED_MARKER {
            if buffer.len() < EXTENDED_LEN_OFFSET + 2 {
                return Candidate::Incomplete;
            }
            let len = usize::from(u16::from_be_bytes([
                buffer[EXTENDED_LEN_OFFSET],
                buffer[EXTENDED_LEN_OFFSET + 1],
            ]));
            if len < EXTENDED_MIN_LEN {
                return Candidate::Invalid;
            }
            len
        } else {
            let len = usize::from(buffer[0]);
            if len < SHORT_MIN_LEN {
                return Candidate::Invalid;
            }
            len
        };

        let total = declared + CHECKSUM_LEN;
        if total > MAX_FRAME_LEN {
            return Candidate::Invalid;
        }
        if buffer.len() < total {
            return Candidate::Incomplete;
        }

        let expected = u16::from_be_bytes([buffer[declared], buffer[declared + 1]]);
        if checksum(&buffer[..declared]) == expected {
            Candidate::Valid(total)
        } else {
            Candidate::BadChecksum(total)
        }
    }
}

impl Framer for LengthChecksumFramer {
    fn try_extract_frame(&self, buffer: &[u8]) -> Option<Extraction> {
        extract_with(buffer, Self::check)
    }

    /// `payload` is `OPCODE SOURCE STATUS DATA..`
    fn make_frame(&self, payload: &[u8]) -> Result<Vec<u8>> {
        if payload.len() + 3 + CHECKSUM_LEN > MAX_FRAME_LEN {
            return Err(DevSrvError::protocol(format!(
                "SSI payload of {} bytes exceeds frame limit",
                payload.len()
            )));
        }

        let mut frame = Vec::with_capacity(payload.len() + 5);
        match u8::try_from(payload.len() + 1) {
            Ok(short_len) if short_len <= 0xFE || payload.len() < 3 => {
                frame.push(short_len);
                frame.extend_from_slice(payload);
            },
            _ => {
                let (header, data) = payload.split_at(3);
                let len = u16::try_from(payload.len() + 3)
                    .map_err(|_| DevSrvError::protocol("SSI extended length overflow"))?;
                frame.push(EXTENDED_MARKER);
                frame.extend_from_slice(header);
                frame.extend_from_slice(&len.to_be_bytes());
                frame.extend_from_slice(data);
            },
        }

        let ck = checksum(&frame);
        frame.extend_from_slice(&ck.to_be_bytes());
        Ok(frame)
    }
}
