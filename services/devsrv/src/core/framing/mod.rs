//! Frame extraction
//!
//! A framer is a pure function over the channel's receive buffer. It either
//! returns one frame, asks the channel to discard exactly one byte, or asks
//! for more bytes. It never blocks and never touches bytes past the frame it
//! reports.

pub mod length_checksum;
pub mod stx_etx;

use std::fmt;

use crate::error::Result;

pub use length_checksum::LengthChecksumFramer;
pub use stx_etx::{LengthWidth, StxEtxFramer};

/// Hard cap on a single frame for both framers
pub const MAX_FRAME_LEN: usize = 1024;

/// Why a byte was dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    /// Not the start of any plausible frame
    Garbage,
    /// Start of a structurally complete frame whose checksum failed
    Checksum {
        /// Bytes the corrupt frame spans from the discarded byte
        frame_len: usize,
    },
}

/// Outcome of one extraction attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extraction {
    Frame { frame: Vec<u8>, consumed: usize },
    Discard { count: usize, reason: DiscardReason },
}

/// Protocol framer
pub trait Framer: Send + Sync + fmt::Debug {
    /// `None` means the buffer holds no decision yet; wait for more bytes
    fn try_extract_frame(&self, buffer: &[u8]) -> Option<Extraction>;

    /// Wrap an outgoing payload into a complete frame
    ///
    /// Fails when the frame would not fit the length field or `MAX_FRAME_LEN`.
    fn make_frame(&self, payload: &[u8]) -> Result<Vec<u8>>;
}

/// Verdict on the candidate frame starting at offset 0
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Candidate {
    Valid(usize),
    BadChecksum(usize),
    Invalid,
    Incomplete,
}

/// Shared resync policy on top of a per-protocol candidate check
///
/// An incomplete head is normally waited on. It is dropped as garbage when a
/// complete multi-byte frame already sits further on, so a corrupt length
/// byte cannot stall the stream. The lookahead never reaches past
/// `MAX_FRAME_LEN`: a head still incomplete at that size can never complete.
pub(crate) fn extract_with(buffer: &[u8], check: impl Fn(&[u8]) -> Candidate) -> Option<Extraction> {
    const GARBAGE: Extraction = Extraction::Discard {
        count: 1,
        reason: DiscardReason::Garbage,
    };

    if buffer.is_empty() {
        return None;
    }

    match check(buffer) {
        Candidate::Valid(len) => Some(Extraction::Frame {
            frame: buffer[..len].to_vec(),
            consumed: len,
        }),
        Candidate::BadChecksum(frame_len) => Some(Extraction::Discard {
            count: 1,
            reason: DiscardReason::Checksum { frame_len },
        }),
        Candidate::Invalid => Some(GARBAGE),
        Candidate::Incomplete if buffer.len() >= MAX_FRAME_LEN => Some(GARBAGE),
        Candidate::Incomplete => {
            let later_frame = (1..buffer.len())
                .any(|offset| matches!(check(&buffer[offset..]), Candidate::Valid(len) if len > 1));
            later_frame.then_some(GARBAGE)
        },
    }
}

/// Drain every decision from `buffer`, returning frames and discard reasons in order
#[cfg(test)]
pub(crate) fn drain(framer: &dyn Framer, buffer: &mut Vec<u8>) -> (Vec<Vec<u8>>, Vec<DiscardReason>) {
    let mut frames = Vec::new();
    let mut discards = Vec::new();
    while let Some(extraction) = framer.try_extract_frame(buffer) {
        match extraction {
            Extraction::Frame { frame, consumed } => {
                buffer.drain(..consumed);
                frames.push(frame);
            },
            Extraction::Discard { count, reason } => {
                buffer.drain(..count);
                discards.push(reason);
            },
        }
    }
    (frames, discards)
}
