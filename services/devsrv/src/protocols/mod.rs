//! Protocol clients, one per device family

pub mod dispenser;
pub mod ssi;

pub use dispenser::{DispenserClient, DispenserCommand, HandshakeConfig, SensorFlags};
pub use ssi::{DecodeEvent, NakCause, SsiClient, SsiPacket, SsiReply};
