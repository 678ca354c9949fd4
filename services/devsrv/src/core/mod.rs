//! Communication core: configuration, transports, framing and the channel

pub mod channel;
pub mod config;
pub mod framing;
pub mod transport;
