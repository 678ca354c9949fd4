//! No-op transport for devices that need no physical link

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::traits::{LinkState, Transport, TransportError, TransportStats};

/// Idle pause before a read reports "no data"
pub const NULL_READ_IDLE: Duration = Duration::from_millis(50);

/// Opens instantly, discards writes, never produces bytes
#[derive(Debug, Default)]
pub struct NullTransport {
    link: LinkState,
}

impl NullTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Transport for NullTransport {
    fn transport_type(&self) -> &str {
        "none"
    }

    fn name(&self) -> &str {
        "null"
    }

    async fn open(&self) -> Result<(), TransportError> {
        if !self.link.is_open() {
            self.link.check_reusable("null")?;
            self.link.mark_open();
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.link.mark_lost();
        Ok(())
    }

    async fn read(&self, _buf: &mut [u8]) -> Result<usize, TransportError> {
        tokio::time::sleep(NULL_READ_IDLE).await;
        Ok(0)
    }

    async fn write(&self, data: &[u8]) -> Result<(), TransportError> {
        self.link.record_sent(data.len());
        Ok(())
    }

    fn disconnected(&self) -> CancellationToken {
        self.link.token()
    }

    fn is_open(&self) -> bool {
        self.link.is_open()
    }

    fn stats(&self) -> TransportStats {
        self.link.stats()
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_null_transport_contract() {
        let transport = NullTransport::new();
        transport.open().await.unwrap();
        transport.open().await.unwrap();
        assert!(transport.is_open());

        transport.write(&[1, 2, 3]).await.unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(transport.read(&mut buf).await.unwrap(), 0);

        let signal = transport.disconnected();
        transport.close().await.unwrap();
        assert!(signal.is_cancelled());
        assert_eq!(transport.stats().bytes_sent, 3);
        assert_eq!(transport.stats().opens, 1);
    }
}
