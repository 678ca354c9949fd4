//! TCP Transport Implementation
//!
//! Network-attached peripherals. A read of zero bytes is a peer close.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::traits::{LinkState, Transport, TransportError, TransportStats};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const TCP_WRITE_TIMEOUT: Duration = Duration::from_secs(2);

/// TCP transport implementation
pub struct TcpTransport {
    address: String,
    connect_timeout: Duration,
    reader: Mutex<Option<OwnedReadHalf>>,
    writer: Mutex<Option<OwnedWriteHalf>>,
    link: LinkState,
}

impl fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpTransport")
            .field("address", &self.address)
            .field("open", &self.link.is_open())
            .finish()
    }
}

impl TcpTransport {
    /// `address` is `host:port`; the host is resolved at open time
    pub fn new(address: impl Into<String>, connect_timeout: Duration) -> Result<Self, TransportError> {
        let address = address.into();
        Self::validate_address(&address)?;
        if connect_timeout.is_zero() {
            return Err(TransportError::ConfigError(
                "Connect timeout must be greater than zero".to_string(),
            ));
        }

        Ok(Self {
            address,
            connect_timeout,
            reader: Mutex::new(None),
            writer: Mutex::new(None),
            link: LinkState::new(),
        })
    }

    /// Parse the optional connect-timeout parameter (milliseconds)
    pub fn parse_timeout(parameters: &str) -> Result<Duration, TransportError> {
        let trimmed = parameters.trim();
        if trimmed.is_empty() {
            return Ok(DEFAULT_CONNECT_TIMEOUT);
        }
        trimmed
            .parse::<u64>()
            .map(Duration::from_millis)
            .map_err(|_| {
                TransportError::ConfigError(format!(
                    "TCP parameters must be a connect timeout in ms, got '{parameters}'"
                ))
            })
    }

    pub fn validate_address(address: &str) -> Result<(), TransportError> {
        let (host, port) = address.rsplit_once(':').ok_or_else(|| {
            TransportError::ConfigError(format!("TCP address must be host:port, got '{address}'"))
        })?;
        if host.is_empty() {
            return Err(TransportError::ConfigError(
                "Host cannot be empty".to_string(),
            ));
        }
        match port.parse::<u16>() {
            Ok(0) | Err(_) => Err(TransportError::ConfigError(format!(
                "Invalid TCP port in '{address}'"
            ))),
            Ok(_) => Ok(()),
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn transport_type(&self) -> &str {
        "tcp"
    }

    fn name(&self) -> &str {
        &self.address
    }

    async fn open(&self) -> Result<(), TransportError> {
        if self.link.is_open() {
            return Ok(());
        }
        self.link.check_reusable(&self.address)?;

        debug!("Connecting to {}", self.address);
        let stream = match timeout(self.connect_timeout, TcpStream::connect(&self.address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                self.link.mark_failed_open();
                let msg = format!("Failed to connect to {}: {e}", self.address);
                error!("{msg}");
                return Err(TransportError::ConnectionFailed(msg));
            },
            Err(_) => {
                self.link.mark_failed_open();
                let msg = format!(
                    "Connect to {} timed out after {:?}",
                    self.address, self.connect_timeout
                );
                warn!("{msg}");
                return Err(TransportError::Timeout(msg));
            },
        };

        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY on {}: {e}", self.address);
        }

        let (read_half, write_half) = stream.into_split();
        *self.reader.lock().await = Some(read_half);
        *self.writer.lock().await = Some(write_half);
        self.link.mark_open();

        info!("Connected to {}", self.address);
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            // Best effort FIN; the peer may already be gone
            let _ = writer.shutdown().await;
            info!("Closed connection to {}", self.address);
        }
        self.reader.lock().await.take();
        self.link.mark_lost();
        Ok(())
    }

    async fn read(&self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let mut guard = self.reader.lock().await;
        let reader = guard
            .as_mut()
            .ok_or_else(|| TransportError::NotOpen(self.address.clone()))?;

        match reader.read(buf).await {
            Ok(0) => {
                guard.take();
                drop(guard);
                self.link.mark_lost();
                warn!("Peer {} closed the connection", self.address);
                Err(TransportError::ConnectionLost(format!(
                    "{}: closed by peer",
                    self.address
                )))
            },
            Ok(n) => {
                self.link.record_received(n);
                debug!(
                    hex_data = %common::hex::encode_spaced(&buf[..n]),
                    length = n,
                    direction = "recv",
                    "[TCP] {} raw packet",
                    self.address
                );
                Ok(n)
            },
            Err(e) => {
                guard.take();
                drop(guard);
                self.link.mark_lost();
                let msg = format!("{}: {e}", self.address);
                error!("TCP read failed: {msg}");
                Err(TransportError::ReceiveFailed(msg))
            },
        }
    }

    async fn write(&self, data: &[u8]) -> Result<(), TransportError> {
        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| TransportError::NotOpen(self.address.clone()))?;

        match timeout(TCP_WRITE_TIMEOUT, writer.write_all(data)).await {
            Ok(Ok(())) => {
                self.link.record_sent(data.len());
                debug!(
                    hex_data = %common::hex::encode_spaced(data),
                    length = data.len(),
                    direction = "send",
                    "[TCP] {} raw packet",
                    self.address
                );
                Ok(())
            },
            Ok(Err(e)) => {
                guard.take();
                drop(guard);
                self.link.mark_lost();
                let msg = format!("{}: {e}", self.address);
                error!("TCP write failed: {msg}");
                Err(TransportError::SendFailed(msg))
            },
            Err(_) => {
                let msg = format!("{}: write timed out after {TCP_WRITE_TIMEOUT:?}", self.address);
                warn!("{msg}");
                Err(TransportError::Timeout(msg))
            },
        }
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
