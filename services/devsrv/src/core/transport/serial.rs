//! Serial Transport Implementation
//!
//! Serial port transport over `tokio-serial`. Reads use a short timeout and
//! report "no data" as `Ok(0)`; any I/O failure raises the disconnect signal.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::traits::{LinkState, Transport, TransportError, TransportStats};

/// Read timeout for a single poll of the port
pub const SERIAL_READ_TIMEOUT: Duration = Duration::from_millis(100);
const SERIAL_WRITE_TIMEOUT: Duration = Duration::from_millis(1000);

/// Parity setting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Parity {
    None,
    Even,
    Odd,
}

impl FromStr for Parity {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "n" | "none" => Ok(Parity::None),
            "e" | "even" => Ok(Parity::Even),
            "o" | "odd" => Ok(Parity::Odd),
            other => Err(TransportError::ConfigError(format!(
                "Parity must be N, E or O, got '{other}'"
            ))),
        }
    }
}

/// Serial line parameters, written as `"baud,databits,stopbits,parity"`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialParams {
    pub baud_rate: u32,
    pub data_bits: u8,
    pub stop_bits: u8,
    pub parity: Parity,
}

impl Default for SerialParams {
    fn default() -> Self {
        Self {
            baud_rate: 9600,
            data_bits: 8,
            stop_bits: 1,
            parity: Parity::None,
        }
    }
}

impl SerialParams {
    pub fn validate(&self) -> Result<(), TransportError> {
        if self.baud_rate == 0 {
            return Err(TransportError::ConfigError(
                "Baud rate must be greater than zero".to_string(),
            ));
        }

        if ![5, 6, 7, 8].contains(&self.data_bits) {
            return Err(TransportError::ConfigError(
                "Data bits must be 5, 6, 7, or 8".to_string(),
            ));
        }

        if ![1, 2].contains(&self.stop_bits) {
            return Err(TransportError::ConfigError(
                "Stop bits must be 1 or 2".to_string(),
            ));
        }

        Ok(())
    }

    fn data_bits(&self) -> tokio_serial::DataBits {
        match self.data_bits {
            5 => tokio_serial::DataBits::Five,
            6 => tokio_serial::DataBits::Six,
            7 => tokio_serial::DataBits::Seven,
            _ => tokio_serial::DataBits::Eight,
        }
    }

    fn stop_bits(&self) -> tokio_serial::StopBits {
        match self.stop_bits {
            2 => tokio_serial::StopBits::Two,
            _ => tokio_serial::StopBits::One,
        }
    }

    fn parity(&self) -> tokio_serial::Parity {
        match self.parity {
            Parity::Even => tokio_serial::Parity::Even,
            Parity::Odd => tokio_serial::Parity::Odd,
            Parity::None => tokio_serial::Parity::None,
        }
    }
}

impl FromStr for SerialParams {
    type Err = TransportError;

    /// Empty input yields the defaults (9600,8,1,N)
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().is_empty() {
            return Ok(Self::default());
        }

        let parts: Vec<&str> = s.split(',').map(str::trim).collect();
        if parts.len() != 4 {
            return Err(TransportError::ConfigError(format!(
                "Serial parameters must be 'baud,databits,stopbits,parity', got '{s}'"
            )));
        }

        let parse_num = |field: &str, value: &str| {
            value.parse::<u32>().map_err(|_| {
                TransportError::ConfigError(format!("Invalid {field} '{value}' in '{s}'"))
            })
        };

        let parse_small = |field: &str, value: &str| {
            parse_num(field, value).and_then(|n| {
                u8::try_from(n).map_err(|_| {
                    TransportError::ConfigError(format!("Invalid {field} '{value}' in '{s}'"))
                })
            })
        };

        let params = Self {
            baud_rate: parse_num("baud rate", parts[0])?,
            data_bits: parse_small("data bits", parts[1])?,
            stop_bits: parse_small("stop bits", parts[2])?,
            parity: parts[3].parse()?,
        };
        params.validate()?;
        Ok(params)
    }
}

impl fmt::Display for SerialParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parity = match self.parity {
            Parity::None => 'N',
            Parity::Even => 'E',
            Parity::Odd => 'O',
        };
        write!(
            f,
            "{},{},{},{}",
            self.baud_rate, self.data_bits, self.stop_bits, parity
        )
    }
}

/// Serial transport implementation
pub struct SerialTransport {
    port: String,
    params: SerialParams,
    reader: Mutex<Option<ReadHalf<SerialStream>>>,
    writer: Mutex<Option<WriteHalf<SerialStream>>>,
    link: LinkState,
}

impl fmt::Debug for SerialTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerialTransport")
            .field("port", &self.port)
            .field("params", &self.params.to_string())
            .field("open", &self.link.is_open())
            .finish()
    }
}

impl SerialTransport {
    pub fn new(port: impl Into<String>, params: SerialParams) -> Result<Self, TransportError> {
        let port = port.into();
        if port.is_empty() {
            return Err(TransportError::ConfigError(
                "Port path cannot be empty".to_string(),
            ));
        }
        params.validate()?;

        Ok(Self {
            port,
            params,
            reader: Mutex::new(None),
            writer: Mutex::new(None),
            link: LinkState::new(),
        })
    }
}

#[async_trait]
impl Transport for SerialTransport {
    fn transport_type(&self) -> &str {
        "serial"
    }

    fn name(&self) -> &str {
        &self.port
    }

    async fn open(&self) -> Result<(), TransportError> {
        if self.link.is_open() {
            return Ok(());
        }
        self.link.check_reusable(&self.port)?;

        debug!("Opening serial port: {} ({})", self.port, self.params);

        let result = tokio_serial::new(&self.port, self.params.baud_rate)
            .data_bits(self.params.data_bits())
            .parity(self.params.parity())
            .stop_bits(self.params.stop_bits())
            .flow_control(tokio_serial::FlowControl::None)
            .timeout(SERIAL_READ_TIMEOUT)
            .open_native_async();

        match result {
            Ok(mut port) => {
                #[cfg(unix)]
                port.set_exclusive(false).map_err(|e| {
                    TransportError::ConnectionFailed(format!("Failed to set exclusive mode: {e}"))
                })?;

                let (read_half, write_half) = tokio::io::split(port);
                *self.reader.lock().await = Some(read_half);
                *self.writer.lock().await = Some(write_half);
                self.link.mark_open();

                info!("Opened serial port: {}", self.port);
                Ok(())
            },
            Err(e) => {
                self.link.mark_failed_open();
                let msg = format!("Failed to open serial port {}: {e}", self.port);
                error!("{msg}");
                Err(TransportError::ConnectionFailed(msg))
            },
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        let had_writer = self.writer.lock().await.take().is_some();
        self.reader.lock().await.take();
        self.link.mark_lost();
        if had_writer {
            info!("Closed serial port: {}", self.port);
        }
        Ok(())
    }

    async fn read(&self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let mut guard = self.reader.lock().await;
        let reader = guard
            .as_mut()
            .ok_or_else(|| TransportError::NotOpen(self.port.clone()))?;

        match timeout(SERIAL_READ_TIMEOUT, reader.read(buf)).await {
            Ok(Ok(0)) | Err(_) => Ok(0),
            Ok(Ok(n)) => {
                self.link.record_received(n);
                debug!(
                    hex_data = %common::hex::encode_spaced(&buf[..n]),
                    length = n,
                    direction = "recv",
                    "[Serial] {} raw packet",
                    self.port
                );
                Ok(n)
            },
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::TimedOut => Ok(0),
            Ok(Err(e)) => {
                guard.take();
                drop(guard);
                self.link.mark_lost();
                let msg = format!("{}: {e}", self.port);
                error!("Serial read failed: {msg}");
                Err(TransportError::ReceiveFailed(msg))
            },
        }
    }

    async fn write(&self, data: &[u8]) -> Result<(), TransportError> {
        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| TransportError::NotOpen(self.port.clone()))?;

        let op = async {
            writer.write_all(data).await?;
            writer.flush().await
        };

        match timeout(SERIAL_WRITE_TIMEOUT, op).await {
            Ok(Ok(())) => {
                self.link.record_sent(data.len());
                debug!(
                    hex_data = %common::hex::encode_spaced(data),
                    length = data.len(),
                    direction = "send",
                    "[Serial] {} raw packet",
                    self.port
                );
                Ok(())
            },
            Ok(Err(e)) => {
                guard.take();
                drop(guard);
                self.link.mark_lost();
                let msg = format!("{}: {e}", self.port);
                error!("Serial write failed: {msg}");
                Err(TransportError::SendFailed(msg))
            },
            Err(_) => {
                let msg = format!("{}: write timed out after {SERIAL_WRITE_TIMEOUT:?}", self.port);
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
