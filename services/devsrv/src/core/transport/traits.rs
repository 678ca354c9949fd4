//! Transport Layer Traits
//!
//! Uniform open/close/read/write contract over a physical medium, plus the
//! shared bookkeeping every implementation carries: statistics and the
//! disconnect signal.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Transport layer error types
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    /// Connection failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Connection lost
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// Send operation failed
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Receive operation failed
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// Timeout occurred
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Transport used before open or after close
    #[error("Not open: {0}")]
    NotOpen(String),
}

/// Transport statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransportStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    /// Successful opens
    pub opens: u64,
    pub failed_opens: u64,
    pub disconnects: u64,
    pub last_open: Option<DateTime<Utc>>,
}

impl TransportStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_open(&mut self) {
        self.opens += 1;
        self.last_open = Some(Utc::now());
    }

    pub fn record_failed_open(&mut self) {
        self.failed_opens += 1;
    }

    pub fn record_disconnect(&mut self) {
        self.disconnects += 1;
    }

    pub fn record_bytes_sent(&mut self, bytes: usize) {
        self.bytes_sent += bytes as u64;
    }

    pub fn record_bytes_received(&mut self, bytes: usize) {
        self.bytes_received += bytes as u64;
    }
}

/// Core transport trait
///
/// All methods take `&self` so one reader task and any number of writers can
/// share an `Arc<dyn Transport>`; implementations split the medium into
/// independently locked halves.
///
/// A transport instance lives for exactly one connection attempt. Once its
/// disconnect signal fires it stays fired; the supervisor builds a fresh
/// instance for the next attempt.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// Transport type identifier ("serial", "tcp", "sdk", "none", "mock")
    fn transport_type(&self) -> &str;

    /// Human-readable endpoint name, e.g. the port path
    fn name(&self) -> &str;

    /// Open the medium. Idempotent while open.
    async fn open(&self) -> Result<(), TransportError>;

    /// Close the medium and raise the disconnect signal. Idempotent.
    async fn close(&self) -> Result<(), TransportError>;

    /// Read available bytes into `buf`. `Ok(0)` means no data yet, not EOF.
    async fn read(&self, buf: &mut [u8]) -> Result<usize, TransportError>;

    /// Write the whole buffer
    async fn write(&self, data: &[u8]) -> Result<(), TransportError>;

    /// Token cancelled on explicit close or on detected loss of the medium
    fn disconnected(&self) -> CancellationToken;

    fn is_open(&self) -> bool;

    fn stats(&self) -> TransportStats;
}

/// Open flag, statistics and disconnect signal shared by the concrete transports
#[derive(Debug, Default)]
pub struct LinkState {
    open: AtomicBool,
    stats: Mutex<TransportStats>,
    disconnected: CancellationToken,
}

impl LinkState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails once the disconnect signal has fired; the instance is spent
    pub fn check_reusable(&self, name: &str) -> Result<(), TransportError> {
        if self.disconnected.is_cancelled() {
            return Err(TransportError::ConnectionFailed(format!(
                "{name}: transport already closed"
            )));
        }
        Ok(())
    }

    pub fn mark_open(&self) {
        self.open.store(true, Ordering::SeqCst);
        self.stats.lock().record_open();
    }

    pub fn mark_failed_open(&self) {
        self.stats.lock().record_failed_open();
    }

    /// Mark the link down and raise the signal. Counted once per instance.
    pub fn mark_lost(&self) {
        let was_open = self.open.swap(false, Ordering::SeqCst);
        if was_open {
            self.stats.lock().record_disconnect();
        }
        self.disconnected.cancel();
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    pub fn token(&self) -> CancellationToken {
        self.disconnected.clone()
    }

    pub fn record_sent(&self, bytes: usize) {
        self.stats.lock().record_bytes_sent(bytes);
    }

    pub fn record_received(&self, bytes: usize) {
        self.stats.lock().record_bytes_received(bytes);
    }

    pub fn stats(&self) -> TransportStats {
        self.stats.lock().clone()
    }
}
