//! Scripted transport for tests and simulations
//!
//! Inbound bytes are injected as chunks (one chunk per read), every write is
//! logged between begin/end markers, and an optional responder turns each
//! write into inbound replies the way a simulated peripheral would.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::traits::{LinkState, Transport, TransportError, TransportStats};

/// How long an empty read waits for injected bytes before returning `Ok(0)`
const MOCK_READ_IDLE: Duration = Duration::from_millis(20);

/// Turns one written buffer into zero or more inbound chunks
pub type Responder = Arc<dyn Fn(&[u8]) -> Vec<Vec<u8>> + Send + Sync>;

/// Entry of the write log
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteEvent {
    Begin(Vec<u8>),
    End(Vec<u8>),
}

#[derive(Default)]
struct MockState {
    inbound: VecDeque<Vec<u8>>,
    events: Vec<WriteEvent>,
    responder: Option<Responder>,
}

/// Mock transport implementation
pub struct MockTransport {
    name: String,
    state: Mutex<MockState>,
    data_ready: Notify,
    write_delay: Mutex<Duration>,
    fail_open: AtomicBool,
    fail_writes: AtomicBool,
    active_writes: AtomicUsize,
    max_active_writes: AtomicUsize,
    link: LinkState,
}

impl fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockTransport")
            .field("name", &self.name)
            .field("open", &self.link.is_open())
            .finish()
    }
}

impl MockTransport {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(MockState::default()),
            data_ready: Notify::new(),
            write_delay: Mutex::new(Duration::ZERO),
            fail_open: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            active_writes: AtomicUsize::new(0),
            max_active_writes: AtomicUsize::new(0),
            link: LinkState::new(),
        }
    }

    /// Builder-style responder installation
    pub fn with_responder<F>(self, responder: F) -> Self
    where
        F: Fn(&[u8]) -> Vec<Vec<u8>> + Send + Sync + 'static,
    {
        self.set_responder(responder);
        self
    }

    pub fn set_responder<F>(&self, responder: F)
    where
        F: Fn(&[u8]) -> Vec<Vec<u8>> + Send + Sync + 'static,
    {
        self.state.lock().responder = Some(Arc::new(responder));
    }

    /// Queue bytes for the next read
    pub fn inject(&self, bytes: impl Into<Vec<u8>>) {
        let bytes = bytes.into();
        if bytes.is_empty() {
            return;
        }
        self.state.lock().inbound.push_back(bytes);
        self.data_ready.notify_one();
    }

    /// Time each write spends between its begin and end markers
    pub fn set_write_delay(&self, delay: Duration) {
        *self.write_delay.lock() = delay;
    }

    pub fn set_fail_open(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Simulate an unplugged cable
    pub fn simulate_disconnect(&self) {
        debug!("[Mock] {} simulated disconnect", self.name);
        self.link.mark_lost();
        self.data_ready.notify_one();
    }

    /// Completed writes in order
    pub fn written(&self) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .events
            .iter()
            .filter_map(|e| match e {
                WriteEvent::End(bytes) => Some(bytes.clone()),
                WriteEvent::Begin(_) => None,
            })
            .collect()
    }

    /// Full write log including begin markers
    pub fn events(&self) -> Vec<WriteEvent> {
        self.state.lock().events.clone()
    }

    /// Highest number of writes that were ever in flight at once
    pub fn max_concurrent_writes(&self) -> usize {
        self.max_active_writes.load(Ordering::SeqCst)
    }

    pub fn clear_written(&self) {
        self.state.lock().events.clear();
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn transport_type(&self) -> &str {
        "mock"
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn open(&self) -> Result<(), TransportError> {
        if self.link.is_open() {
            return Ok(());
        }
        self.link.check_reusable(&self.name)?;

        if self.fail_open.load(Ordering::SeqCst) {
            self.link.mark_failed_open();
            return Err(TransportError::ConnectionFailed(format!(
                "{}: mock open failure",
                self.name
            )));
        }
        self.link.mark_open();
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.link.mark_lost();
        self.data_ready.notify_one();
        Ok(())
    }

    async fn read(&self, buf: &mut [u8]) -> Result<usize, TransportError> {
        loop {
            if self.link.token().is_cancelled() {
                return Err(TransportError::ConnectionLost(format!(
                    "{}: mock link down",
                    self.name
                )));
            }
            if !self.link.is_open() {
                return Err(TransportError::NotOpen(self.name.clone()));
            }

            {
                let mut state = self.state.lock();
                if let Some(mut chunk) = state.inbound.pop_front() {
                    let n = chunk.len().min(buf.len());
                    buf[..n].copy_from_slice(&chunk[..n]);
                    if n < chunk.len() {
                        state.inbound.push_front(chunk.split_off(n));
                    }
                    drop(state);
                    self.link.record_received(n);
                    return Ok(n);
                }
            }

            if tokio::time::timeout(MOCK_READ_IDLE, self.data_ready.notified())
                .await
                .is_err()
            {
                return Ok(0);
            }
        }
    }

    async fn write(&self, data: &[u8]) -> Result<(), TransportError> {
        if !self.link.is_open() {
            return Err(TransportError::NotOpen(self.name.clone()));
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            self.link.mark_lost();
            return Err(TransportError::SendFailed(format!(
                "{}: mock write failure",
                self.name
            )));
        }

        let active = self.active_writes.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active_writes.fetch_max(active, Ordering::SeqCst);
        self.state.lock().events.push(WriteEvent::Begin(data.to_vec()));

        let delay = *self.write_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let responder = {
            let mut state = self.state.lock();
            state.events.push(WriteEvent::End(data.to_vec()));
            state.responder.clone()
        };
        self.active_writes.fetch_sub(1, Ordering::SeqCst);
        self.link.record_sent(data.len());

        if let Some(responder) = responder {
            for chunk in responder(data) {
                self.inject(chunk);
            }
        }
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
