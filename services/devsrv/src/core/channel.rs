//! Request/response multiplexing over one transport
//!
//! Two tasks per running channel:
//!
//! - reader: `Transport::read` into the shared buffer, nothing else
//! - parser: asks the framer for frames and hands each one to the first
//!   pending waiter whose matcher accepts it (registration order), or to the
//!   unsolicited stream when nobody is waiting for it
//!
//! The parser never performs I/O, so a slow subscriber cannot stall byte
//! reception.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::core::framing::{DiscardReason, Extraction, Framer};
use crate::core::transport::Transport;
use crate::error::{DevSrvError, Result};

/// Receive buffer cap; oldest bytes are dropped past this
pub const MAX_BUFFER_LEN: usize = 64 * 1024;
const READ_CHUNK: usize = 4096;
const READ_IDLE_PAUSE: Duration = Duration::from_millis(10);
const DEFAULT_UNSOLICITED_CAPACITY: usize = 64;

/// Why a channel stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    Cancelled,
    Io(String),
}

impl StopReason {
    fn to_error(&self, channel: &str) -> DevSrvError {
        match self {
            StopReason::Cancelled => DevSrvError::cancelled(format!("{channel}: channel stopped")),
            StopReason::Io(msg) => DevSrvError::transport(format!("{channel}: {msg}")),
        }
    }
}

type Matcher = Box<dyn Fn(&[u8]) -> bool + Send + Sync>;

struct Waiter {
    id: u64,
    matcher: Matcher,
    checked: bool,
    completion: oneshot::Sender<Result<Vec<u8>>>,
}

struct ChannelShared {
    name: String,
    transport: Arc<dyn Transport>,
    framer: Arc<dyn Framer>,
    buffer: Mutex<BytesMut>,
    data_ready: Notify,
    waiters: Mutex<Vec<Waiter>>,
    next_id: AtomicU64,
    running: Mutex<Option<CancellationToken>>,
    unsolicited_tx: mpsc::Sender<Vec<u8>>,
    unsolicited_rx: Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
    subscribed: AtomicBool,
}

impl ChannelShared {
    fn remove_waiter(&self, id: u64) {
        self.waiters.lock().retain(|w| w.id != id);
    }

    fn stop(&self, reason: StopReason) {
        let token = self.running.lock().take();
        if let Some(token) = token {
            token.cancel();
            match &reason {
                StopReason::Cancelled => debug!("[{}] Channel stopped", self.name),
                StopReason::Io(msg) => warn!("[{}] Channel stopped: {}", self.name, msg),
            }
        }

        let drained: Vec<Waiter> = std::mem::take(&mut *self.waiters.lock());
        for waiter in drained {
            let _ = waiter.completion.send(Err(reason.to_error(&self.name)));
        }
        self.buffer.lock().clear();
    }

    fn append(&self, data: &[u8]) {
        let mut buffer = self.buffer.lock();
        let overflow = (buffer.len() + data.len()).saturating_sub(MAX_BUFFER_LEN);
        if overflow > 0 {
            warn!(
                "[{}] Receive buffer full, dropping {} oldest byte(s)",
                self.name, overflow
            );
            let from_buffer = overflow.min(buffer.len());
            buffer.advance(from_buffer);
            buffer.extend_from_slice(&data[overflow - from_buffer..]);
        } else {
            buffer.extend_from_slice(data);
        }
        drop(buffer);
        self.data_ready.notify_one();
    }

    fn next_extraction(&self) -> Option<Extraction> {
        let mut buffer = self.buffer.lock();
        let extraction = self.framer.try_extract_frame(&buffer[..])?;
        let consumed = match &extraction {
            Extraction::Frame { consumed, .. } => *consumed,
            Extraction::Discard { count, .. } => *count,
        };
        let advance_by = consumed.min(buffer.len());
        buffer.advance(advance_by);
        Some(extraction)
    }

    fn dispatch(&self, frame: Vec<u8>) {
        let waiter = {
            let mut waiters = self.waiters.lock();
            waiters
                .iter()
                .position(|w| (w.matcher)(&frame))
                .map(|index| waiters.remove(index))
        };

        match waiter {
            Some(waiter) => {
                trace!("[{}] Frame matched waiter {}", self.name, waiter.id);
                let _ = waiter.completion.send(Ok(frame));
            },
            None => self.publish_unsolicited(frame),
        }
    }

    fn publish_unsolicited(&self, frame: Vec<u8>) {
        if !self.subscribed.load(Ordering::SeqCst) {
            debug!(
                "[{}] Unsolicited frame ignored: {}",
                self.name,
                common::hex::encode_spaced(&frame)
            );
            return;
        }
        match self.unsolicited_tx.try_send(frame) {
            Ok(()) => {},
            Err(mpsc::error::TrySendError::Full(frame)) => warn!(
                "[{}] Unsolicited subscriber lagging, dropped {}",
                self.name,
                common::hex::encode_spaced(&frame)
            ),
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.subscribed.store(false, Ordering::SeqCst);
            },
        }
    }

    fn fail_checked_waiter(&self) {
        let waiter = {
            let mut waiters = self.waiters.lock();
            waiters
                .iter()
                .position(|w| w.checked)
                .map(|index| waiters.remove(index))
        };
        if let Some(waiter) = waiter {
            let _ = waiter.completion.send(Err(DevSrvError::checksum(format!(
                "{}: frame failed checksum",
                self.name
            ))));
        }
    }
}

async fn reader_loop(shared: Arc<ChannelShared>, token: CancellationToken) {
    let disconnected = shared.transport.disconnected();
    let mut chunk = vec![0u8; READ_CHUNK];

    loop {
        let result = tokio::select! {
            _ = token.cancelled() => return,
            _ = disconnected.cancelled() => {
                shared.stop(StopReason::Io("transport disconnected".to_string()));
                return;
            }
            result = shared.transport.read(&mut chunk) => result,
        };

        match result {
            Ok(0) => {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(READ_IDLE_PAUSE) => {}
                }
            },
            Ok(n) => shared.append(&chunk[..n]),
            Err(e) => {
                shared.stop(StopReason::Io(e.to_string()));
                return;
            },
        }
    }
}

async fn parser_loop(shared: Arc<ChannelShared>, token: CancellationToken) {
    // Bytes left of the last corrupt frame; one corrupt frame fails one waiter
    let mut corrupt_left = 0usize;

    loop {
        while let Some(extraction) = shared.next_extraction() {
            let consumed = match &extraction {
                Extraction::Frame { consumed, .. } => *consumed,
                Extraction::Discard { count, .. } => *count,
            };
            match extraction {
                Extraction::Frame { frame, .. } => {
                    trace!(
                        "[{}] Frame: {}",
                        shared.name,
                        common::hex::encode_spaced(&frame)
                    );
                    shared.dispatch(frame);
                },
                Extraction::Discard {
                    reason: DiscardReason::Checksum { frame_len },
                    ..
                } => {
                    if corrupt_left == 0 {
                        debug!("[{}] Checksum mismatch, resyncing", shared.name);
                        shared.fail_checked_waiter();
                        corrupt_left = frame_len;
                    } else {
                        trace!("[{}] Checksum mismatch inside corrupt frame", shared.name);
                    }
                },
                Extraction::Discard {
                    reason: DiscardReason::Garbage,
                    ..
                } => {
                    trace!("[{}] Discarded garbage byte", shared.name);
                },
            }
            corrupt_left = corrupt_left.saturating_sub(consumed);
        }

        tokio::select! {
            _ = token.cancelled() => return,
            _ = shared.data_ready.notified() => {}
        }
    }
}

/// Registered interest in one future frame
///
/// Dropping the handle deregisters the waiter.
pub struct PendingResponse {
    id: u64,
    rx: oneshot::Receiver<Result<Vec<u8>>>,
    shared: Arc<ChannelShared>,
}

impl PendingResponse {
    /// Await the matched frame; on timeout the waiter is removed
    pub async fn wait(mut self, timeout: Duration) -> Result<Vec<u8>> {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(DevSrvError::cancelled(format!(
                "{}: waiter dropped",
                self.shared.name
            ))),
            Err(_) => {
                self.shared.remove_waiter(self.id);
                // A completion may have landed between the deadline and removal
                match self.rx.try_recv() {
                    Ok(result) => result,
                    Err(_) => Err(DevSrvError::frame_timeout(format!(
                        "{}: no matching frame within {:?}",
                        self.shared.name, timeout
                    ))),
                }
            },
        }
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        self.shared.remove_waiter(self.id);
    }
}

/// Framed, multiplexed channel over one transport
pub struct Channel {
    shared: Arc<ChannelShared>,
}

impl Channel {
    pub fn new(
        name: impl Into<String>,
        transport: Arc<dyn Transport>,
        framer: Arc<dyn Framer>,
    ) -> Self {
        Self::with_capacity(name, transport, framer, DEFAULT_UNSOLICITED_CAPACITY)
    }

    pub fn with_capacity(
        name: impl Into<String>,
        transport: Arc<dyn Transport>,
        framer: Arc<dyn Framer>,
        unsolicited_capacity: usize,
    ) -> Self {
        let (unsolicited_tx, unsolicited_rx) = mpsc::channel(unsolicited_capacity.max(1));
        Self {
            shared: Arc::new(ChannelShared {
                name: name.into(),
                transport,
                framer,
                buffer: Mutex::new(BytesMut::with_capacity(READ_CHUNK)),
                data_ready: Notify::new(),
                waiters: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
                running: Mutex::new(None),
                unsolicited_tx,
                unsolicited_rx: Mutex::new(Some(unsolicited_rx)),
                subscribed: AtomicBool::new(false),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.shared.transport
    }

    /// Spawn reader and parser unless already running
    pub fn start(&self) {
        let mut running = self.shared.running.lock();
        if running.as_ref().is_some_and(|t| !t.is_cancelled()) {
            return;
        }

        let token = CancellationToken::new();
        *running = Some(token.clone());
        drop(running);

        debug!("[{}] Channel started", self.shared.name);
        tokio::spawn(reader_loop(Arc::clone(&self.shared), token.clone()));
        tokio::spawn(parser_loop(Arc::clone(&self.shared), token));
    }

    pub fn is_running(&self) -> bool {
        self.shared
            .running
            .lock()
            .as_ref()
            .is_some_and(|t| !t.is_cancelled())
    }

    /// Frame `payload` and write it
    pub async fn write(&self, payload: &[u8]) -> Result<()> {
        let frame = self.shared.framer.make_frame(payload)?;
        self.write_raw(&frame).await
    }

    /// Write bytes as-is (handshake bytes)
    pub async fn write_raw(&self, bytes: &[u8]) -> Result<()> {
        self.start();
        self.shared.transport.write(bytes).await?;
        Ok(())
    }

    /// Register interest before triggering the response
    ///
    /// A `checked` waiter is also failed with a checksum error when the
    /// framer drops a complete frame with a bad checksum.
    pub fn register<F>(&self, matcher: F, checked: bool) -> PendingResponse
    where
        F: Fn(&[u8]) -> bool + Send + Sync + 'static,
    {
        self.start();
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.shared.waiters.lock().push(Waiter {
            id,
            matcher: Box::new(matcher),
            checked,
            completion: tx,
        });
        PendingResponse {
            id,
            rx,
            shared: Arc::clone(&self.shared),
        }
    }

    /// Write `payload` and wait for the first frame accepted by `matcher`
    pub async fn send_and_wait<F>(&self, payload: &[u8], matcher: F, timeout: Duration) -> Result<Vec<u8>>
    where
        F: Fn(&[u8]) -> bool + Send + Sync + 'static,
    {
        let pending = self.register(matcher, false);
        self.write(payload).await?;
        pending.wait(timeout).await
    }

    /// Wait for the next frame accepted by `matcher` without writing
    pub async fn wait<F>(&self, matcher: F, timeout: Duration) -> Result<Vec<u8>>
    where
        F: Fn(&[u8]) -> bool + Send + Sync + 'static,
    {
        self.register(matcher, false).wait(timeout).await
    }

    /// Stop both tasks and fail every pending waiter with `reason`
    pub fn stop(&self, reason: StopReason) {
        self.shared.stop(reason);
    }

    /// The single receiver of frames nobody waited for
    pub fn take_unsolicited(&self) -> Option<mpsc::Receiver<Vec<u8>>> {
        let rx = self.shared.unsolicited_rx.lock().take();
        if rx.is_some() {
            self.shared.subscribed.store(true, Ordering::SeqCst);
        }
        rx
    }

    pub fn pending_count(&self) -> usize {
        self.shared.waiters.lock().len()
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.shared.stop(StopReason::Cancelled);
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.shared.name)
            .field("running", &self.is_running())
            .field("pending", &self.pending_count())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::core::framing::stx_etx::{ETX, STX};
    use crate::core::framing::{LengthWidth, StxEtxFramer};
    use crate::core::transport::MockTransport;

    fn symmetric() -> Arc<dyn Framer> {
        Arc::new(StxEtxFramer::new(LengthWidth::U8, LengthWidth::U8))
    }

    async fn setup() -> (Arc<MockTransport>, Channel) {
        let mock = Arc::new(MockTransport::new("mock"));
        mock.open().await.unwrap();
        let channel = Channel::new("test", mock.clone() as Arc<dyn Transport>, symmetric());
        (mock, channel)
    }

    fn reply(tag: u8) -> Vec<u8> {
        StxEtxFramer::new(LengthWidth::U8, LengthWidth::U8).make_frame(&[tag]).unwrap()
    }

    fn tagged(tag: u8) -> impl Fn(&[u8]) -> bool + Send + Sync + 'static {
        move |frame: &[u8]| frame.len() > 2 && frame[2] == tag
    }

    async fn wait_for_pending(channel: &Channel, n: usize) {
        for _ in 0..200 {
            if channel.pending_count() == n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected {n} pending waiters, have {}", channel.pending_count());
    }

    #[tokio::test]
    async fn test_disjoint_waiters_get_their_own_frames() {
        let (mock, channel) = setup().await;
        let channel = Arc::new(channel);

        let a = {
            let channel = channel.clone();
            tokio::spawn(async move {
                channel
                    .send_and_wait(b"A", tagged(b'a'), Duration::from_secs(2))
                    .await
            })
        };
        let b = {
            let channel = channel.clone();
            tokio::spawn(async move {
                channel
                    .send_and_wait(b"B", tagged(b'b'), Duration::from_secs(2))
                    .await
            })
        };
        wait_for_pending(&channel, 2).await;

        // Replies arrive in reverse order
        mock.inject(reply(b'b'));
        mock.inject(reply(b'a'));

        assert_eq!(a.await.unwrap().unwrap(), reply(b'a'));
        assert_eq!(b.await.unwrap().unwrap(), reply(b'b'));
        assert_eq!(mock.written().len(), 2);
    }

    #[tokio::test]
    async fn test_first_registered_waiter_wins() {
        let (mock, channel) = setup().await;
        let first = channel.register(|_| true, false);
        let second = channel.register(|_| true, false);

        mock.inject(reply(b'x'));
        assert_eq!(first.wait(Duration::from_secs(1)).await.unwrap(), reply(b'x'));

        let err = second.wait(Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, DevSrvError::FrameTimeout(_)));
    }

    #[tokio::test]
    async fn test_stop_fails_every_waiter() {
        let (_mock, channel) = setup().await;
        let channel = Arc::new(channel);

        let mut handles = Vec::new();
        for i in 0..5u8 {
            let channel = channel.clone();
            handles.push(tokio::spawn(async move {
                channel.wait(tagged(i), Duration::from_secs(30)).await
            }));
        }
        wait_for_pending(&channel, 5).await;

        channel.stop(StopReason::Io("unplugged".to_string()));

        for handle in handles {
            let result = tokio::time::timeout(Duration::from_secs(1), handle)
                .await
                .unwrap()
                .unwrap();
            assert!(matches!(result, Err(DevSrvError::TransportError(_))));
        }
        assert!(!channel.is_running());
        assert_eq!(channel.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_reason_is_cancellation() {
        let (_mock, channel) = setup().await;
        let pending = channel.register(|_| true, false);
        channel.stop(StopReason::Cancelled);
        let err = pending.wait(Duration::from_secs(1)).await.unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_transport_disconnect_fails_waiters() {
        let (mock, channel) = setup().await;
        let pending = channel.register(|_| true, false);

        mock.simulate_disconnect();

        let err = pending.wait(Duration::from_secs(2)).await.unwrap_err();
        assert!(matches!(err, DevSrvError::TransportError(_)));
        assert!(!channel.is_running());
    }

    #[tokio::test]
    async fn test_timeout_deregisters_waiter() {
        let (_mock, channel) = setup().await;
        let err = channel
            .wait(|_| true, Duration::from_millis(30))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(channel.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_dropped_handle_deregisters() {
        let (_mock, channel) = setup().await;
        let pending = channel.register(|_| true, false);
        assert_eq!(channel.pending_count(), 1);
        drop(pending);
        assert_eq!(channel.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_unmatched_frames_are_unsolicited() {
        let (mock, channel) = setup().await;
        let mut events = channel.take_unsolicited().unwrap();
        assert!(channel.take_unsolicited().is_none());

        channel.start();
        mock.inject(reply(b'u'));

        let frame = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame, reply(b'u'));
    }

    #[tokio::test]
    async fn test_checked_waiter_sees_checksum_failure() {
        let (mock, channel) = setup().await;
        let unchecked = channel.register(tagged(b'z'), false);
        let checked = channel.register(|_| true, true);

        let mut corrupt = reply(b'o');
        let last = corrupt.len() - 1;
        corrupt[last] ^= 0xFF;
        mock.inject(corrupt);

        let err = checked.wait(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, DevSrvError::ChecksumError(_)));
        assert_eq!(channel.pending_count(), 1);
        drop(unchecked);
    }

    #[tokio::test]
    async fn test_one_corrupt_frame_fails_one_checked_waiter() {
        let (mock, channel) = setup().await;
        let first = channel.register(|_| true, true);
        let second = channel.register(|_| true, true);

        // Bad outer BCC, and the nested STX at offset 2 also fails its BCC
        mock.inject(vec![STX, 0x08, STX, 0x04, b'o', ETX, 0x00, ETX, 0x00]);

        let err = first.wait(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, DevSrvError::ChecksumError(_)));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(channel.pending_count(), 1);

        // A later, separate corrupt frame reaches the next waiter
        let mut corrupt = reply(b'o');
        let last = corrupt.len() - 1;
        corrupt[last] ^= 0xFF;
        mock.inject(corrupt);

        let err = second.wait(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, DevSrvError::ChecksumError(_)));
    }

    #[tokio::test]
    async fn test_start_is_idempotent_and_restartable() {
        let (mock, channel) = setup().await;
        channel.start();
        channel.start();
        assert!(channel.is_running());

        channel.stop(StopReason::Cancelled);
        assert!(!channel.is_running());

        // Any later operation restarts it
        let pending = channel.register(tagged(b'r'), false);
        assert!(channel.is_running());
        mock.inject(reply(b'r'));
        assert_eq!(pending.wait(Duration::from_secs(1)).await.unwrap(), reply(b'r'));
    }

    #[tokio::test]
    async fn test_frames_split_across_reads() {
        let (mock, channel) = setup().await;
        let pending = channel.register(tagged(b's'), false);
        let frame = reply(b's');
        mock.inject(frame[..2].to_vec());
        tokio::time::sleep(Duration::from_millis(30)).await;
        mock.inject(frame[2..].to_vec());
        assert_eq!(pending.wait(Duration::from_secs(1)).await.unwrap(), frame);
    }
}
