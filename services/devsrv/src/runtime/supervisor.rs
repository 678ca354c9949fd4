//! Device supervisor
//!
//! One task per device drives the connection lifecycle:
//!
//! ```text
//! Connecting -> Online -> (fault | reconnect request | disconnect)
//!     -> teardown -> Backoff -> Connecting
//! ```
//!
//! The outer loop only ends when the supervisor is stopped. While online the
//! task selects over {poll tick, command request, command completion,
//! disconnect, shutdown}. Polls and commands share one exclusive gate so
//! they never interleave writes on the transport.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch, Mutex as AsyncMutex};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core::config::DeviceDescriptor;
use crate::core::transport::{Transport, TransportFactory};
use crate::device::{CommandResult, Device, DeviceCommand, DeviceContext, DeviceEvent, DeviceRegistry};
use crate::error::{DevSrvError, Result};
use crate::status::{
    AlertScope, ErrorCategory, ErrorCode, Health, Severity, StatusEvent, StatusPipeline,
    StatusSnapshot,
};

/// Lower bound of the wait between connection attempts
pub const MIN_RETRY_DELAY: Duration = Duration::from_millis(100);
/// Lower bound of the status poll period
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1000);

const REQUEST_QUEUE: usize = 32;
const DISPOSE_TIMEOUT: Duration = Duration::from_secs(2);

pub const OPEN_FAILED: &str = "OPEN_FAILED";
pub const INIT_FAILED: &str = "INIT_FAILED";
pub const DISCONNECTED: &str = "DISCONNECTED";
pub const POLL_FAILED: &str = "POLL_FAILED";
pub const OFFLINE: &str = "OFFLINE";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SupervisorState {
    Connecting,
    Online,
    Backoff,
    Stopped,
}

/// Connection statistics of one supervisor
#[derive(Debug, Clone, Default, Serialize)]
pub struct SupervisorStats {
    pub attempts: u64,
    pub connects: u64,
    pub failed_connects: u64,
    pub commands: u64,
    pub last_connected: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

type Reply = oneshot::Sender<Result<CommandResult>>;

enum Request {
    Execute { command: DeviceCommand, reply: Reply },
    Reconnect,
}

/// Cloneable control surface of a running supervisor
#[derive(Clone)]
pub struct SupervisorHandle {
    name: String,
    requests: mpsc::Sender<Request>,
    state: watch::Receiver<SupervisorState>,
    stats: Arc<Mutex<SupervisorStats>>,
    shutdown: CancellationToken,
}

impl SupervisorHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run a command on the device
    ///
    /// Failures come back as a failed `CommandResult`; only cancellation is
    /// an error.
    pub async fn execute(&self, command: DeviceCommand) -> Result<CommandResult> {
        let (reply, rx) = oneshot::channel();
        self.requests
            .send(Request::Execute { command, reply })
            .await
            .map_err(|_| DevSrvError::cancelled(format!("{}: supervisor stopped", self.name)))?;
        rx.await
            .map_err(|_| DevSrvError::cancelled(format!("{}: command abandoned", self.name)))?
    }

    /// End the current connection attempt; false if the request queue is full
    pub fn request_reconnect(&self) -> bool {
        self.requests.try_send(Request::Reconnect).is_ok()
    }

    pub fn state(&self) -> SupervisorState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SupervisorState> {
        self.state.clone()
    }

    /// Wait until the supervisor reaches `target`; false on timeout
    pub async fn wait_for_state(&self, target: SupervisorState, timeout: Duration) -> bool {
        let mut state = self.state.clone();
        let reached = async move {
            loop {
                if *state.borrow_and_update() == target {
                    return true;
                }
                if state.changed().await.is_err() {
                    return *state.borrow() == target;
                }
            }
        };
        tokio::time::timeout(timeout, reached).await.unwrap_or(false)
    }

    pub fn stats(&self) -> SupervisorStats {
        self.stats.lock().clone()
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for SupervisorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SupervisorHandle")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

/// Shutdown, attempt end, disconnect and deadline around one operation
#[derive(Clone)]
struct OpGuard {
    name: String,
    shutdown: CancellationToken,
    attempt: CancellationToken,
    disconnected: CancellationToken,
    timeout: Duration,
}

impl OpGuard {
    async fn run<T>(&self, op: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::select! {
            _ = self.attempt.cancelled() => Err(DevSrvError::cancelled(format!(
                "{}: connection attempt ended",
                self.name
            ))),
            _ = self.disconnected.cancelled() => Err(DevSrvError::connection(format!(
                "{}: transport disconnected",
                self.name
            ))),
            result = tokio::time::timeout(self.timeout, op) => match result {
                Ok(result) => result,
                Err(_) => Err(DevSrvError::timeout(format!(
                    "{}: no result within {:?}",
                    self.name, self.timeout
                ))),
            },
        }
    }

    fn stopping(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

/// One live connection attempt
struct Session {
    transport: Arc<dyn Transport>,
    device: Arc<dyn Device>,
    gate: Arc<AsyncMutex<()>>,
    guard: OpGuard,
    initial: StatusSnapshot,
}

enum ConnectError {
    Cancelled,
    Failed {
        detail: &'static str,
        message: String,
        status: Option<StatusSnapshot>,
    },
}

impl ConnectError {
    fn failed(detail: &'static str, message: impl Into<String>) -> Self {
        ConnectError::Failed {
            detail,
            message: message.into(),
            status: None,
        }
    }
}

enum SessionEnd {
    Shutdown,
    Reconnect,
    Fault { detail: &'static str, message: String },
}

type CommandOutcome = (Reply, DeviceCommand, Result<CommandResult>);

pub struct DeviceSupervisor {
    descriptor: DeviceDescriptor,
    device_key: String,
    transports: TransportFactory,
    registry: DeviceRegistry,
    pipeline: Arc<StatusPipeline>,
    events: mpsc::Sender<DeviceEvent>,
    stats: Arc<Mutex<SupervisorStats>>,
}

impl DeviceSupervisor {
    pub fn new(
        descriptor: DeviceDescriptor,
        transports: TransportFactory,
        registry: DeviceRegistry,
        pipeline: Arc<StatusPipeline>,
        events: mpsc::Sender<DeviceEvent>,
    ) -> Self {
        Self {
            device_key: descriptor.device_key(),
            descriptor,
            transports,
            registry,
            pipeline,
            events,
            stats: Arc::new(Mutex::new(SupervisorStats::default())),
        }
    }

    /// Start the supervisor task under a child of `parent`
    pub fn spawn(self, parent: &CancellationToken) -> (SupervisorHandle, JoinHandle<()>) {
        let shutdown = parent.child_token();
        let (requests_tx, requests_rx) = mpsc::channel(REQUEST_QUEUE);
        let (state_tx, state_rx) = watch::channel(SupervisorState::Connecting);

        let handle = SupervisorHandle {
            name: self.descriptor.name.clone(),
            requests: requests_tx,
            state: state_rx,
            stats: Arc::clone(&self.stats),
            shutdown: shutdown.clone(),
        };
        let task = tokio::spawn(self.run(requests_rx, state_tx, shutdown));
        (handle, task)
    }

    fn name(&self) -> &str {
        &self.descriptor.name
    }

    fn retry_delay(&self) -> Duration {
        self.descriptor.polling_interval().max(MIN_RETRY_DELAY)
    }

    fn poll_interval(&self) -> Duration {
        self.descriptor.polling_interval().max(MIN_POLL_INTERVAL)
    }

    async fn run(
        self,
        mut requests: mpsc::Receiver<Request>,
        state: watch::Sender<SupervisorState>,
        shutdown: CancellationToken,
    ) {
        info!(
            "[{}] Supervisor started: {} over {} {}",
            self.name(),
            self.descriptor.driver,
            self.descriptor.transport,
            self.descriptor.port
        );
        let mut last_failure: Option<String> = None;

        loop {
            state.send_replace(SupervisorState::Connecting);

            let attempt = {
                let connect = self.connect(&shutdown);
                tokio::pin!(connect);
                loop {
                    tokio::select! {
                        result = &mut connect => break result,
                        Some(request) = requests.recv() => self.reject_offline(request),
                    }
                }
            };

            match attempt {
                Err(ConnectError::Cancelled) => break,
                Err(ConnectError::Failed {
                    detail,
                    message,
                    status,
                }) => {
                    {
                        let mut stats = self.stats.lock();
                        stats.failed_connects += 1;
                        stats.last_error = Some(message.clone());
                    }
                    let key = format!("{detail}:{message}");
                    if last_failure.as_deref() == Some(key.as_str()) {
                        debug!("[{}] Connect failed again: {}", self.name(), message);
                    } else {
                        warn!("[{}] Connect failed ({}): {}", self.name(), detail, message);
                        if let Some(status) = status {
                            self.pipeline.publish(status.with_health(Health::Offline));
                        }
                        self.publish_offline(Some((detail, message.as_str())));
                        last_failure = Some(key);
                    }
                },
                Ok(session) => {
                    last_failure = None;
                    match self.serve(session, &mut requests, &state).await {
                        SessionEnd::Shutdown => break,
                        SessionEnd::Reconnect => self.publish_offline(None),
                        SessionEnd::Fault { detail, message } => {
                            warn!("[{}] Connection lost ({}): {}", self.name(), detail, message);
                            self.stats.lock().last_error = Some(message.clone());
                            self.publish_offline(Some((detail, message.as_str())));
                        },
                    }
                },
            }

            state.send_replace(SupervisorState::Backoff);
            if !self.backoff(&mut requests, &shutdown).await {
                break;
            }
        }

        state.send_replace(SupervisorState::Stopped);
        info!("[{}] Supervisor stopped", self.name());
    }

    /// Create transport and device, open, initialize
    async fn connect(&self, shutdown: &CancellationToken) -> std::result::Result<Session, ConnectError> {
        self.stats.lock().attempts += 1;
        debug!("[{}] Connecting", self.name());

        let transport = self
            .transports
            .create(&self.descriptor)
            .map_err(|e| ConnectError::failed(OPEN_FAILED, e.to_string()))?;
        let guard = OpGuard {
            name: self.descriptor.name.clone(),
            shutdown: shutdown.clone(),
            attempt: shutdown.child_token(),
            disconnected: transport.disconnected(),
            timeout: self.descriptor.command_timeout(),
        };

        let opened = guard
            .run(async { transport.open().await.map_err(DevSrvError::from) })
            .await;
        if let Err(e) = opened {
            close_transport(self.name(), transport.as_ref()).await;
            if guard.stopping() {
                return Err(ConnectError::Cancelled);
            }
            return Err(ConnectError::failed(OPEN_FAILED, e.to_string()));
        }
        debug!(
            "[{}] {} transport open",
            self.name(),
            transport.transport_type()
        );

        let device = match self.registry.create(DeviceContext {
            descriptor: self.descriptor.clone(),
            transport: Arc::clone(&transport),
            events: self.events.clone(),
        }) {
            Ok(device) => device,
            Err(e) => {
                close_transport(self.name(), transport.as_ref()).await;
                return Err(ConnectError::failed(INIT_FAILED, e.to_string()));
            },
        };

        let initialized = guard.run(device.initialize()).await;
        let failure = match initialized {
            Ok(snapshot) if !snapshot.has_error_alerts() => {
                return Ok(Session {
                    transport,
                    device,
                    gate: Arc::new(AsyncMutex::new(())),
                    guard,
                    initial: snapshot,
                });
            },
            Ok(snapshot) => {
                let message = snapshot
                    .alerts
                    .iter()
                    .filter(|a| a.severity.is_error())
                    .map(|a| a.message.as_str())
                    .collect::<Vec<_>>()
                    .join("; ");
                ConnectError::Failed {
                    detail: INIT_FAILED,
                    message,
                    status: Some(snapshot),
                }
            },
            Err(_) if guard.stopping() => ConnectError::Cancelled,
            Err(e) => ConnectError::failed(INIT_FAILED, e.to_string()),
        };

        dispose_device(self.name(), device.as_ref()).await;
        close_transport(self.name(), transport.as_ref()).await;
        Err(failure)
    }

    /// Online loop; always tears the session down before returning
    async fn serve(
        &self,
        session: Session,
        requests: &mut mpsc::Receiver<Request>,
        state: &watch::Sender<SupervisorState>,
    ) -> SessionEnd {
        {
            let mut stats = self.stats.lock();
            stats.connects += 1;
            stats.last_connected = Some(Utc::now());
        }
        info!("[{}] Online", self.name());
        self.pipeline.publish(StatusSnapshot::online(
            &self.descriptor.name,
            &self.descriptor.model,
            AlertScope::Connection,
        ));
        self.pipeline.publish(session.initial.clone());
        state.send_replace(SupervisorState::Online);

        let period = self.poll_interval();
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut running: JoinSet<CommandOutcome> = JoinSet::new();

        let end = loop {
            tokio::select! {
                _ = session.guard.shutdown.cancelled() => break SessionEnd::Shutdown,
                _ = session.guard.disconnected.cancelled() => break SessionEnd::Fault {
                    detail: DISCONNECTED,
                    message: "transport disconnected".to_string(),
                },
                _ = ticker.tick() => {
                    if let Some(end) = self.poll(&session).await {
                        break end;
                    }
                },
                Some(request) = requests.recv() => match request {
                    Request::Execute { command, reply } => {
                        self.stats.lock().commands += 1;
                        debug!("[{}] Executing {}", self.name(), command);
                        let device = Arc::clone(&session.device);
                        let gate = Arc::clone(&session.gate);
                        let guard = session.guard.clone();
                        running.spawn(async move {
                            let result = guard
                                .run(async {
                                    let _exclusive = gate.lock().await;
                                    device.execute(&command).await
                                })
                                .await;
                            (reply, command, result)
                        });
                    },
                    Request::Reconnect => {
                        info!("[{}] Reconnect requested", self.name());
                        break SessionEnd::Reconnect;
                    },
                },
                Some(joined) = running.join_next() => {
                    if let Some(end) = self.finish_command(joined, true) {
                        break end;
                    }
                },
            }
        };

        // Fail whatever is still in flight, then release the device
        session.guard.attempt.cancel();
        while let Some(joined) = running.join_next().await {
            self.finish_command(joined, false);
        }
        {
            let _exclusive = session.gate.lock().await;
            dispose_device(self.name(), session.device.as_ref()).await;
        }
        close_transport(self.name(), session.transport.as_ref()).await;
        debug!("[{}] Session torn down", self.name());

        if session.guard.stopping() {
            SessionEnd::Shutdown
        } else {
            end
        }
    }

    async fn poll(&self, session: &Session) -> Option<SessionEnd> {
        let polled = session
            .guard
            .run(async {
                let _exclusive = session.gate.lock().await;
                session.device.status().await
            })
            .await;

        match polled {
            Ok(snapshot) => {
                self.pipeline.publish(snapshot);
                None
            },
            Err(_) if session.guard.stopping() => Some(SessionEnd::Shutdown),
            Err(e) => Some(SessionEnd::Fault {
                detail: POLL_FAILED,
                message: e.to_string(),
            }),
        }
    }

    /// Reply to a finished command; returns how the session must end, if at all
    fn finish_command(
        &self,
        joined: std::result::Result<CommandOutcome, JoinError>,
        publish: bool,
    ) -> Option<SessionEnd> {
        let (reply, command, result) = match joined {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("[{}] Command task failed: {}", self.name(), e);
                return None;
            },
        };

        let mut end = None;
        let outcome = match result {
            Ok(result) => {
                if result.success && command.is_restart() {
                    info!("[{}] Restarted, reconnecting", self.name());
                    end = Some(SessionEnd::Reconnect);
                }
                Ok(result)
            },
            Err(e) if e.is_cancelled() => Err(e),
            Err(e) => {
                warn!("[{}] {} failed: {}", self.name(), command, e);
                end = Some(SessionEnd::Reconnect);
                let detail = if e.is_timeout() { "TIMEOUT" } else { "FAILED" };
                let code = ErrorCode::device(
                    &self.device_key,
                    ErrorCategory::Command,
                    format!("{}_{}", command.name, detail),
                );
                let retryable = e.is_timeout() && self.retryable(&code);
                Ok(CommandResult::failure(format!("{}: {}", command.name, e))
                    .with_error_code(code)
                    .with_retryable(retryable))
            },
        };

        if publish {
            if let Ok(result) = &outcome {
                self.publish_command(result);
            }
        }
        if reply.send(outcome).is_err() {
            debug!("[{}] Caller of {} went away", self.name(), command.name);
        }
        end
    }

    /// Retry hint of the code's category policy
    fn retryable(&self, code: &ErrorCode) -> bool {
        self.pipeline.policy_for(Some(code), Severity::Error).retryable
    }

    /// Success clears earlier command alerts; failures with a code raise one
    fn publish_command(&self, result: &CommandResult) {
        let snapshot = StatusSnapshot::online(
            &self.descriptor.name,
            &self.descriptor.model,
            AlertScope::Command,
        );
        if result.success {
            self.pipeline.publish(snapshot);
        } else if let Some(code) = &result.error_code {
            self.pipeline.publish(snapshot.with_alert(StatusEvent::new(
                code.clone(),
                Severity::Error,
                result.message.clone(),
                AlertScope::Command,
            )));
        }
    }

    fn publish_offline(&self, alert: Option<(&str, &str)>) {
        let snapshot = StatusSnapshot::offline(
            &self.descriptor.name,
            &self.descriptor.model,
            AlertScope::Connection,
        );
        let snapshot = match alert {
            Some((detail, message)) => snapshot.with_alert(StatusEvent::new(
                ErrorCode::device(&self.device_key, ErrorCategory::Connect, detail),
                Severity::Error,
                message,
                AlertScope::Connection,
            )),
            None => snapshot,
        };
        self.pipeline.publish(snapshot);
    }

    fn reject_offline(&self, request: Request) {
        match request {
            Request::Execute { command, reply } => {
                debug!("[{}] {} rejected: offline", self.name(), command);
                let code = ErrorCode::device(&self.device_key, ErrorCategory::Connect, OFFLINE);
                let result = CommandResult::failure(format!("{} is offline", self.name()))
                    .with_retryable(self.retryable(&code))
                    .with_error_code(code);
                let _ = reply.send(Ok(result));
            },
            Request::Reconnect => debug!("[{}] Reconnect request while offline", self.name()),
        }
    }

    /// Wait one retry delay; a reconnect request cuts it short. False on shutdown.
    async fn backoff(&self, requests: &mut mpsc::Receiver<Request>, shutdown: &CancellationToken) -> bool {
        let delay = tokio::time::sleep(self.retry_delay());
        tokio::pin!(delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return false,
                _ = &mut delay => return true,
                Some(request) = requests.recv() => match request {
                    Request::Reconnect => return true,
                    execute => self.reject_offline(execute),
                },
            }
        }
    }
}

async fn dispose_device(name: &str, device: &dyn Device) {
    if tokio::time::timeout(DISPOSE_TIMEOUT, device.dispose())
        .await
        .is_err()
    {
        warn!("[{}] Device dispose timed out", name);
    }
}

async fn close_transport(name: &str, transport: &dyn Transport) {
    if let Err(e) = transport.close().await {
        debug!("[{}] Transport close: {}", name, e);
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    fn guard(timeout: Duration) -> OpGuard {
        let shutdown = CancellationToken::new();
        OpGuard {
            name: "cash-1".to_string(),
            attempt: shutdown.child_token(),
            shutdown,
            disconnected: CancellationToken::new(),
            timeout,
        }
    }

    #[tokio::test]
    async fn test_guard_deadline_and_signals() {
        let g = guard(Duration::from_millis(20));
        let err = g.run(std::future::pending::<Result<()>>()).await.unwrap_err();
        assert!(err.is_timeout());

        let g = guard(Duration::from_secs(5));
        g.disconnected.cancel();
        let err = g.run(std::future::pending::<Result<()>>()).await.unwrap_err();
        assert!(matches!(err, DevSrvError::ConnectionError(_)));

        let g = guard(Duration::from_secs(5));
        g.shutdown.cancel();
        let err = g.run(std::future::pending::<Result<()>>()).await.unwrap_err();
        assert!(err.is_cancelled());
        assert!(g.stopping());

        let g = guard(Duration::from_secs(5));
        assert_eq!(g.run(async { Ok(7) }).await.unwrap(), 7);
    }
}
