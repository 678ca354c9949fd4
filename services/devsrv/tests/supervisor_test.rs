//! Device supervisor integration tests
//!
//! Every connection attempt gets a fresh scripted transport from a custom
//! factory, so the tests can watch reconnects, disconnects and the write
//! pattern the supervisor produces.

#![allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use devsrv::core::config::DeviceDescriptor;
use devsrv::core::framing::stx_etx::{ACK, STX};
use devsrv::core::framing::{Framer, StxEtxFramer};
use devsrv::core::transport::mock::WriteEvent;
use devsrv::core::transport::{MockTransport, Transport, TransportFactory};
use devsrv::device::{DeviceCommand, DeviceEvent, DeviceRegistry, NULL_DRIVER, STX_DISPENSER};
use devsrv::runtime::{DeviceService, DeviceSupervisor, SupervisorHandle, SupervisorState};
use devsrv::status::{ErrorPolicy, Health, MessageCatalog, PolicyTable, StatusPipeline, StatusStore};

const WAIT: Duration = Duration::from_secs(3);

type Setup = Arc<dyn Fn(&MockTransport) + Send + Sync>;

/// Factory handing out a new mock per attempt and remembering each one
struct Bench {
    transports: Arc<Mutex<Vec<Arc<MockTransport>>>>,
    pipeline: Arc<StatusPipeline>,
    shutdown: CancellationToken,
    _events: mpsc::Receiver<DeviceEvent>,
    handle: SupervisorHandle,
    task: tokio::task::JoinHandle<()>,
}

impl Bench {
    fn start(descriptor: DeviceDescriptor, setup: Setup) -> Self {
        Self::start_with_policies(descriptor, setup, PolicyTable::default())
    }

    fn start_with_policies(descriptor: DeviceDescriptor, setup: Setup, policies: PolicyTable) -> Self {
        let transports: Arc<Mutex<Vec<Arc<MockTransport>>>> = Arc::new(Mutex::new(Vec::new()));
        let created = Arc::clone(&transports);
        let factory = TransportFactory::custom(move |descriptor| {
            let transport = Arc::new(MockTransport::new(descriptor.name.clone()));
            setup(&transport);
            created.lock().push(Arc::clone(&transport));
            Ok(transport as Arc<dyn Transport>)
        });

        let pipeline = Arc::new(StatusPipeline::new(
            Arc::new(StatusStore::new()),
            policies,
            MessageCatalog::new(HashMap::new()),
        ));
        let (events_tx, events_rx) = mpsc::channel(16);
        let shutdown = CancellationToken::new();
        let supervisor = DeviceSupervisor::new(
            descriptor,
            factory,
            DeviceRegistry::with_builtin(),
            Arc::clone(&pipeline),
            events_tx,
        );
        let (handle, task) = supervisor.spawn(&shutdown);

        Self {
            transports,
            pipeline,
            shutdown,
            _events: events_rx,
            handle,
            task,
        }
    }

    fn transport(&self, index: usize) -> Arc<MockTransport> {
        Arc::clone(&self.transports.lock()[index])
    }

    fn attempts(&self) -> usize {
        self.transports.lock().len()
    }

    async fn wait_for_attempts(&self, count: usize) {
        tokio::time::timeout(WAIT, async {
            while self.attempts() < count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    async fn stop(self) {
        self.shutdown.cancel();
        tokio::time::timeout(WAIT, self.task).await.unwrap().unwrap();
    }
}

fn descriptor(name: &str, driver: &str) -> DeviceDescriptor {
    DeviceDescriptor {
        name: name.to_string(),
        model: "TEST".to_string(),
        driver: driver.to_string(),
        polling_interval_ms: 100,
        command_timeout_ms: 1000,
        ..DeviceDescriptor::default()
    }
}

fn no_setup() -> Setup {
    Arc::new(|_: &MockTransport| {})
}

/// Simulated dispenser: ACK then an `O` response to every command frame
fn dispenser_setup(write_delay: Duration) -> Setup {
    Arc::new(move |transport: &MockTransport| {
        transport.set_write_delay(write_delay);
        transport.set_responder(|written: &[u8]| {
            if written.first() != Some(&STX) {
                return Vec::new();
            }
            let device = StxEtxFramer::dispenser_device();
            let response = match written.get(3) {
                Some(b'S') => device.make_frame(&[b'O', 0]).unwrap(),
                Some(b'V') => device.make_frame(b"O2.10").unwrap(),
                _ => device.make_frame(b"O").unwrap(),
            };
            vec![vec![ACK], response]
        });
    })
}

#[tokio::test]
async fn test_online_device_executes_commands() {
    let bench = Bench::start(descriptor("light", NULL_DRIVER), no_setup());
    assert!(bench.handle.wait_for_state(SupervisorState::Online, WAIT).await);

    let snapshot = bench.pipeline.store().get("light").unwrap();
    assert_eq!(snapshot.health, Health::Online);
    assert!(snapshot.alerts.is_empty());

    let result = bench.handle.execute(DeviceCommand::new("blink")).await.unwrap();
    assert!(result.success);
    assert_eq!(bench.handle.stats().commands, 1);
    assert_eq!(bench.handle.stats().connects, 1);

    bench.stop().await;
}

#[tokio::test]
async fn test_connect_failure_published_once() {
    let failing: Setup = Arc::new(|transport: &MockTransport| transport.set_fail_open(true));
    let bench = Bench::start(descriptor("printer", NULL_DRIVER), failing);

    bench.wait_for_attempts(4).await;
    assert!(bench.handle.stats().failed_connects >= 3);

    let snapshot = bench.pipeline.store().get("printer").unwrap();
    assert_eq!(snapshot.health, Health::Offline);
    let codes: Vec<&str> = snapshot.alerts.iter().map(|a| a.code.as_str()).collect();
    assert_eq!(codes, vec!["DEVICE.PRINTER.CONNECT.OPEN_FAILED"]);
    assert_eq!(bench.pipeline.store().mutation_count(), 1);

    // Commands are answered, not queued, while the device is down
    let result = bench.handle.execute(DeviceCommand::new("PRINT")).await.unwrap();
    assert!(!result.success);
    assert!(result.retryable);
    assert_eq!(
        result.error_code.map(|c| c.to_string()),
        Some("DEVICE.PRINTER.CONNECT.OFFLINE".to_string())
    );

    bench.stop().await;
}

#[tokio::test]
async fn test_concurrent_commands_never_interleave_writes() {
    let bench = Bench::start(
        descriptor("cash-1", STX_DISPENSER),
        dispenser_setup(Duration::from_millis(5)),
    );
    assert!(bench.handle.wait_for_state(SupervisorState::Online, WAIT).await);

    let commands = vec![
        DeviceCommand::new("SENSOR"),
        DeviceCommand::new("DISPENSE").with_args(serde_json::json!({"cassette": 1, "count": 2})),
        DeviceCommand::new("VERSION"),
        DeviceCommand::new("PURGE"),
        DeviceCommand::new("SENSOR"),
    ];
    let calls = commands.into_iter().map(|command| {
        let handle = bench.handle.clone();
        async move { handle.execute(command).await }
    });
    let results = futures::future::join_all(calls).await;

    for result in results {
        assert!(result.unwrap().success);
    }
    assert_eq!(bench.transport(0).max_concurrent_writes(), 1);
    assert_eq!(bench.attempts(), 1);

    bench.stop().await;
}

#[tokio::test]
async fn test_polls_and_commands_never_interleave() {
    let bench = Bench::start(
        descriptor("cash-1", STX_DISPENSER),
        dispenser_setup(Duration::from_millis(10)),
    );
    assert!(bench.handle.wait_for_state(SupervisorState::Online, WAIT).await);

    // Keep commands queued across at least one poll tick
    let deadline = tokio::time::Instant::now() + Duration::from_millis(2300);
    while tokio::time::Instant::now() < deadline {
        let calls = ["VERSION", "PURGE", "VERSION"].into_iter().map(|name| {
            let handle = bench.handle.clone();
            async move { handle.execute(DeviceCommand::new(name)).await }
        });
        for result in futures::future::join_all(calls).await {
            assert!(result.unwrap().success);
        }
    }

    let transport = bench.transport(0);
    let written = transport.written();

    // Commands never send SENSOR; one comes from initialization, the rest from polls
    let sensor_frames = written
        .iter()
        .filter(|w| w.first() == Some(&STX) && w.get(3) == Some(&b'S'))
        .count();
    assert!(sensor_frames >= 2, "no poll ran: {sensor_frames} sensor frame(s)");

    // Each operation is its command frame directly followed by its response ACK
    let pairs = written.chunks_exact(2);
    let trailing = pairs.remainder().to_vec();
    for pair in pairs {
        assert_eq!(pair[0].first(), Some(&STX), "write log: {written:02X?}");
        assert_eq!(pair[1], vec![ACK], "write log: {written:02X?}");
    }
    // A poll may still be between its frame and its ACK
    assert!(trailing.iter().all(|w| w.first() == Some(&STX)));

    // Writes never overlap on the wire
    let events = transport.events();
    for pair in events.chunks_exact(2) {
        match pair {
            [WriteEvent::Begin(begin), WriteEvent::End(end)] => assert_eq!(begin, end),
            other => panic!("overlapping writes: {other:?}"),
        }
    }
    assert_eq!(transport.max_concurrent_writes(), 1);
    assert_eq!(bench.attempts(), 1);

    bench.stop().await;
}

#[tokio::test]
async fn test_offline_rejection_follows_connect_policy() {
    let mut overrides = HashMap::new();
    overrides.insert(
        "connect".to_string(),
        ErrorPolicy {
            notify: true,
            retryable: false,
            set_offline: true,
            severity_override: None,
        },
    );
    let failing: Setup = Arc::new(|transport: &MockTransport| transport.set_fail_open(true));
    let bench = Bench::start_with_policies(
        descriptor("printer", NULL_DRIVER),
        failing,
        PolicyTable::with_overrides(&overrides).unwrap(),
    );
    bench.wait_for_attempts(2).await;

    let result = bench.handle.execute(DeviceCommand::new("PRINT")).await.unwrap();
    assert!(!result.success);
    assert!(!result.retryable);

    bench.stop().await;
}

#[tokio::test]
async fn test_restart_reconnects_on_fresh_transport() {
    let bench = Bench::start(descriptor("light", NULL_DRIVER), no_setup());
    assert!(bench.handle.wait_for_state(SupervisorState::Online, WAIT).await);

    let result = bench.handle.execute(DeviceCommand::restart()).await.unwrap();
    assert!(result.success);

    bench.wait_for_attempts(2).await;
    assert!(bench.handle.wait_for_state(SupervisorState::Online, WAIT).await);
    assert!(!bench.transport(0).is_open());
    assert!(bench.transport(1).is_open());
    assert_eq!(bench.handle.stats().connects, 2);

    bench.stop().await;
}

#[tokio::test]
async fn test_disconnect_triggers_reconnect() {
    let bench = Bench::start(descriptor("light", NULL_DRIVER), no_setup());
    assert!(bench.handle.wait_for_state(SupervisorState::Online, WAIT).await);

    bench.transport(0).simulate_disconnect();

    bench.wait_for_attempts(2).await;
    assert!(bench.handle.wait_for_state(SupervisorState::Online, WAIT).await);
    assert_eq!(
        bench.handle.stats().last_error.as_deref(),
        Some("transport disconnected")
    );

    // The outage alert is cleared once the device is back
    let snapshot = bench.pipeline.store().get("light").unwrap();
    assert_eq!(snapshot.health, Health::Online);
    assert!(snapshot.alerts.is_empty());

    bench.stop().await;
}

#[tokio::test]
async fn test_stop_closes_transport() {
    let bench = Bench::start(descriptor("light", NULL_DRIVER), no_setup());
    assert!(bench.handle.wait_for_state(SupervisorState::Online, WAIT).await);

    let handle = bench.handle.clone();
    let transport = bench.transport(0);
    bench.stop().await;

    assert_eq!(handle.state(), SupervisorState::Stopped);
    assert!(!transport.is_open());
    assert!(handle.execute(DeviceCommand::new("blink")).await.is_err());
}

#[tokio::test]
async fn test_service_routes_by_device_name() {
    let pipeline = Arc::new(StatusPipeline::new(
        Arc::new(StatusStore::new()),
        PolicyTable::default(),
        MessageCatalog::new(HashMap::new()),
    ));
    let factory = TransportFactory::custom(|descriptor| {
        Ok(Arc::new(MockTransport::new(descriptor.name.clone())) as Arc<dyn Transport>)
    });
    let (events_tx, _events_rx) = mpsc::channel(16);
    let shutdown = CancellationToken::new();

    let service = DeviceService::start(
        vec![descriptor("b-light", NULL_DRIVER), descriptor("a-light", NULL_DRIVER)],
        factory,
        DeviceRegistry::with_builtin(),
        pipeline,
        events_tx,
        &shutdown,
    )
    .unwrap();
    assert_eq!(service.devices(), vec!["a-light", "b-light"]);

    let handle = service.handle("a-light").unwrap();
    assert!(handle.wait_for_state(SupervisorState::Online, WAIT).await);
    assert!(service
        .execute("a-light", DeviceCommand::new("blink"))
        .await
        .unwrap()
        .success);
    assert!(service.execute("missing", DeviceCommand::new("blink")).await.is_err());

    service.stop(WAIT).await;
}
