//! End-to-end tests driving the engine against an in-process server.

use edgelink_engine::{
    DeviceId, EngineConfig, EnqueueOutcome, Engine, EngineError, HostHandler, HttpTransport,
    ItemKind, LoopbackClient, LoopbackServer, Priority, Queue, QueueConfig, QueueItem, QueueState,
    ServerSettings, Transport,
};
use edgelink_engine::{ConfigId, EngineResult};
use edgelink_protocol::{
    CborCodec, CommandStatus, CommandStatusEcho, DeviceIdentity, ElementBody, ElementKind,
    Envelope, ServerCommand, StatusCode, StatusRecord,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

type Script = Box<dyn Fn(&str, &Envelope) -> Result<Vec<StatusRecord>, String> + Send>;

struct ServerState {
    received: Vec<(String, Envelope)>,
    script: Script,
}

/// Decodes every request, records it, and answers with whatever the
/// script returns.
#[derive(Clone)]
struct TestServer {
    state: Arc<Mutex<ServerState>>,
}

impl TestServer {
    fn new<F>(script: F) -> Self
    where
        F: Fn(&str, &Envelope) -> Result<Vec<StatusRecord>, String> + Send + 'static,
    {
        Self {
            state: Arc::new(Mutex::new(ServerState {
                received: Vec::new(),
                script: Box::new(script),
            })),
        }
    }

    fn always_success() -> Self {
        Self::new(|_, _| Ok(vec![StatusRecord::global(StatusCode::Success)]))
    }

    fn received(&self) -> Vec<(String, Envelope)> {
        self.state.lock().unwrap().received.clone()
    }
}

impl LoopbackServer for TestServer {
    fn handle_post(&self, url: &str, body: &[u8]) -> Result<Vec<u8>, String> {
        let codec = CborCodec::new();
        let envelope = codec.decode_envelope(body).map_err(|e| e.to_string())?;
        let mut state = self.state.lock().unwrap();
        state.received.push((url.to_string(), envelope.clone()));
        let statuses = (state.script)(url, &envelope)?;
        codec.encode_statuses(&statuses).map_err(|e| e.to_string())
    }
}

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<String>>,
}

impl Recorder {
    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn count(&self, prefix: &str) -> usize {
        self.events().iter().filter(|e| e.starts_with(prefix)).count()
    }

    fn push(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }
}

impl HostHandler for Recorder {
    fn on_comm_error(&self, url: &str, _error: &EngineError) {
        self.push(format!("comm_error {url}"));
    }

    fn on_device_registered(&self, device: DeviceId, config: ConfigId) {
        self.push(format!("registered {device} {config}"));
    }

    fn on_queue_state(&self, state: QueueState) {
        self.push(format!("queue {state:?}"));
    }

    fn on_ping_rate_update(&self, config: ConfigId, interval: Duration) {
        self.push(format!("ping_rate {config} {}", interval.as_secs()));
    }

    fn on_command(&self, device: DeviceId, name: &str, _parameters: &[(String, String)]) -> CommandStatus {
        self.push(format!("command {device} {name}"));
        CommandStatus::Success
    }
}

type TestEngine = Engine<HttpTransport<LoopbackClient<TestServer>>>;

fn engine_with(server: &TestServer, config: EngineConfig, host: &Arc<Recorder>) -> TestEngine {
    let host: Arc<dyn HostHandler> = host.clone();
    Engine::with_host(
        config,
        HttpTransport::new(LoopbackClient::new(server.clone())),
        host,
    )
}

/// Runs one cycle and delivers every resulting transport event.
fn pump(engine: &mut TestEngine, now: Instant) -> EngineResult<()> {
    engine.run_cycle(now);
    let events = engine
        .transport_mut()
        .wait_for_events(Duration::from_secs(5))?;
    engine.handle_events(events, now);
    Ok(())
}

fn kinds(envelope: &Envelope) -> Vec<ElementKind> {
    envelope.elements.iter().map(|e| e.kind()).collect()
}

fn exact_queue(budget: usize) -> Queue {
    Queue::new(
        QueueConfig::new(budget)
            .with_item_overhead(0)
            .with_waste_ratio(1.0),
    )
}

#[test]
fn scenario_a_priority_drain_order() {
    let queue = exact_queue(10_000);
    for (priority, tag) in [(Priority::LOW, 1u8), (Priority::HIGH, 2), (Priority::NORMAL, 3)] {
        let item = QueueItem::new(ItemKind::Data, DeviceId::MASTER, vec![tag; 8]).with_priority(priority);
        assert_eq!(queue.enqueue(item), EnqueueOutcome::Queued);
    }

    let mut drain = queue.open_drain();
    let mut order = Vec::new();
    while let Some(item) = drain.fetch_next() {
        order.push(item.priority());
    }
    assert_eq!(order, vec![Priority::HIGH, Priority::NORMAL, Priority::LOW]);
}

#[test]
fn scenario_b_lower_priority_rejected_when_full() {
    let queue = exact_queue(200);
    let normal = |tag| QueueItem::new(ItemKind::Data, DeviceId::MASTER, vec![tag; 100]);
    assert_eq!(queue.enqueue(normal(1)), EnqueueOutcome::Queued);
    assert_eq!(queue.enqueue(normal(2)), EnqueueOutcome::Queued);
    assert_eq!(
        queue.enqueue(normal(3).with_priority(Priority::LOW)),
        EnqueueOutcome::Rejected
    );

    let mut drain = queue.open_drain();
    let mut tags = Vec::new();
    while let Some(item) = drain.fetch_next() {
        tags.push(item.content()[0]);
    }
    assert_eq!(tags, vec![1, 2]);
}

#[test]
fn scenario_c_registration_then_online_notice() {
    let server = TestServer::always_success();
    let host = Arc::new(Recorder::default());
    let mut engine = engine_with(&server, EngineConfig::new(), &host);
    engine.add_device("gateway", "GW-1").unwrap();
    let primary = engine
        .initialize_configuration(&ServerSettings::primary("drm.example.com").with_owner("acme"))
        .unwrap();
    let t0 = Instant::now();

    pump(&mut engine, t0).unwrap();

    let received = server.received();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].0, "http://drm.example.com/eMessage");
    assert_eq!(kinds(&received[0].1), vec![ElementKind::Registration]);
    assert!(matches!(
        &received[0].1.elements[0].body,
        ElementBody::Registration { owner, ping_rate_secs: 60, .. } if owner == "acme"
    ));

    let binding = engine.binding(primary, DeviceId::MASTER).unwrap();
    assert!(binding.is_registered());
    assert!(binding.online_notice_pending());
    assert_eq!(host.count("registered"), 1);

    pump(&mut engine, t0 + Duration::from_secs(1)).unwrap();

    let received = server.received();
    assert_eq!(received.len(), 2);
    assert_eq!(kinds(&received[1].1), vec![ElementKind::OnlineNotice]);
    assert!(!engine.binding(primary, DeviceId::MASTER).unwrap().online_notice_pending());
}

#[test]
fn scenario_d_failover_to_backup_and_back() {
    let primary_down = Arc::new(AtomicBool::new(true));
    let down = Arc::clone(&primary_down);
    let server = TestServer::new(move |url, _| {
        if url.contains("primary") && down.load(Ordering::SeqCst) {
            Err("connection refused".into())
        } else {
            Ok(vec![StatusRecord::global(StatusCode::Success)])
        }
    });
    let host = Arc::new(Recorder::default());
    let mut engine = engine_with(&server, EngineConfig::new(), &host);
    engine.add_device("gateway", "GW-1").unwrap();
    let primary = engine
        .initialize_configuration(&ServerSettings::primary("primary.example.com"))
        .unwrap();
    let backup = engine
        .initialize_configuration(&ServerSettings::backup("backup.example.com"))
        .unwrap();
    let primary_location = engine.configuration(primary).unwrap().location();
    let t0 = Instant::now();
    let retry = engine.config().retry_period;

    pump(&mut engine, t0).unwrap();
    pump(&mut engine, t0 + retry).unwrap();
    assert!(engine.location(primary_location).unwrap().is_online());
    assert_eq!(engine.binding(backup, DeviceId::MASTER).unwrap().activation_count(), 0);

    pump(&mut engine, t0 + retry * 2).unwrap();
    assert!(!engine.location(primary_location).unwrap().is_online());
    let sibling = engine.binding(backup, DeviceId::MASTER).unwrap();
    assert_eq!(sibling.activation_count(), 1);
    assert!(!sibling.is_registered());
    assert_eq!(host.count("comm_error"), 3);
    assert_eq!(server.received().len(), 3);

    // The armed backup registers while the primary waits out its retry.
    pump(&mut engine, t0 + retry * 2 + Duration::from_secs(1)).unwrap();
    let received = server.received();
    assert_eq!(received.len(), 4);
    assert_eq!(received[3].0, "http://backup.example.com/eMessage");
    assert_eq!(kinds(&received[3].1), vec![ElementKind::Registration]);
    assert!(engine.binding(backup, DeviceId::MASTER).unwrap().is_registered());

    primary_down.store(false, Ordering::SeqCst);
    pump(&mut engine, t0 + retry * 3).unwrap();
    assert!(engine.location(primary_location).unwrap().is_online());
    assert!(engine.binding(primary, DeviceId::MASTER).unwrap().is_registered());
    assert_eq!(engine.binding(backup, DeviceId::MASTER).unwrap().activation_count(), 0);
    assert_eq!(host.count("comm_error"), 3);
}

#[test]
fn offline_location_delivers_held_data_once_server_recovers() {
    let server_down = Arc::new(AtomicBool::new(false));
    let down = Arc::clone(&server_down);
    let server = TestServer::new(move |_, _| {
        if down.load(Ordering::SeqCst) {
            Err("connection refused".into())
        } else {
            Ok(vec![StatusRecord::global(StatusCode::Success)])
        }
    });
    let host = Arc::new(Recorder::default());
    let mut engine = engine_with(&server, EngineConfig::new(), &host);
    engine.add_device("gateway", "GW-1").unwrap();
    let primary = engine
        .initialize_configuration(
            &ServerSettings::primary("drm.example.com").with_ping_interval(Duration::from_secs(600)),
        )
        .unwrap();
    let location = engine.configuration(primary).unwrap().location();
    let retry = engine.config().retry_period;
    let t0 = Instant::now();

    pump(&mut engine, t0).unwrap();
    pump(&mut engine, t0 + Duration::from_secs(1)).unwrap();
    assert!(engine.binding(primary, DeviceId::MASTER).unwrap().is_registered());
    assert_eq!(server.received().len(), 2);

    server_down.store(true, Ordering::SeqCst);
    engine
        .post_item(QueueItem::new(ItemKind::Data, DeviceId::MASTER, vec![0xAB; 32]))
        .unwrap();
    let t1 = t0 + Duration::from_secs(2);
    for n in 0..3 {
        pump(&mut engine, t1 + retry * n).unwrap();
    }
    assert!(!engine.location(location).unwrap().is_online());
    assert_eq!(engine.queue().len(), 1);
    assert_eq!(host.count("comm_error"), 3);

    server_down.store(false, Ordering::SeqCst);
    pump(&mut engine, t1 + retry * 3).unwrap();

    assert!(engine.location(location).unwrap().is_online());
    assert!(engine.queue().is_empty());
    assert_eq!(engine.stats().items_purged, 1);
    let received = server.received();
    assert_eq!(received.len(), 6);
    let (url, envelope) = received.last().unwrap();
    assert_eq!(url, "http://drm.example.com/eMessage");
    assert!(envelope
        .elements
        .iter()
        .any(|e| matches!(&e.body, ElementBody::Data(bytes) if bytes == &vec![0xAB; 32])));
}

#[test]
fn scenario_e_maintenance_redirect_and_exit() {
    let server = TestServer::new(|_, envelope| {
        let device = DeviceIdentity::new("gateway", "GW-1");
        let code = match envelope.elements.first().map(|e| &e.body) {
            Some(ElementBody::Registration { owner, .. }) if owner == "night-shift" => StatusCode::Success,
            Some(ElementBody::Registration { .. }) => StatusCode::EnterMaintenanceMode {
                url: None,
                ping_rate_secs: 300,
            },
            Some(ElementBody::MaintenancePing) => StatusCode::ExitMaintenanceMode {
                url: None,
                owner: Some("night-shift".into()),
            },
            _ => StatusCode::Success,
        };
        Ok(vec![StatusRecord::device(device, code)])
    });
    let host = Arc::new(Recorder::default());
    let mut engine = engine_with(&server, EngineConfig::new(), &host);
    engine.add_device("gateway", "GW-1").unwrap();
    let primary = engine
        .initialize_configuration(&ServerSettings::primary("drm.example.com:8080").with_owner("acme"))
        .unwrap();
    let t0 = Instant::now();

    pump(&mut engine, t0).unwrap();

    let binding = engine.binding(primary, DeviceId::MASTER).unwrap();
    assert!(binding.in_maintenance());
    assert!(!binding.is_registered());
    assert_eq!(binding.maintenance_ping_interval(), Duration::from_secs(300));
    let maintenance = binding.location_override().unwrap();
    assert_eq!(
        engine.location(maintenance).unwrap().url(),
        "http://drm.example.com:8080/eMessage/maintenance"
    );

    let t1 = t0 + Duration::from_secs(1);
    pump(&mut engine, t1).unwrap();

    let received = server.received();
    assert_eq!(received[1].0, "http://drm.example.com:8080/eMessage/maintenance");
    assert_eq!(kinds(&received[1].1), vec![ElementKind::MaintenancePing]);
    let binding = engine.binding(primary, DeviceId::MASTER).unwrap();
    assert!(!binding.in_maintenance());
    assert_eq!(binding.location_override(), None);
    assert_eq!(binding.owner_override(), Some("night-shift"));
    assert_eq!(binding.retry_at(), Some(t1 + engine.config().retry_period));

    pump(&mut engine, t1 + Duration::from_secs(2)).unwrap();
    assert_eq!(server.received().len(), 2);

    let retry = engine.config().retry_period;
    pump(&mut engine, t1 + retry).unwrap();
    let received = server.received();
    assert_eq!(received.len(), 3);
    assert_eq!(received[2].0, "http://drm.example.com:8080/eMessage");
    assert!(matches!(
        &received[2].1.elements[0].body,
        ElementBody::Registration { owner, master_owner, .. }
            if owner == "night-shift" && master_owner == "night-shift"
    ));
    assert!(engine.binding(primary, DeviceId::MASTER).unwrap().is_registered());
}

#[test]
fn server_command_round_trip() {
    let server = TestServer::new(|_, envelope| {
        let mut statuses = vec![StatusRecord::global(StatusCode::Success)];
        if envelope.message_id == 1 {
            statuses.push(StatusRecord::global(StatusCode::Command(ServerCommand::Custom {
                command_id: "cmd-7".into(),
                name: "open_valve".into(),
                parameters: vec![("position".into(), "50".into())],
            })));
        }
        Ok(statuses)
    });
    let host = Arc::new(Recorder::default());
    let mut engine = engine_with(&server, EngineConfig::new(), &host);
    engine.add_device("gateway", "GW-1").unwrap();
    engine
        .initialize_configuration(&ServerSettings::primary("drm.example.com"))
        .unwrap();
    let t0 = Instant::now();

    pump(&mut engine, t0).unwrap();
    assert_eq!(host.count("command #0 open_valve"), 1);
    assert_eq!(engine.queue().len(), 1);

    pump(&mut engine, t0 + Duration::from_secs(1)).unwrap();

    let received = server.received();
    let echo = received[1]
        .1
        .elements
        .iter()
        .find_map(|e| match &e.body {
            ElementBody::Data(bytes) => Some(CommandStatusEcho::decode(bytes).unwrap()),
            _ => None,
        })
        .unwrap();
    assert_eq!(echo.command_id, "cmd-7");
    assert_eq!(echo.status, CommandStatus::Success);
    assert!(engine.queue().is_empty());
    assert_eq!(
        host.events().iter().filter(|e| e.starts_with("queue")).cloned().collect::<Vec<_>>(),
        vec!["queue NonEmpty".to_string(), "queue Empty".to_string()]
    );
}

#[test]
fn drive_loop_delivers_items_from_producer_thread() {
    let server = TestServer::always_success();
    let host = Arc::new(Recorder::default());
    let config = EngineConfig::new().with_cycle_interval(Duration::from_millis(10));
    let mut engine = engine_with(&server, config, &host);
    engine.add_device("gateway", "GW-1").unwrap();
    engine
        .initialize_configuration(&ServerSettings::primary("drm.example.com"))
        .unwrap();

    let queue = Arc::clone(engine.queue());
    let producer = std::thread::spawn(move || {
        for tag in 0..5u8 {
            queue.enqueue(QueueItem::new(ItemKind::Event, DeviceId::MASTER, vec![tag; 16]));
        }
    });
    producer.join().unwrap();

    let started = Instant::now();
    engine.run(Some(started + Duration::from_millis(300)));
    assert!(started.elapsed() >= Duration::from_millis(300));

    assert!(engine.queue().is_empty());
    let stats = engine.stats();
    assert_eq!(stats.items_purged, 5);
    assert_eq!(stats.requests_failed, 0);
    let delivered: usize = server
        .received()
        .iter()
        .map(|(_, env)| kinds(env).iter().filter(|k| **k == ElementKind::Data).count())
        .sum();
    assert_eq!(delivered, 5);
}
