//! Simulate command implementation.
//!
//! Drives the engine over the HTTP transport against an in-process server
//! while a producer thread posts telemetry for every enabled device.

use crate::agent::AgentFile;
use edgelink_engine::{
    ConfigId, DeviceId, EnqueueOutcome, Engine, EngineError, HostHandler, HttpTransport, ItemKind,
    LoopbackClient, LoopbackServer, Priority, QueueItem, QueueState,
};
use edgelink_protocol::{CborCodec, ElementKind, StatusCode, StatusRecord};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Tunables for a simulation run.
#[derive(Debug, Clone)]
pub struct SimulateOptions {
    /// Run length in seconds.
    pub seconds: u64,
    /// Telemetry interval per device in milliseconds.
    pub interval_ms: u64,
    /// Telemetry payload size in bytes.
    pub payload_bytes: usize,
    /// Primary outage length in seconds, from the start of the run.
    pub fail_primary_secs: Option<u64>,
}

#[derive(Debug, Default)]
struct ServerLog {
    requests: BTreeMap<String, u64>,
    refused: u64,
    elements: BTreeMap<String, u64>,
    outage: Option<(String, Instant)>,
}

/// In-process server answering every well-formed request with a global
/// success, except at the failing URL during an outage.
#[derive(Clone, Default)]
struct SimulatedServer {
    log: Arc<Mutex<ServerLog>>,
}

impl SimulatedServer {
    fn fail_until(&self, url: &str, until: Instant) {
        self.log.lock().outage = Some((url.to_string(), until));
    }
}

impl LoopbackServer for SimulatedServer {
    fn handle_post(&self, url: &str, body: &[u8]) -> Result<Vec<u8>, String> {
        let codec = CborCodec::new();
        let envelope = codec.decode_envelope(body).map_err(|e| e.to_string())?;
        {
            let mut log = self.log.lock();
            if log
                .outage
                .as_ref()
                .is_some_and(|(failing, until)| failing == url && Instant::now() < *until)
            {
                log.refused += 1;
                return Err("simulated outage".to_string());
            }
            *log.requests.entry(url.to_string()).or_default() += 1;
            for element in &envelope.elements {
                *log.elements.entry(kind_name(element.kind()).to_string()).or_default() += 1;
            }
        }
        debug!(
            "server accepted message {} with {} element(s)",
            envelope.message_id,
            envelope.elements.len()
        );
        codec
            .encode_statuses(&[StatusRecord::global(StatusCode::Success)])
            .map_err(|e| e.to_string())
    }
}

fn kind_name(kind: ElementKind) -> &'static str {
    match kind {
        ElementKind::Registration => "registration",
        ElementKind::Ping => "ping",
        ElementKind::OnlineNotice => "online_notice",
        ElementKind::Data => "data",
        ElementKind::MaintenancePing => "maintenance_ping",
        ElementKind::ManagedDevices => "managed_devices",
        ElementKind::PingRateAck => "ping_rate_ack",
    }
}

/// Counts host callbacks.
#[derive(Default)]
struct SimulationHost {
    registrations: AtomicU64,
    comm_errors: AtomicU64,
    queue_full: AtomicBool,
}

impl HostHandler for SimulationHost {
    fn on_comm_error(&self, url: &str, error: &EngineError) {
        self.comm_errors.fetch_add(1, Ordering::Relaxed);
        debug!("communication error at {url}: {error}");
    }

    fn on_device_registered(&self, device: DeviceId, config: ConfigId) {
        self.registrations.fetch_add(1, Ordering::Relaxed);
        info!("device {device} registered with configuration {config}");
    }

    fn on_queue_state(&self, state: QueueState) {
        if state == QueueState::Full {
            self.queue_full.store(true, Ordering::Relaxed);
        }
    }
}

/// Outcome of a simulation run.
#[derive(Debug, Serialize)]
pub struct SimulateResult {
    /// Run length in milliseconds.
    pub elapsed_ms: u128,
    /// Engine cycles run.
    pub cycles: u64,
    /// Requests handed to the transport.
    pub requests_submitted: u64,
    /// Requests answered with statuses.
    pub requests_succeeded: u64,
    /// Requests that failed.
    pub requests_failed: u64,
    /// Telemetry items posted by the producer.
    pub items_posted: u64,
    /// Telemetry items the queue refused.
    pub items_refused: u64,
    /// Queued items removed by success statuses.
    pub items_purged: u64,
    /// Items still queued at the end.
    pub items_queued: usize,
    /// Registration callbacks.
    pub registrations: u64,
    /// Communication error callbacks.
    pub comm_errors: u64,
    /// Whether the queue ever reported full.
    pub queue_filled: bool,
    /// Requests accepted per URL.
    pub requests_by_url: BTreeMap<String, u64>,
    /// Requests refused during the outage.
    pub requests_refused: u64,
    /// Elements accepted per kind.
    pub elements: BTreeMap<String, u64>,
}

/// Runs the simulate command.
pub fn run(
    path: &Path,
    options: &SimulateOptions,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let agent = AgentFile::load(path)?;
    let result = simulate(&agent, options)?;
    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&result)?),
        _ => print_text(&result),
    }
    Ok(())
}

fn simulate(
    agent: &AgentFile,
    options: &SimulateOptions,
) -> Result<SimulateResult, Box<dyn std::error::Error>> {
    let started = Instant::now();
    let deadline = started + Duration::from_secs(options.seconds);

    let server = SimulatedServer::default();
    let host = Arc::new(SimulationHost::default());
    let handler: Arc<dyn HostHandler> = host.clone();
    let mut engine = Engine::with_host(
        agent.engine_config().with_idle_sleep(true),
        HttpTransport::new(LoopbackClient::new(server.clone())),
        handler,
    );
    agent.apply(&mut engine)?;

    if let Some(secs) = options.fail_primary_secs {
        let model = engine.model();
        let url = model
            .primary()
            .and_then(|id| model.config(id))
            .and_then(|config| model.locations().get(config.location()))
            .map(|location| location.url().to_string())
            .ok_or("agent file has no primary server")?;
        server.fail_until(&url, started + Duration::from_secs(secs));
    }

    let devices: Vec<DeviceId> = engine
        .model()
        .devices()
        .ids()
        .filter(|id| engine.model().devices().is_ready(*id))
        .collect();
    let posted = Arc::new(AtomicU64::new(0));
    let refused = Arc::new(AtomicU64::new(0));
    let producer = {
        let queue = Arc::clone(engine.queue());
        let posted = Arc::clone(&posted);
        let refused = Arc::clone(&refused);
        let interval = Duration::from_millis(options.interval_ms.max(1));
        let payload_bytes = options.payload_bytes;
        thread::spawn(move || {
            let mut sequence = 0u32;
            while Instant::now() < deadline {
                for device in &devices {
                    let mut payload = sequence.to_be_bytes().to_vec();
                    payload.resize(payload_bytes.max(4), 0);
                    let item = QueueItem::new(ItemKind::Data, *device, payload)
                        .with_priority(Priority::NORMAL);
                    match queue.enqueue(item) {
                        EnqueueOutcome::Queued => posted.fetch_add(1, Ordering::Relaxed),
                        _ => refused.fetch_add(1, Ordering::Relaxed),
                    };
                }
                sequence = sequence.wrapping_add(1);
                thread::sleep(interval);
            }
        })
    };

    info!("simulating for {}s", options.seconds);
    engine.run(Some(deadline));
    producer.join().map_err(|_| "telemetry producer panicked")?;

    let stats = engine.stats();
    let log = server.log.lock();
    Ok(SimulateResult {
        elapsed_ms: started.elapsed().as_millis(),
        cycles: stats.cycles,
        requests_submitted: stats.requests_submitted,
        requests_succeeded: stats.requests_succeeded,
        requests_failed: stats.requests_failed,
        items_posted: posted.load(Ordering::Relaxed),
        items_refused: refused.load(Ordering::Relaxed),
        items_purged: stats.items_purged,
        items_queued: engine.queue().len(),
        registrations: host.registrations.load(Ordering::Relaxed),
        comm_errors: host.comm_errors.load(Ordering::Relaxed),
        queue_filled: host.queue_full.load(Ordering::Relaxed),
        requests_by_url: log.requests.clone(),
        requests_refused: log.refused,
        elements: log.elements.clone(),
    })
}

fn print_text(result: &SimulateResult) {
    println!("Simulation finished after {} ms", result.elapsed_ms);
    println!();
    println!("Engine:");
    println!("  Cycles:              {}", result.cycles);
    println!("  Requests submitted:  {}", result.requests_submitted);
    println!("  Requests succeeded:  {}", result.requests_succeeded);
    println!("  Requests failed:     {}", result.requests_failed);
    println!("  Registrations:       {}", result.registrations);
    println!("  Comm errors:         {}", result.comm_errors);
    println!();
    println!("Queue:");
    println!("  Items posted:        {}", result.items_posted);
    println!("  Items refused:       {}", result.items_refused);
    println!("  Items purged:        {}", result.items_purged);
    println!("  Items still queued:  {}", result.items_queued);
    if result.queue_filled {
        println!("  (queue reported full)");
    }
    println!();
    println!("Server:");
    for (url, count) in &result.requests_by_url {
        println!("  {url}: {count} request(s)");
    }
    if result.requests_refused > 0 {
        println!("  Refused during outage: {}", result.requests_refused);
    }
    for (kind, count) in &result.elements {
        println!("  {kind:<18} {count}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(servers: &str) -> AgentFile {
        AgentFile::parse(&format!(
            r#"{{
                "devices": [
                    {{ "model": "gateway", "serial": "GW-1" }},
                    {{ "model": "meter", "serial": "M-1" }}
                ],
                "servers": [{servers}],
                "engine": {{ "cycle_ms": 20, "failure_threshold": 1, "retry_secs": 1 }}
            }}"#
        ))
        .unwrap()
    }

    #[test]
    fn steady_state_delivers_telemetry() {
        let agent = agent(r#"{ "role": "primary", "url": "p.example.com" }"#);
        let options = SimulateOptions {
            seconds: 1,
            interval_ms: 50,
            payload_bytes: 32,
            fail_primary_secs: None,
        };

        let result = simulate(&agent, &options).unwrap();

        assert_eq!(result.requests_failed, 0);
        assert_eq!(result.registrations, 2);
        assert!(result.items_posted > 0);
        assert!(result.items_purged > 0);
        assert!(result.elements.get("registration").copied().unwrap_or(0) >= 2);
        assert!(result.elements.get("data").copied().unwrap_or(0) > 0);
        assert_eq!(result.requests_by_url.len(), 1);
    }

    #[test]
    fn primary_outage_fails_over_to_backup() {
        let agent = agent(
            r#"{ "role": "primary", "url": "p.example.com" },
               { "role": "backup", "url": "b.example.com" }"#,
        );
        let options = SimulateOptions {
            seconds: 2,
            interval_ms: 50,
            payload_bytes: 16,
            fail_primary_secs: Some(60),
        };

        let result = simulate(&agent, &options).unwrap();

        assert!(result.requests_refused >= 2);
        assert!(result.comm_errors >= 2);
        assert_eq!(result.requests_by_url.len(), 1);
        let (url, _) = result.requests_by_url.iter().next().unwrap();
        assert!(url.contains("b.example.com"));
        assert!(result.items_purged > 0);
    }
}
