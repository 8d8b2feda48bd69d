//! The engine and its drive loop.

use crate::config::{EngineConfig, ServerRole, ServerSettings};
use crate::error::{EngineError, EngineResult};
use crate::host::{CycleDriver, HostHandler, NoopHandler};
use crate::model::{
    Binding, ConfigId, DeviceId, LocationId, Model, ServerConfiguration, ServerLocation,
};
use crate::queue::{EnqueueOutcome, Queue, QueueItem};
use crate::request::{RequestTable, TransportOptions};
use crate::transport::{OutboundRequest, Transport};
use edgelink_protocol::{CborCodec, ContentElement, DocumentCodec, ElementBody};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Counters describing engine activity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Cycles run.
    pub cycles: u64,
    /// Requests handed to the transport.
    pub requests_submitted: u64,
    /// Requests answered with at least one status record.
    pub requests_succeeded: u64,
    /// Requests that failed or returned nothing usable.
    pub requests_failed: u64,
    /// Queue items removed after confirmed delivery.
    pub items_purged: u64,
    /// Items the queue refused through [`Engine::post_item`] or internal posts.
    pub items_rejected: u64,
}

/// The synchronization engine.
///
/// Owns the data model, the outbound queue, the pending requests and the
/// transport. Everything except the queue is touched only from the thread
/// calling [`run`](Engine::run).
pub struct Engine<T: Transport> {
    pub(crate) config: EngineConfig,
    pub(crate) model: Model,
    pub(crate) queue: Arc<Queue>,
    pub(crate) requests: RequestTable,
    transport: T,
    pub(crate) codec: Box<dyn DocumentCodec>,
    pub(crate) host: Arc<dyn HostHandler>,
    drivers: Vec<Box<dyn CycleDriver>>,
    cycle_begin: Option<Instant>,
    pub(crate) stats: EngineStats,
}

impl<T: Transport> Engine<T> {
    /// Creates an engine with no host callbacks.
    pub fn new(config: EngineConfig, transport: T) -> Self {
        Self::with_host(config, transport, Arc::new(NoopHandler))
    }

    /// Creates an engine reporting to `host`.
    pub fn with_host(config: EngineConfig, transport: T, host: Arc<dyn HostHandler>) -> Self {
        let listener = Arc::clone(&host);
        let queue = Queue::new(config.queue)
            .with_state_listener(move |state| listener.on_queue_state(state));
        Self {
            config,
            model: Model::new(),
            queue: Arc::new(queue),
            requests: RequestTable::new(),
            transport,
            codec: Box::new(CborCodec::new()),
            host,
            drivers: Vec::new(),
            cycle_begin: None,
            stats: EngineStats::default(),
        }
    }

    /// Replaces the document codec.
    pub fn with_codec(mut self, codec: Box<dyn DocumentCodec>) -> Self {
        self.codec = codec;
        self
    }

    /// Engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The data model.
    pub fn model(&self) -> &Model {
        &self.model
    }

    /// Pending requests.
    pub fn requests(&self) -> &RequestTable {
        &self.requests
    }

    /// The transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// The transport, mutably.
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// The outbound queue. Clone the `Arc` to hand it to producer threads.
    pub fn queue(&self) -> &Arc<Queue> {
        &self.queue
    }

    /// Statistics snapshot.
    pub fn stats(&self) -> EngineStats {
        self.stats.clone()
    }

    /// Binding of a device with a configuration.
    pub fn binding(&self, config: ConfigId, device: DeviceId) -> Option<&Binding> {
        self.model.binding(config, device)
    }

    /// A server location.
    pub fn location(&self, id: LocationId) -> Option<&ServerLocation> {
        self.model.locations.get(id)
    }

    /// A server configuration.
    pub fn configuration(&self, id: ConfigId) -> Option<&ServerConfiguration> {
        self.model.config(id)
    }

    /// Adds a managed device. The first device added is the master.
    pub fn add_device(&mut self, model: &str, serial: &str) -> EngineResult<DeviceId> {
        self.model.add_device(model, serial)
    }

    /// Adds a server configuration. The primary must come first.
    pub fn initialize_configuration(&mut self, settings: &ServerSettings) -> EngineResult<ConfigId> {
        if settings.role != ServerRole::Primary && self.model.primary().is_none() {
            return Err(EngineError::MissingPrimary);
        }
        self.model
            .initialize_configuration(settings, &self.config.message_path)
    }

    /// Enables or disables a device. Disabled devices neither register
    /// nor send queued data.
    pub fn set_device_enabled(&mut self, device: DeviceId, enabled: bool) -> EngineResult<()> {
        self.model.devices.get_mut(device)?.set_enabled(enabled);
        Ok(())
    }

    /// Records a device's online state. A change schedules an online
    /// notice with every server.
    pub fn set_device_online(&mut self, device: DeviceId, online: bool) -> EngineResult<()> {
        if !self.model.devices.get_mut(device)?.set_online(online) {
            return Ok(());
        }
        for config in &mut self.model.configs {
            if let Some(binding) = config.binding_mut(device) {
                binding.online_notice_pending = true;
            }
        }
        debug!("device {device} is now {}", if online { "online" } else { "offline" });
        Ok(())
    }

    /// Validates and queues an item for transmission.
    pub fn post_item(&mut self, item: QueueItem) -> EngineResult<EnqueueOutcome> {
        if self.model.devices.get(item.device()).is_none() {
            return Err(EngineError::UnknownDevice(item.device().0));
        }
        if let Some(config) = item.config() {
            if self.model.config(config).is_none() {
                return Err(EngineError::UnknownConfiguration(config.0));
            }
        }
        if self.model.primary().is_none() {
            return Err(EngineError::MissingPrimary);
        }
        Ok(self.enqueue(item))
    }

    pub(crate) fn enqueue(&mut self, item: QueueItem) -> EnqueueOutcome {
        let outcome = self.queue.enqueue(item);
        if outcome != EnqueueOutcome::Queued {
            self.stats.items_rejected += 1;
        }
        outcome
    }

    /// Registers an external collaborator driven every iteration.
    pub fn add_driver(&mut self, driver: Box<dyn CycleDriver>) {
        self.drivers.push(driver);
    }

    /// Runs the drive loop.
    ///
    /// With a deadline, iterates until it passes, blocking only inside the
    /// transport wait or the idle sleep, both capped by the deadline. A busy
    /// driver keeps the loop spinning without the idle sleep. With idle
    /// sleep disabled, returns early once nothing is in flight and no
    /// driver is busy. Without a deadline, performs a single iteration and
    /// returns.
    pub fn run(&mut self, deadline: Option<Instant>) {
        loop {
            let now = Instant::now();
            if deadline.is_some_and(|d| now >= d) {
                return;
            }

            let interval = self.config.cycle_interval;
            let next_cycle = match self.cycle_begin {
                Some(begin) if now.duration_since(begin) < interval => begin + interval,
                _ => {
                    self.cycle_begin = Some(now);
                    self.run_cycle(now);
                    now + interval
                }
            };

            let now = Instant::now();
            for driver in &mut self.drivers {
                driver.drive(now);
            }

            let now = Instant::now();
            let mut wait = next_cycle.saturating_duration_since(now);
            if let Some(deadline) = deadline {
                if now >= deadline {
                    return;
                }
                wait = wait.min(deadline - now);
            }

            if self.transport.has_pending_work() {
                match self.transport.wait_for_events(wait) {
                    Ok(events) => self.handle_events(events, Instant::now()),
                    Err(e) => warn!("transport wait failed: {e}"),
                }
            } else if deadline.is_some() && self.drivers.iter().any(|d| d.is_busy()) {
                continue;
            } else if deadline.is_some() && self.config.idle_sleep {
                std::thread::sleep(wait);
            } else {
                return;
            }

            if deadline.is_none() {
                return;
            }
        }
    }

    /// Runs one cycle: drain the queue, generate control content, submit
    /// ready requests.
    pub fn run_cycle(&mut self, now: Instant) {
        self.stats.cycles += 1;
        self.drain_queue(now);
        self.generate_control_messages(now);
        self.submit_ready(now);
    }

    fn submit_ready(&mut self, now: Instant) {
        let mut batch = Vec::new();
        for location in self.requests.ready_locations() {
            if !self.model.locations.may_use(location, now) {
                continue;
            }
            let Some(url) = self.model.locations.get(location).map(|l| l.url().to_owned()) else {
                continue;
            };
            let Some(request) = self.requests.get_mut(location) else {
                continue;
            };
            if let Err(e) = request.seal(self.codec.as_ref()) {
                warn!("dropping message {} to {url}: {e}", request.id());
                if let Some(dropped) = self.requests.remove(location) {
                    self.queue.release(dropped.id());
                }
                continue;
            }
            request.activate();
            batch.push(OutboundRequest {
                request_id: request.id(),
                url,
                body: request.outbound().to_vec(),
                options: request.options(),
            });
        }

        if batch.is_empty() {
            return;
        }
        debug!("submitting {} request(s)", batch.len());
        self.stats.requests_submitted += batch.len() as u64;
        self.transport.submit(batch);
    }

    /// Adds an element for a binding to the open request of its active
    /// location. Returns the request's message ID, or `None` if the request
    /// is in flight or full.
    ///
    /// A control element already present for the same binding is not
    /// added twice; its request's ID is returned.
    pub(crate) fn add_element(
        &mut self,
        config: ConfigId,
        device: DeviceId,
        body: ElementBody,
    ) -> Option<u64> {
        let cfg = self.model.config(config)?;
        let identity = self.model.devices.get(device)?.identity().clone();
        let location = cfg.active_location(device);
        let options = TransportOptions {
            protocol_version: cfg.protocol_version(),
            persistent: cfg.persistent(),
            timeout: cfg.timeout(),
        };

        let kind = body.kind();
        let request = self
            .requests
            .open(location, options, self.config.max_message_size)?;
        if kind.is_control() && request.has_element(config, device, kind) {
            return Some(request.id());
        }
        request
            .push(config, device, ContentElement::new(identity, body))
            .then(|| request.id())
    }
}
