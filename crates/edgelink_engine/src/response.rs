//! Response processing.
//!
//! Transport events are routed to their request by message ID. A completed
//! request first updates the comm status of its location, then applies each
//! parsed status record to the bindings that had content in the request.
//! Delivered queue items are purged last.

use crate::endpoint;
use crate::engine::Engine;
use crate::error::EngineError;
use crate::model::{ConfigId, DeviceId, LocationId};
use crate::queue::{DeviceFilter, ItemKind, Priority, QueueItem};
use crate::request::{Request, RequestState};
use crate::transport::{Transport, TransportEvent};
use edgelink_protocol::{
    CommandStatusEcho, ElementBody, ProtocolError, ServerCommand, StatusCode, StatusRecord,
    StatusScope,
};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

impl<T: Transport> Engine<T> {
    /// Dispatches transport events to their requests.
    pub fn handle_events(&mut self, events: Vec<TransportEvent>, now: Instant) {
        for event in events {
            let request_id = event.request_id();
            let Some(location) = self.requests.find_by_id(request_id) else {
                debug!("ignoring event for unknown message {request_id}");
                continue;
            };
            let Some(request) = self.requests.get_mut(location) else {
                continue;
            };
            if request.state() != RequestState::Active {
                debug!("ignoring event for message {request_id} in state {:?}", request.state());
                continue;
            }

            match event {
                TransportEvent::BodyChunk { offset, bytes, .. } => {
                    if let Err(e) = request.on_body_chunk(offset, &bytes) {
                        request.on_error(e);
                        self.complete_request(location, now);
                    }
                }
                TransportEvent::Completed { .. } => {
                    request.on_completed();
                    self.complete_request(location, now);
                }
                TransportEvent::Error { error, .. } => {
                    request.on_error(error);
                    self.complete_request(location, now);
                }
            }
        }
    }

    fn complete_request(&mut self, location: LocationId, now: Instant) {
        let Some(mut request) = self.requests.remove(location) else {
            return;
        };
        let failure = match request.take_error() {
            Some(error) => Some(error),
            None => match request.parse_response(self.codec.as_ref()) {
                Ok([]) => Some(EngineError::Protocol(ProtocolError::invalid_structure(
                    "response carried no status records",
                ))),
                Ok(_) => None,
                Err(e) => Some(e),
            },
        };

        match failure {
            Some(error) => self.fail_request(request, error, now),
            None => self.finish_request(request, now),
        }
    }

    /// Counts a communication failure and keeps the request for resend.
    fn fail_request(&mut self, mut request: Request, error: EngineError, now: Instant) {
        let location = request.location();
        let url = self
            .model
            .locations
            .get(location)
            .map(|l| l.url().to_owned())
            .unwrap_or_default();
        warn!("message {} to {url} failed: {error}", request.id());
        self.stats.requests_failed += 1;

        let went_offline = self.model.locations.record_failure(
            location,
            now,
            self.config.retry_period,
            self.config.failure_threshold,
        );
        if went_offline {
            self.model.propagate_comm_status(location, false);
        }
        self.host.on_comm_error(&url, &error);

        // Unsent content stays with the location until it answers again.
        request.reset();
        self.requests.insert(request);
    }

    fn finish_request(&mut self, mut request: Request, now: Instant) {
        let location = request.location();
        let request_id = request.id();
        self.stats.requests_succeeded += 1;

        if self.model.locations.record_success(location) {
            self.model.propagate_comm_status(location, true);
        }

        for status in request.take_statuses() {
            let targets = self.status_targets(&request, &status.scope);
            if targets.is_empty() {
                debug!("status {:?} of message {request_id} matched no binding", status.code);
                continue;
            }
            self.apply_status(&request, &status, &targets, now);

            if status.code == StatusCode::Success {
                let purged = match status.scope {
                    StatusScope::Global => self.queue.purge(request_id, DeviceFilter::Any),
                    StatusScope::Device(_) => targets
                        .iter()
                        .map(|(_, device)| self.queue.purge(request_id, DeviceFilter::Device(*device)))
                        .sum(),
                };
                self.stats.items_purged += purged as u64;
            }
        }

        let released = self.queue.release(request_id);
        if released > 0 {
            debug!("{released} item(s) of message {request_id} left queued for resend");
        }
    }

    /// Bindings a status applies to: those with content in the request whose
    /// active location is the one that answered, narrowed to one device for
    /// device-scoped records.
    fn status_targets(&self, request: &Request, scope: &StatusScope) -> Vec<(ConfigId, DeviceId)> {
        let device_filter = match scope {
            StatusScope::Global => None,
            StatusScope::Device(identity) => match self.model.devices.find(identity) {
                Some(device) => Some(device),
                None => {
                    warn!("status for unknown device {}/{}", identity.model, identity.serial);
                    return Vec::new();
                }
            },
        };

        let mut targets: Vec<(ConfigId, DeviceId)> = Vec::new();
        for element in request.elements() {
            let pair = (element.config, element.device);
            if targets.contains(&pair) || device_filter.is_some_and(|d| d != element.device) {
                continue;
            }
            let answered_here = self
                .model
                .config(element.config)
                .is_some_and(|c| c.active_location(element.device) == request.location());
            if answered_here {
                targets.push(pair);
            }
        }
        targets
    }

    fn apply_status(
        &mut self,
        request: &Request,
        status: &StatusRecord,
        targets: &[(ConfigId, DeviceId)],
        now: Instant,
    ) {
        match &status.code {
            StatusCode::StayInMaintenanceMode => return,
            StatusCode::Command(command) => {
                let Some(&(config, device)) = targets.first() else {
                    return;
                };
                // Global commands address the master device.
                let device = match status.scope {
                    StatusScope::Global => DeviceId::MASTER,
                    StatusScope::Device(_) => device,
                };
                self.apply_command(command, config, device, now);
                return;
            }
            _ => {}
        }

        for &(config, device) in targets {
            match &status.code {
                StatusCode::Success => {
                    if request.registers(config, device) {
                        self.on_registered(config, device);
                    }
                }
                StatusCode::NotRegistered => self.on_not_registered(config, device, now),
                StatusCode::EnterMaintenanceMode {
                    url,
                    ping_rate_secs,
                } => self.enter_maintenance(config, device, url.as_deref(), *ping_rate_secs),
                StatusCode::ExitMaintenanceMode { url, owner } => {
                    self.exit_maintenance(config, device, url.as_deref(), owner.as_deref(), now)
                }
                StatusCode::StayInMaintenanceMode | StatusCode::Command(_) => {}
            }
        }
    }

    fn on_registered(&mut self, config: ConfigId, device: DeviceId) {
        let Some(binding) = self.model.binding_mut(config, device) else {
            return;
        };
        if binding.registered {
            return;
        }
        binding.registered = true;
        binding.online_notice_pending = true;
        if self.model.devices.len() > 1 {
            if let Some(master) = self.model.binding_mut(config, DeviceId::MASTER) {
                master.devices_changed = true;
            }
        }
        info!("device {device} registered with configuration {config}");
        self.host.on_device_registered(device, config);
    }

    fn on_not_registered(&mut self, config: ConfigId, device: DeviceId, now: Instant) {
        let retry_at = now + self.config.retry_period;
        if let Some(binding) = self.model.binding_mut(config, device) {
            binding.registered = false;
            binding.retry_at = Some(retry_at);
            info!("device {device} not registered with configuration {config}");
        }
    }

    fn enter_maintenance(&mut self, config: ConfigId, device: DeviceId, url: Option<&str>, ping_rate_secs: u64) {
        let Some(target) = self.redirect_location(config, device, url, true) else {
            return;
        };
        let Some(binding) = self.model.binding_mut(config, device) else {
            return;
        };
        binding.location_override = Some(target);
        binding.maintenance = true;
        binding.maintenance_ping_interval = Duration::from_secs(ping_rate_secs);
        binding.registered = false;
        binding.last_maintenance_ping = None;
        info!("device {device} entered maintenance mode at location {target}");
    }

    fn exit_maintenance(
        &mut self,
        config: ConfigId,
        device: DeviceId,
        url: Option<&str>,
        owner: Option<&str>,
        now: Instant,
    ) {
        let Some(target) = self.redirect_location(config, device, url, false) else {
            return;
        };
        let home = self.model.config(config).map(|c| c.location());
        let retry_at = now + self.config.retry_period;
        let Some(binding) = self.model.binding_mut(config, device) else {
            return;
        };
        binding.location_override = (Some(target) != home).then_some(target);
        binding.maintenance = false;
        if let Some(owner) = owner {
            binding.owner_override = Some(owner.to_owned());
        }
        binding.retry_at = Some(retry_at);
        info!("device {device} left maintenance mode for location {target}");
    }

    /// Builds the target of a maintenance redirect from the binding's
    /// current location and interns it.
    fn redirect_location(
        &mut self,
        config: ConfigId,
        device: DeviceId,
        url: Option<&str>,
        maintenance: bool,
    ) -> Option<LocationId> {
        let current = self.model.config(config)?.active_location(device);
        let previous = self.model.locations.get(current)?.url().to_owned();
        let default_path = if maintenance {
            &self.config.maintenance_path
        } else {
            &self.config.message_path
        };
        match endpoint::merge_redirect(url, &previous, default_path) {
            Some(target) => Some(self.model.locations.intern(target)),
            None => {
                warn!("ignoring unusable redirect {url:?} from {previous}");
                None
            }
        }
    }

    fn apply_command(&mut self, command: &ServerCommand, config: ConfigId, device: DeviceId, now: Instant) {
        match command {
            ServerCommand::SetPingRate {
                rate_secs,
                duration_secs,
            } => {
                let interval = Duration::from_secs(*rate_secs);
                let revert_at = duration_secs.map(|d| now + Duration::from_secs(d));
                let Some(cfg) = self.model.config_mut(config) else {
                    return;
                };
                cfg.set_ping_rate(interval, revert_at);
                info!("configuration {config} ping interval set to {interval:?}");
                self.host.on_ping_rate_update(config, interval);
                self.add_element(
                    config,
                    DeviceId::MASTER,
                    ElementBody::PingRateAck {
                        ping_rate_secs: *rate_secs,
                    },
                );
            }
            ServerCommand::Restart { hard } => {
                info!("server requested {} restart of device {device}", if *hard { "hard" } else { "soft" });
                self.host.on_restart(device, *hard);
            }
            ServerCommand::Custom {
                command_id,
                name,
                parameters,
            } => {
                let status = self.host.on_command(device, name, parameters);
                debug!("command {name} ({command_id}) for device {device}: {status:?}");
                let echo = CommandStatusEcho {
                    command_id: command_id.clone(),
                    status,
                };
                match echo.encode() {
                    Ok(content) => {
                        let item = QueueItem::new(ItemKind::ResponseStatusEcho, device, content)
                            .with_priority(Priority::HIGH)
                            .with_config(config);
                        self.enqueue(item);
                    }
                    Err(e) => warn!("cannot encode status of command {command_id}: {e}"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::config::{EngineConfig, ServerSettings};
    use crate::engine::Engine;
    use crate::host::HostHandler;
    use crate::model::{ConfigId, DeviceId};
    use crate::queue::{ItemKind, QueueItem};
    use crate::request::RequestState;
    use crate::transport::{MockTransport, TransportEvent};
    use crate::EngineError;
    use edgelink_protocol::{
        CborCodec, DeviceIdentity, StatusCode, StatusRecord, ServerCommand,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    #[derive(Default)]
    struct Registrations(AtomicUsize);

    impl HostHandler for Registrations {
        fn on_device_registered(&self, _device: DeviceId, _config: ConfigId) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn engine() -> (Engine<MockTransport>, ConfigId) {
        let mut engine = Engine::new(EngineConfig::new(), MockTransport::new());
        engine.add_device("gateway", "GW-1").unwrap();
        let primary = engine
            .initialize_configuration(&ServerSettings::primary("p.example.com"))
            .unwrap();
        (engine, primary)
    }

    fn respond(engine: &mut Engine<MockTransport>, statuses: &[StatusRecord], now: Instant) {
        let request_id = engine.transport().submitted().last().unwrap().request_id;
        let body = CborCodec::new().encode_statuses(statuses).unwrap();
        engine.handle_events(
            vec![
                TransportEvent::BodyChunk {
                    request_id,
                    offset: 0,
                    bytes: body,
                },
                TransportEvent::Completed { request_id },
            ],
            now,
        );
    }

    #[test]
    fn success_registers_binding() {
        let (mut engine, primary) = engine();
        let now = Instant::now();
        engine.run_cycle(now);

        respond(&mut engine, &[StatusRecord::global(StatusCode::Success)], now);

        let binding = engine.binding(primary, DeviceId::MASTER).unwrap();
        assert!(binding.is_registered());
        assert!(binding.online_notice_pending());
        assert!(engine.requests.is_empty());
        assert_eq!(engine.stats().requests_succeeded, 1);
    }

    #[test]
    fn success_without_registration_element_keeps_binding_unregistered() {
        let host = Arc::new(Registrations::default());
        let mut engine = Engine::with_host(EngineConfig::new(), MockTransport::new(), host.clone());
        engine.add_device("gateway", "GW-1").unwrap();
        let primary = engine
            .initialize_configuration(&ServerSettings::primary("p.example.com"))
            .unwrap();
        let now = Instant::now();
        {
            let binding = engine.model.binding_mut(primary, DeviceId::MASTER).unwrap();
            binding.registered = true;
            binding.online_notice_pending = true;
            binding.last_ping = Some(now);
        }
        engine.run_cycle(now);
        let location = engine.configuration(primary).unwrap().location();
        assert!(!engine.requests.get(location).unwrap().registers(primary, DeviceId::MASTER));

        respond(
            &mut engine,
            &[
                StatusRecord::device(DeviceIdentity::new("gateway", "GW-1"), StatusCode::NotRegistered),
                StatusRecord::global(StatusCode::Success),
            ],
            now,
        );

        assert!(!engine.binding(primary, DeviceId::MASTER).unwrap().is_registered());
        assert_eq!(host.0.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn empty_response_is_a_failure() {
        let (mut engine, primary) = engine();
        let now = Instant::now();
        engine.run_cycle(now);

        respond(&mut engine, &[], now);

        let location = engine.configuration(primary).unwrap().location();
        assert_eq!(engine.location(location).unwrap().failure_count(), 1);
        let request = engine.requests.get(location).unwrap();
        assert_eq!(request.state(), RequestState::Open);
        assert_eq!(request.elements().len(), 1);
        assert_eq!(engine.stats().requests_failed, 1);
    }

    #[test]
    fn failed_request_resent_after_retry_period() {
        let (mut engine, primary) = engine();
        let now = Instant::now();
        engine.run_cycle(now);
        let first = engine.transport().submitted()[0].request_id;
        engine.handle_events(
            vec![TransportEvent::Error {
                request_id: first,
                error: EngineError::transport_retryable("timeout"),
            }],
            now,
        );

        engine.run_cycle(now + Duration::from_secs(1));
        assert_eq!(engine.transport().submitted().len(), 1);

        engine.run_cycle(now + Duration::from_secs(30));
        let submitted = engine.transport().submitted();
        assert_eq!(submitted.len(), 2);
        assert_eq!(submitted[1].request_id, first);
        assert!(!engine.binding(primary, DeviceId::MASTER).unwrap().is_registered());
    }

    #[test]
    fn not_registered_schedules_binding_retry() {
        let (mut engine, primary) = engine();
        let now = Instant::now();
        engine.run_cycle(now);

        respond(
            &mut engine,
            &[StatusRecord::device(DeviceIdentity::new("gateway", "GW-1"), StatusCode::NotRegistered)],
            now,
        );

        let binding = engine.binding(primary, DeviceId::MASTER).unwrap();
        assert!(!binding.is_registered());
        assert_eq!(binding.retry_at(), Some(now + Duration::from_secs(30)));

        engine.run_cycle(now + Duration::from_secs(1));
        assert_eq!(engine.transport().submitted().len(), 1);
        engine.run_cycle(now + Duration::from_secs(30));
        assert_eq!(engine.transport().submitted().len(), 2);
    }

    #[test]
    fn status_for_unknown_device_is_ignored() {
        let (mut engine, primary) = engine();
        let now = Instant::now();
        engine.run_cycle(now);

        respond(
            &mut engine,
            &[StatusRecord::device(DeviceIdentity::new("ghost", "0"), StatusCode::Success)],
            now,
        );
        assert!(!engine.binding(primary, DeviceId::MASTER).unwrap().is_registered());
    }

    #[test]
    fn device_success_purges_only_that_device() {
        let (mut engine, primary) = engine();
        let meter = engine.add_device("meter", "M-1").unwrap();
        for device in [DeviceId::MASTER, meter] {
            engine.model.binding_mut(primary, device).unwrap().registered = true;
            engine.model.binding_mut(primary, device).unwrap().last_ping = Some(Instant::now());
        }
        engine.model.binding_mut(primary, DeviceId::MASTER).unwrap().devices_changed = false;
        engine.post_item(QueueItem::new(ItemKind::Data, DeviceId::MASTER, vec![1])).unwrap();
        engine.post_item(QueueItem::new(ItemKind::Alarm, meter, vec![2])).unwrap();
        let now = Instant::now();
        engine.run_cycle(now);

        respond(
            &mut engine,
            &[StatusRecord::device(DeviceIdentity::new("meter", "M-1"), StatusCode::Success)],
            now,
        );

        assert_eq!(engine.queue().len(), 1);
        assert_eq!(engine.stats().items_purged, 1);
        let mut drain = engine.queue().open_drain();
        let left = drain.fetch_next().unwrap();
        assert_eq!(left.device(), DeviceId::MASTER);
        assert_eq!(left.request_id(), None);
    }

    #[test]
    fn custom_command_posts_status_echo() {
        let (mut engine, primary) = engine();
        let now = Instant::now();
        engine.run_cycle(now);

        respond(
            &mut engine,
            &[
                StatusRecord::global(StatusCode::Success),
                StatusRecord::global(StatusCode::Command(ServerCommand::Custom {
                    command_id: "c-17".into(),
                    name: "open_valve".into(),
                    parameters: vec![],
                })),
            ],
            now,
        );

        assert_eq!(engine.queue().len(), 1);
        let mut drain = engine.queue().open_drain();
        let echo = drain.fetch_next().unwrap();
        assert_eq!(echo.kind(), ItemKind::ResponseStatusEcho);
        assert_eq!(echo.config(), Some(primary));
        assert_eq!(echo.device(), DeviceId::MASTER);
    }

    #[test]
    fn set_ping_rate_with_duration() {
        let (mut engine, primary) = engine();
        let now = Instant::now();
        engine.run_cycle(now);

        respond(
            &mut engine,
            &[StatusRecord::global(StatusCode::Command(ServerCommand::SetPingRate {
                rate_secs: 10,
                duration_secs: Some(600),
            }))],
            now,
        );

        let config = engine.configuration(primary).unwrap();
        assert_eq!(config.effective_ping_interval(), Duration::from_secs(10));
        assert_eq!(config.revert_at(), Some(now + Duration::from_secs(600)));
    }
}
