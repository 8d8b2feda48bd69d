//! Control-message generation.
//!
//! Once per cycle, each binding is checked in a fixed order: ping-rate
//! reversion (per configuration), registration, ping, online notice,
//! maintenance ping, and finally the managed-device batch of the master.
//! Each step is gated independently; flags and timestamps are only updated
//! when the element actually made it into a request.

use crate::engine::Engine;
use crate::model::{Binding, ConfigId, DeviceId};
use crate::transport::Transport;
use edgelink_protocol::ElementBody;
use std::time::{Duration, Instant};
use tracing::{debug, info};

fn is_due(last: Option<Instant>, interval: Duration, now: Instant) -> bool {
    last.map_or(true, |at| now.saturating_duration_since(at) >= interval)
}

impl<T: Transport> Engine<T> {
    pub(crate) fn generate_control_messages(&mut self, now: Instant) {
        let configs: Vec<ConfigId> = self.model.config_ids().collect();
        let devices: Vec<DeviceId> = self.model.devices.ids().collect();
        for config in configs {
            self.revert_ping_rate(config, now);
            for &device in &devices {
                self.generate_for_binding(config, device, now);
            }
            if devices.len() > 1 {
                self.generate_managed_devices(config);
            }
        }
    }

    fn revert_ping_rate(&mut self, config: ConfigId, now: Instant) {
        let Some(cfg) = self.model.config_mut(config) else {
            return;
        };
        if !cfg.revert_ping_rate_if_due(now) {
            return;
        }
        let interval = cfg.effective_ping_interval();
        info!("configuration {config} ping interval reverted to {interval:?}");
        self.host.on_ping_rate_update(config, interval);
        self.add_element(
            config,
            DeviceId::MASTER,
            ElementBody::PingRateAck {
                ping_rate_secs: interval.as_secs(),
            },
        );
    }

    fn generate_for_binding(&mut self, config: ConfigId, device: DeviceId, now: Instant) {
        let ready = self.model.devices.is_ready(device);
        let online = self.model.devices.get(device).is_some_and(|d| d.is_online());
        let Some(cfg) = self.model.config(config) else {
            return;
        };
        let owner = cfg.owner_for(device).to_owned();
        let master_owner = cfg.owner_for(DeviceId::MASTER).to_owned();
        let ping_interval = cfg.effective_ping_interval();
        let location_online = self.model.locations.is_online(cfg.active_location(device));

        let Some(binding) = self.model.binding_mut(config, device) else {
            return;
        };
        if !binding.may_use(now) {
            return;
        }
        let registered = binding.registered;
        let maintenance = binding.maintenance;
        let notice_pending = binding.online_notice_pending;
        let ping_due = is_due(binding.last_ping, ping_interval, now);
        let maintenance_ping_due = is_due(
            binding.last_maintenance_ping,
            binding.maintenance_ping_interval,
            now,
        );

        if ready && !registered && !maintenance {
            let body = ElementBody::Registration {
                owner,
                master_owner,
                ping_rate_secs: ping_interval.as_secs(),
            };
            if self.add_element(config, device, body).is_some() {
                debug!("registration queued for device {device} with configuration {config}");
                self.stamp(config, device, |b| b.last_ping = Some(now));
            }
        }

        if registered && !maintenance && location_online {
            if ping_due && self.add_element(config, device, ElementBody::Ping).is_some() {
                self.stamp(config, device, |b| b.last_ping = Some(now));
            }
            if notice_pending
                && self
                    .add_element(config, device, ElementBody::OnlineNotice { online })
                    .is_some()
            {
                self.stamp(config, device, |b| b.online_notice_pending = false);
            }
        }

        if maintenance
            && maintenance_ping_due
            && self
                .add_element(config, device, ElementBody::MaintenancePing)
                .is_some()
        {
            self.stamp(config, device, |b| b.last_maintenance_ping = Some(now));
        }
    }

    fn generate_managed_devices(&mut self, config: ConfigId) {
        let Some(master) = self.model.binding(config, DeviceId::MASTER) else {
            return;
        };
        if !master.devices_changed || !master.registered || master.maintenance || !master.is_active() {
            return;
        }

        let managed = self
            .model
            .devices
            .ids()
            .filter(|d| !d.is_master() && self.model.devices.is_ready(*d))
            .filter(|d| self.model.binding(config, *d).is_some_and(|b| b.registered))
            .filter_map(|d| self.model.devices.get(d).map(|dev| dev.identity().clone()))
            .collect::<Vec<_>>();

        let count = managed.len();
        if self
            .add_element(config, DeviceId::MASTER, ElementBody::ManagedDevices(managed))
            .is_some()
        {
            debug!("managed-device batch of {count} queued for configuration {config}");
            self.stamp(config, DeviceId::MASTER, |b| b.devices_changed = false);
        }
    }

    fn stamp(&mut self, config: ConfigId, device: DeviceId, update: impl FnOnce(&mut Binding)) {
        if let Some(binding) = self.model.binding_mut(config, device) {
            update(binding);
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::config::{EngineConfig, ServerSettings};
    use crate::engine::Engine;
    use crate::model::{ConfigId, DeviceId};
    use crate::transport::MockTransport;
    use edgelink_protocol::{ElementBody, ElementKind};
    use std::time::{Duration, Instant};

    fn engine(devices: usize) -> (Engine<MockTransport>, ConfigId) {
        let mut engine = Engine::new(EngineConfig::new(), MockTransport::new());
        for i in 0..devices {
            engine.add_device("model", &format!("sn-{i}")).unwrap();
        }
        let primary = engine
            .initialize_configuration(
                &ServerSettings::primary("p.example.com").with_ping_interval(Duration::from_secs(60)),
            )
            .unwrap();
        (engine, primary)
    }

    fn kinds(engine: &Engine<MockTransport>) -> Vec<(DeviceId, ElementKind)> {
        engine
            .requests
            .get(engine.model.config(ConfigId(0)).unwrap().location())
            .map(|r| r.elements().iter().map(|e| (e.device, e.element.kind())).collect())
            .unwrap_or_default()
    }

    #[test]
    fn unregistered_binding_registers() {
        let (mut engine, _) = engine(1);
        engine.generate_control_messages(Instant::now());
        assert_eq!(kinds(&engine), vec![(DeviceId::MASTER, ElementKind::Registration)]);

        engine.generate_control_messages(Instant::now());
        assert_eq!(kinds(&engine).len(), 1);
    }

    #[test]
    fn disabled_device_does_not_register() {
        let (mut engine, _) = engine(2);
        engine.set_device_enabled(DeviceId(1), false).unwrap();
        engine.generate_control_messages(Instant::now());
        assert_eq!(kinds(&engine), vec![(DeviceId::MASTER, ElementKind::Registration)]);
    }

    #[test]
    fn registered_binding_pings_when_due() {
        let (mut engine, primary) = engine(1);
        let start = Instant::now();
        {
            let binding = engine.model.binding_mut(primary, DeviceId::MASTER).unwrap();
            binding.registered = true;
            binding.last_ping = Some(start);
        }

        engine.generate_control_messages(start + Duration::from_secs(59));
        assert!(kinds(&engine).is_empty());

        engine.generate_control_messages(start + Duration::from_secs(60));
        assert_eq!(kinds(&engine), vec![(DeviceId::MASTER, ElementKind::Ping)]);
    }

    #[test]
    fn online_notice_clears_flag() {
        let (mut engine, primary) = engine(1);
        {
            let binding = engine.model.binding_mut(primary, DeviceId::MASTER).unwrap();
            binding.registered = true;
            binding.last_ping = Some(Instant::now());
            binding.online_notice_pending = true;
        }

        engine.generate_control_messages(Instant::now());
        assert_eq!(kinds(&engine), vec![(DeviceId::MASTER, ElementKind::OnlineNotice)]);
        assert!(!engine.binding(primary, DeviceId::MASTER).unwrap().online_notice_pending());
    }

    #[test]
    fn maintenance_binding_sends_only_maintenance_pings() {
        let (mut engine, primary) = engine(1);
        let start = Instant::now();
        {
            let binding = engine.model.binding_mut(primary, DeviceId::MASTER).unwrap();
            binding.maintenance = true;
            binding.maintenance_ping_interval = Duration::from_secs(300);
            binding.online_notice_pending = true;
        }

        engine.generate_control_messages(start);
        assert_eq!(kinds(&engine), vec![(DeviceId::MASTER, ElementKind::MaintenancePing)]);
        let stamped = engine.binding(primary, DeviceId::MASTER).unwrap().last_maintenance_ping;
        assert_eq!(stamped, Some(start));
    }

    #[test]
    fn inactive_binding_stays_silent() {
        let (mut engine, primary) = engine(1);
        engine.model.binding_mut(primary, DeviceId::MASTER).unwrap().deactivate();
        engine.generate_control_messages(Instant::now());
        assert!(kinds(&engine).is_empty());
    }

    #[test]
    fn ping_rate_reversion_acknowledged() {
        let (mut engine, primary) = engine(1);
        let start = Instant::now();
        engine.model.binding_mut(primary, DeviceId::MASTER).unwrap().registered = true;
        engine.model.binding_mut(primary, DeviceId::MASTER).unwrap().last_ping = Some(start);
        engine
            .model
            .config_mut(primary)
            .unwrap()
            .set_ping_rate(Duration::from_secs(5), Some(start + Duration::from_secs(10)));

        engine.generate_control_messages(start + Duration::from_secs(10));

        let config = engine.configuration(primary).unwrap();
        assert_eq!(config.effective_ping_interval(), Duration::from_secs(60));
        assert!(config.revert_at().is_none());
        let request = engine.requests.get(config.location()).unwrap();
        assert!(request.elements().iter().any(|e| matches!(
            e.element.body,
            ElementBody::PingRateAck { ping_rate_secs: 60 }
        )));
    }

    #[test]
    fn managed_device_batch_lists_registered_devices() {
        let (mut engine, primary) = engine(3);
        let now = Instant::now();
        for device in [DeviceId(0), DeviceId(1)] {
            let binding = engine.model.binding_mut(primary, device).unwrap();
            binding.registered = true;
            binding.last_ping = Some(now);
        }
        engine.model.binding_mut(primary, DeviceId::MASTER).unwrap().devices_changed = true;

        engine.generate_control_messages(now);

        let location = engine.configuration(primary).unwrap().location();
        let batch = engine
            .requests
            .get(location)
            .unwrap()
            .elements()
            .iter()
            .find_map(|e| match &e.element.body {
                ElementBody::ManagedDevices(devices) => Some(devices.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].serial, "sn-1");
        assert!(!engine.binding(primary, DeviceId::MASTER).unwrap().devices_changed());
    }
}
