//! Devices, server locations, server configurations, and the bindings
//! between them.
//!
//! All registries are arenas owned by the engine. IDs are indices into
//! them; bindings refer to locations by ID only.

use crate::config::{ServerRole, ServerSettings};
use crate::endpoint;
use crate::error::{EngineError, EngineResult};
use edgelink_protocol::DeviceIdentity;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Index of a device in the device registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceId(pub usize);

impl DeviceId {
    /// The master device. Always present, always ready.
    pub const MASTER: DeviceId = DeviceId(0);

    /// Returns true for the master device.
    pub fn is_master(&self) -> bool {
        *self == Self::MASTER
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Index of a server configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConfigId(pub usize);

impl fmt::Display for ConfigId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Index of a server location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LocationId(pub usize);

impl fmt::Display for LocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A managed device.
#[derive(Debug, Clone)]
pub struct Device {
    identity: DeviceIdentity,
    enabled: bool,
    online: bool,
}

impl Device {
    /// Model and serial number.
    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    /// Whether the application has enabled this device.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Whether the application reports this device online.
    pub fn is_online(&self) -> bool {
        self.online
    }
}

/// Registry of managed devices. Index 0 is the master device.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: Vec<Device>,
}

impl DeviceRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a device. The first device added becomes the master.
    pub fn add(&mut self, model: &str, serial: &str) -> EngineResult<DeviceId> {
        let identity = DeviceIdentity::new(model, serial);
        if self.find(&identity).is_some() {
            return Err(EngineError::DuplicateDevice {
                model: identity.model,
                serial: identity.serial,
            });
        }
        self.devices.push(Device {
            identity,
            enabled: true,
            online: true,
        });
        Ok(DeviceId(self.devices.len() - 1))
    }

    /// Looks up a device by identity.
    pub fn find(&self, identity: &DeviceIdentity) -> Option<DeviceId> {
        self.devices
            .iter()
            .position(|d| d.identity == *identity)
            .map(DeviceId)
    }

    /// Gets a device.
    pub fn get(&self, id: DeviceId) -> Option<&Device> {
        self.devices.get(id.0)
    }

    pub(crate) fn get_mut(&mut self, id: DeviceId) -> EngineResult<&mut Device> {
        self.devices
            .get_mut(id.0)
            .ok_or(EngineError::UnknownDevice(id.0))
    }

    /// The master device is always ready; others when enabled.
    pub fn is_ready(&self, id: DeviceId) -> bool {
        id.is_master() || self.get(id).is_some_and(|d| d.enabled)
    }

    /// Number of devices.
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Returns true if no device was added.
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// All device IDs, master first.
    pub fn ids(&self) -> impl Iterator<Item = DeviceId> {
        (0..self.devices.len()).map(DeviceId)
    }
}

impl Device {
    pub(crate) fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub(crate) fn set_online(&mut self, online: bool) -> bool {
        let changed = self.online != online;
        self.online = online;
        changed
    }
}

/// A normalized server endpoint with its communication health.
#[derive(Debug, Clone)]
pub struct ServerLocation {
    url: String,
    online: bool,
    failures: u32,
    retry_at: Option<Instant>,
}

impl ServerLocation {
    fn new(url: String) -> Self {
        Self {
            url,
            online: true,
            failures: 0,
            retry_at: None,
        }
    }

    /// Normalized URL.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Whether the location is considered reachable.
    pub fn is_online(&self) -> bool {
        self.online
    }

    /// Consecutive failed exchanges.
    pub fn failure_count(&self) -> u32 {
        self.failures
    }

    /// Earliest time the next request may be sent.
    pub fn retry_at(&self) -> Option<Instant> {
        self.retry_at
    }

    /// False while a retry delay is pending. The delay is only cleared by a
    /// successful exchange.
    pub fn may_use(&self, now: Instant) -> bool {
        self.retry_at.map_or(true, |at| now >= at)
    }
}

/// Deduplicated set of server locations.
#[derive(Debug, Default)]
pub struct LocationRegistry {
    locations: Vec<ServerLocation>,
}

impl LocationRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the location for a normalized URL, creating it if needed.
    pub fn intern(&mut self, url: String) -> LocationId {
        if let Some(id) = self.find(&url) {
            return id;
        }
        debug!("new server location {url}");
        self.locations.push(ServerLocation::new(url));
        LocationId(self.locations.len() - 1)
    }

    /// Looks up a location by normalized URL.
    pub fn find(&self, url: &str) -> Option<LocationId> {
        self.locations
            .iter()
            .position(|l| l.url == url)
            .map(LocationId)
    }

    /// Gets a location.
    pub fn get(&self, id: LocationId) -> Option<&ServerLocation> {
        self.locations.get(id.0)
    }

    /// Number of locations.
    pub fn len(&self) -> usize {
        self.locations.len()
    }

    /// Returns true if no location exists.
    pub fn is_empty(&self) -> bool {
        self.locations.is_empty()
    }

    /// All location IDs.
    pub fn ids(&self) -> impl Iterator<Item = LocationId> {
        (0..self.locations.len()).map(LocationId)
    }

    /// Returns whether the location is online; unknown locations are not.
    pub fn is_online(&self, id: LocationId) -> bool {
        self.get(id).is_some_and(ServerLocation::is_online)
    }

    /// Returns whether the location may be contacted now.
    pub fn may_use(&self, id: LocationId, now: Instant) -> bool {
        self.get(id).is_some_and(|l| l.may_use(now))
    }

    /// Records a successful exchange. Returns true if the location came back online.
    pub(crate) fn record_success(&mut self, id: LocationId) -> bool {
        let Some(location) = self.locations.get_mut(id.0) else {
            return false;
        };
        location.failures = 0;
        location.retry_at = None;
        if location.online {
            return false;
        }
        location.online = true;
        info!("server location {} became available", location.url);
        true
    }

    /// Records a failed exchange. Returns true if the location just went offline.
    pub(crate) fn record_failure(
        &mut self,
        id: LocationId,
        now: Instant,
        retry_period: Duration,
        threshold: u32,
    ) -> bool {
        let Some(location) = self.locations.get_mut(id.0) else {
            return false;
        };
        location.failures = location.failures.saturating_add(1);
        location.retry_at = Some(now + retry_period);
        if !location.online || location.failures < threshold {
            return false;
        }
        location.online = false;
        warn!(
            "server location {} became unavailable after {} failures",
            location.url, location.failures
        );
        true
    }
}

/// Registration and activity state of one device with one server configuration.
#[derive(Debug, Clone)]
pub struct Binding {
    pub(crate) location_override: Option<LocationId>,
    pub(crate) owner_override: Option<String>,
    pub(crate) registered: bool,
    pub(crate) maintenance: bool,
    pub(crate) maintenance_ping_interval: Duration,
    pub(crate) last_ping: Option<Instant>,
    pub(crate) last_maintenance_ping: Option<Instant>,
    /// Number of reasons this binding is currently in use. Not a lock.
    pub(crate) activation: u32,
    pub(crate) retry_at: Option<Instant>,
    pub(crate) online_notice_pending: bool,
    pub(crate) devices_changed: bool,
}

impl Binding {
    fn new() -> Self {
        Self {
            location_override: None,
            owner_override: None,
            registered: false,
            maintenance: false,
            maintenance_ping_interval: Duration::ZERO,
            last_ping: None,
            last_maintenance_ping: None,
            activation: 0,
            retry_at: None,
            online_notice_pending: false,
            devices_changed: false,
        }
    }

    /// Whether the server accepted this device's registration.
    pub fn is_registered(&self) -> bool {
        self.registered
    }

    /// Whether the device is in maintenance mode with this server.
    pub fn in_maintenance(&self) -> bool {
        self.maintenance
    }

    /// Maintenance ping interval adopted from the server.
    pub fn maintenance_ping_interval(&self) -> Duration {
        self.maintenance_ping_interval
    }

    /// Activation count.
    pub fn activation_count(&self) -> u32 {
        self.activation
    }

    /// Whether the binding is eligible for traffic at all.
    pub fn is_active(&self) -> bool {
        self.activation > 0
    }

    /// Location override set by maintenance-mode redirects.
    pub fn location_override(&self) -> Option<LocationId> {
        self.location_override
    }

    /// Owner override adopted when leaving maintenance mode.
    pub fn owner_override(&self) -> Option<&str> {
        self.owner_override.as_deref()
    }

    /// Whether an online-state notice is waiting to be sent.
    pub fn online_notice_pending(&self) -> bool {
        self.online_notice_pending
    }

    /// Whether the managed-device batch must be resent.
    pub fn devices_changed(&self) -> bool {
        self.devices_changed
    }

    /// Earliest time this binding may be used again.
    pub fn retry_at(&self) -> Option<Instant> {
        self.retry_at
    }

    /// True when active and not waiting out a retry delay. An elapsed
    /// delay is cleared.
    pub(crate) fn may_use(&mut self, now: Instant) -> bool {
        if self.activation == 0 {
            return false;
        }
        match self.retry_at {
            Some(at) if now < at => false,
            Some(_) => {
                self.retry_at = None;
                true
            }
            None => true,
        }
    }

    pub(crate) fn activate(&mut self) {
        self.activation = self.activation.saturating_add(1);
    }

    pub(crate) fn deactivate(&mut self) {
        self.activation = self.activation.saturating_sub(1);
    }
}

/// One server configuration: a role, its location, and a binding per device.
#[derive(Debug, Clone)]
pub struct ServerConfiguration {
    role: ServerRole,
    location: LocationId,
    owner: String,
    base_ping_interval: Duration,
    pub(crate) effective_ping_interval: Duration,
    pub(crate) revert_at: Option<Instant>,
    protocol_version: u16,
    persistent: bool,
    timeout: Duration,
    pub(crate) bindings: Vec<Binding>,
}

impl ServerConfiguration {
    /// Role.
    pub fn role(&self) -> ServerRole {
        self.role
    }

    /// Configured location.
    pub fn location(&self) -> LocationId {
        self.location
    }

    /// Configured owner.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Configured ping interval.
    pub fn base_ping_interval(&self) -> Duration {
        self.base_ping_interval
    }

    /// Ping interval currently in effect.
    pub fn effective_ping_interval(&self) -> Duration {
        self.effective_ping_interval
    }

    /// When the effective ping interval reverts to the base interval.
    pub fn revert_at(&self) -> Option<Instant> {
        self.revert_at
    }

    /// Protocol version.
    pub fn protocol_version(&self) -> u16 {
        self.protocol_version
    }

    /// Whether connections to this server should be kept open.
    pub fn persistent(&self) -> bool {
        self.persistent
    }

    /// Request timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Binding for a device.
    pub fn binding(&self, device: DeviceId) -> Option<&Binding> {
        self.bindings.get(device.0)
    }

    pub(crate) fn binding_mut(&mut self, device: DeviceId) -> Option<&mut Binding> {
        self.bindings.get_mut(device.0)
    }

    /// Location a device currently talks to: its override if set.
    pub fn active_location(&self, device: DeviceId) -> LocationId {
        self.binding(device)
            .and_then(|b| b.location_override)
            .unwrap_or(self.location)
    }

    /// Owner a device currently registers under.
    pub fn owner_for(&self, device: DeviceId) -> &str {
        self.binding(device)
            .and_then(|b| b.owner_override.as_deref())
            .unwrap_or(&self.owner)
    }

    pub(crate) fn set_ping_rate(&mut self, interval: Duration, revert_at: Option<Instant>) {
        self.effective_ping_interval = interval;
        self.revert_at = revert_at;
    }

    /// Resets the effective ping interval once the reversion deadline has
    /// passed. Returns true if it did.
    pub(crate) fn revert_ping_rate_if_due(&mut self, now: Instant) -> bool {
        match self.revert_at {
            Some(at) if now >= at => {
                self.effective_ping_interval = self.base_ping_interval;
                self.revert_at = None;
                true
            }
            _ => false,
        }
    }
}

/// The complete data model: devices, locations, and configurations.
#[derive(Debug, Default)]
pub struct Model {
    pub(crate) devices: DeviceRegistry,
    pub(crate) locations: LocationRegistry,
    pub(crate) configs: Vec<ServerConfiguration>,
}

impl Model {
    /// Creates an empty model.
    pub fn new() -> Self {
        Self::default()
    }

    /// Device registry.
    pub fn devices(&self) -> &DeviceRegistry {
        &self.devices
    }

    /// Location registry.
    pub fn locations(&self) -> &LocationRegistry {
        &self.locations
    }

    /// Gets a configuration.
    pub fn config(&self, id: ConfigId) -> Option<&ServerConfiguration> {
        self.configs.get(id.0)
    }

    pub(crate) fn config_mut(&mut self, id: ConfigId) -> Option<&mut ServerConfiguration> {
        self.configs.get_mut(id.0)
    }

    /// All configuration IDs.
    pub fn config_ids(&self) -> impl Iterator<Item = ConfigId> {
        (0..self.configs.len()).map(ConfigId)
    }

    fn find_role(&self, role: ServerRole) -> Option<ConfigId> {
        self.configs
            .iter()
            .position(|c| c.role == role)
            .map(ConfigId)
    }

    /// The primary configuration.
    pub fn primary(&self) -> Option<ConfigId> {
        self.find_role(ServerRole::Primary)
    }

    /// The backup configuration.
    pub fn backup(&self) -> Option<ConfigId> {
        self.find_role(ServerRole::Backup)
    }

    /// Resolves an item's target configuration, falling back to the primary.
    pub fn resolve_config(&self, id: Option<ConfigId>) -> Option<ConfigId> {
        id.filter(|c| c.0 < self.configs.len())
            .or_else(|| self.primary())
    }

    /// Binding of a device with a configuration.
    pub fn binding(&self, config: ConfigId, device: DeviceId) -> Option<&Binding> {
        self.config(config).and_then(|c| c.binding(device))
    }

    pub(crate) fn binding_mut(&mut self, config: ConfigId, device: DeviceId) -> Option<&mut Binding> {
        self.config_mut(config).and_then(|c| c.binding_mut(device))
    }

    /// Adds a device and binds it to every configuration.
    pub fn add_device(&mut self, model: &str, serial: &str) -> EngineResult<DeviceId> {
        let id = self.devices.add(model, serial)?;
        for config in &mut self.configs {
            let mut binding = Binding::new();
            if config.role != ServerRole::Backup {
                binding.activate();
            }
            config.bindings.push(binding);
            if !id.is_master() {
                if let Some(master) = config.bindings.first_mut() {
                    master.devices_changed = true;
                }
            }
        }
        debug!("added device {id} ({model}/{serial})");
        Ok(id)
    }

    /// Creates a server configuration and binds every existing device to it.
    ///
    /// Bindings of non-backup configurations start active.
    pub fn initialize_configuration(
        &mut self,
        settings: &ServerSettings,
        default_path: &str,
    ) -> EngineResult<ConfigId> {
        if settings.role != ServerRole::Additional && self.find_role(settings.role).is_some() {
            return Err(EngineError::DuplicateRole(settings.role.as_str()));
        }
        let url = endpoint::normalize(&settings.url, default_path)
            .ok_or_else(|| EngineError::BadUrl(settings.url.clone()))?;
        let location = self.locations.intern(url);

        let bindings = self
            .devices
            .ids()
            .map(|_| {
                let mut binding = Binding::new();
                if settings.role != ServerRole::Backup {
                    binding.activate();
                }
                binding
            })
            .collect();

        self.configs.push(ServerConfiguration {
            role: settings.role,
            location,
            owner: settings.owner.clone(),
            base_ping_interval: settings.ping_interval,
            effective_ping_interval: settings.ping_interval,
            revert_at: None,
            protocol_version: settings.protocol_version,
            persistent: settings.persistent,
            timeout: settings.timeout,
            bindings,
        });
        let id = ConfigId(self.configs.len() - 1);
        info!(
            "initialized {} server configuration {id} at location {location}",
            settings.role.as_str()
        );
        Ok(id)
    }

    /// Arms or disarms backup bindings after `location` flipped state.
    ///
    /// Every non-maintenance binding of a non-backup configuration whose
    /// active location is `location` contributes one increment (offline)
    /// or one decrement (online) to the backup binding of the same device.
    /// A backup binding that becomes armed is marked unregistered.
    pub(crate) fn propagate_comm_status(&mut self, location: LocationId, online: bool) {
        let Some(backup) = self.backup() else {
            return;
        };

        let mut affected = Vec::new();
        for (index, config) in self.configs.iter().enumerate() {
            if index == backup.0 {
                continue;
            }
            for device in self.devices.ids() {
                let Some(binding) = config.binding(device) else {
                    continue;
                };
                if !binding.maintenance && config.active_location(device) == location {
                    affected.push(device);
                }
            }
        }

        for device in affected {
            let Some(sibling) = self.binding_mut(backup, device) else {
                continue;
            };
            if online {
                sibling.deactivate();
                debug!("backup binding for device {device} disarmed ({})", sibling.activation);
            } else {
                let was_armed = sibling.is_active();
                sibling.activate();
                if !was_armed {
                    sibling.registered = false;
                    info!("backup server armed for device {device}");
                }
            }
        }
    }
}
