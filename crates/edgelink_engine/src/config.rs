//! Configuration for the engine.

use std::time::Duration;

/// Default path used when a normal-mode URL has none.
pub const DEFAULT_MESSAGE_PATH: &str = "/eMessage";

/// Default path used when a maintenance-mode URL has none.
pub const DEFAULT_MAINTENANCE_PATH: &str = "/eMessage/maintenance";

/// Engine-wide configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Length of one drive-loop cycle.
    pub cycle_interval: Duration,
    /// Delay before a failed location or rejected binding is retried.
    pub retry_period: Duration,
    /// Consecutive failures after which a location is marked offline.
    pub failure_threshold: u32,
    /// Maximum estimated size of one outbound message, in bytes.
    pub max_message_size: usize,
    /// Path applied to normal-mode URLs that carry none.
    pub message_path: String,
    /// Path applied to maintenance-mode URLs that carry none.
    pub maintenance_path: String,
    /// Whether the drive loop may sleep while idle.
    pub idle_sleep: bool,
    /// Outbound queue sizing.
    pub queue: QueueConfig,
}

impl EngineConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self {
            cycle_interval: Duration::from_secs(1),
            retry_period: Duration::from_secs(30),
            failure_threshold: 3,
            max_message_size: 32 * 1024,
            message_path: DEFAULT_MESSAGE_PATH.to_string(),
            maintenance_path: DEFAULT_MAINTENANCE_PATH.to_string(),
            idle_sleep: true,
            queue: QueueConfig::default(),
        }
    }

    /// Sets the cycle interval.
    pub fn with_cycle_interval(mut self, interval: Duration) -> Self {
        self.cycle_interval = interval;
        self
    }

    /// Sets the retry period.
    pub fn with_retry_period(mut self, period: Duration) -> Self {
        self.retry_period = period;
        self
    }

    /// Sets the failure threshold.
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    /// Sets the maximum message size.
    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    /// Sets whether the drive loop may sleep while idle.
    pub fn with_idle_sleep(mut self, enabled: bool) -> Self {
        self.idle_sleep = enabled;
        self
    }

    /// Sets the queue configuration.
    pub fn with_queue(mut self, queue: QueueConfig) -> Self {
        self.queue = queue;
        self
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Sizing of the outbound queue.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QueueConfig {
    /// Byte budget for queued items.
    pub budget_bytes: usize,
    /// Fixed bookkeeping cost charged per item.
    pub item_overhead: usize,
    /// Multiplier approximating allocator waste.
    pub waste_ratio: f64,
}

impl QueueConfig {
    /// Creates a queue configuration with the given budget.
    pub fn new(budget_bytes: usize) -> Self {
        Self {
            budget_bytes,
            item_overhead: 64,
            waste_ratio: 1.5,
        }
    }

    /// Sets the per-item overhead.
    pub fn with_item_overhead(mut self, overhead: usize) -> Self {
        self.item_overhead = overhead;
        self
    }

    /// Sets the waste ratio.
    pub fn with_waste_ratio(mut self, ratio: f64) -> Self {
        self.waste_ratio = ratio.max(1.0);
        self
    }

    /// Estimated memory footprint of an item with the given payload length.
    pub fn footprint(&self, payload_len: usize) -> usize {
        let raw = payload_len.saturating_add(self.item_overhead) as f64;
        (raw * self.waste_ratio).ceil() as usize
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self::new(64 * 1024)
    }
}

/// Logical role of a server configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerRole {
    /// The primary server. Exactly one per engine.
    Primary,
    /// Failover target for the primary. At most one per engine.
    Backup,
    /// Any further server, addressed explicitly by queued items.
    Additional,
}

impl ServerRole {
    /// Returns the role name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerRole::Primary => "primary",
            ServerRole::Backup => "backup",
            ServerRole::Additional => "additional",
        }
    }
}

/// Settings for one server configuration.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Role of this configuration.
    pub role: ServerRole,
    /// Server URL.
    pub url: String,
    /// Owner (account) identifier.
    pub owner: String,
    /// Base ping interval.
    pub ping_interval: Duration,
    /// Protocol version.
    pub protocol_version: u16,
    /// Whether the transport should keep the connection open.
    pub persistent: bool,
    /// Request timeout enforced by the transport.
    pub timeout: Duration,
}

impl ServerSettings {
    /// Creates settings for the given role and URL.
    pub fn new(role: ServerRole, url: impl Into<String>) -> Self {
        Self {
            role,
            url: url.into(),
            owner: String::new(),
            ping_interval: Duration::from_secs(60),
            protocol_version: edgelink_protocol::PROTOCOL_VERSION,
            persistent: false,
            timeout: Duration::from_secs(30),
        }
    }

    /// Creates primary server settings.
    pub fn primary(url: impl Into<String>) -> Self {
        Self::new(ServerRole::Primary, url)
    }

    /// Creates backup server settings.
    pub fn backup(url: impl Into<String>) -> Self {
        Self::new(ServerRole::Backup, url)
    }

    /// Sets the owner.
    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    /// Sets the base ping interval.
    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    /// Sets the protocol version.
    pub fn with_protocol_version(mut self, version: u16) -> Self {
        self.protocol_version = version;
        self
    }

    /// Sets the persistent-connection flag.
    pub fn with_persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    /// Sets the request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}
