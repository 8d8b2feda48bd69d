//! Agent description file.
//!
//! A JSON document listing the managed devices, the server configurations
//! and optional engine tuning. The first device is the master.

use edgelink_engine::{
    Engine, EngineConfig, EngineError, QueueConfig, ServerRole, ServerSettings, Transport,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while loading or applying an agent file.
#[derive(Error, Debug)]
pub enum AgentFileError {
    /// The file could not be read.
    #[error("cannot read {path}: {source}")]
    Io {
        /// File path.
        path: String,
        /// Underlying error.
        source: std::io::Error,
    },

    /// The file is not valid JSON for an agent description.
    #[error("invalid agent file: {0}")]
    Json(#[from] serde_json::Error),

    /// The description is structurally incomplete.
    #[error("invalid agent file: {0}")]
    Invalid(String),

    /// The engine rejected a device or server.
    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// One managed device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceEntry {
    /// Model number.
    pub model: String,
    /// Serial number.
    pub serial: String,
    /// Whether the device starts enabled.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// One server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerEntry {
    /// `primary`, `backup` or `additional`.
    pub role: String,
    /// Server URL.
    pub url: String,
    /// Owner (account) identifier.
    #[serde(default)]
    pub owner: String,
    /// Base ping interval in seconds.
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,
    /// Protocol version.
    #[serde(default = "default_protocol_version")]
    pub protocol_version: u16,
    /// Keep connections open.
    #[serde(default)]
    pub persistent: bool,
    /// Request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

/// Engine tuning. Every field is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineTuning {
    /// Cycle length in milliseconds.
    pub cycle_ms: Option<u64>,
    /// Retry period in seconds.
    pub retry_secs: Option<u64>,
    /// Consecutive failures before a location goes offline.
    pub failure_threshold: Option<u32>,
    /// Maximum message size in bytes.
    pub max_message_size: Option<usize>,
    /// Queue byte budget.
    pub queue_budget: Option<usize>,
    /// Per-item queue overhead in bytes.
    pub item_overhead: Option<usize>,
    /// Queue waste ratio.
    pub waste_ratio: Option<f64>,
}

/// The whole agent description.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentFile {
    /// Managed devices, master first.
    pub devices: Vec<DeviceEntry>,
    /// Server configurations.
    pub servers: Vec<ServerEntry>,
    /// Engine tuning.
    #[serde(default)]
    pub engine: EngineTuning,
}

fn default_true() -> bool {
    true
}

fn default_ping_interval() -> u64 {
    60
}

fn default_protocol_version() -> u16 {
    edgelink_protocol::PROTOCOL_VERSION
}

fn default_timeout() -> u64 {
    30
}

fn parse_role(role: &str) -> Result<ServerRole, AgentFileError> {
    match role.to_ascii_lowercase().as_str() {
        "primary" => Ok(ServerRole::Primary),
        "backup" => Ok(ServerRole::Backup),
        "additional" => Ok(ServerRole::Additional),
        other => Err(AgentFileError::Invalid(format!("unknown server role {other:?}"))),
    }
}

impl AgentFile {
    /// Reads and parses an agent file.
    pub fn load(path: &Path) -> Result<Self, AgentFileError> {
        let text = std::fs::read_to_string(path).map_err(|source| AgentFileError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&text)
    }

    /// Parses an agent description.
    pub fn parse(text: &str) -> Result<Self, AgentFileError> {
        let file: AgentFile = serde_json::from_str(text)?;
        if file.devices.is_empty() {
            return Err(AgentFileError::Invalid("at least one device is required".into()));
        }
        if file.servers.is_empty() {
            return Err(AgentFileError::Invalid("at least one server is required".into()));
        }
        Ok(file)
    }

    /// Engine configuration with the file's overrides applied.
    pub fn engine_config(&self) -> EngineConfig {
        let tuning = &self.engine;
        let defaults = QueueConfig::default();
        let mut queue = QueueConfig::new(tuning.queue_budget.unwrap_or(defaults.budget_bytes))
            .with_item_overhead(tuning.item_overhead.unwrap_or(defaults.item_overhead));
        if let Some(ratio) = tuning.waste_ratio {
            queue = queue.with_waste_ratio(ratio);
        }

        let mut config = EngineConfig::new().with_queue(queue);
        if let Some(ms) = tuning.cycle_ms {
            config = config.with_cycle_interval(Duration::from_millis(ms));
        }
        if let Some(secs) = tuning.retry_secs {
            config = config.with_retry_period(Duration::from_secs(secs));
        }
        if let Some(threshold) = tuning.failure_threshold {
            config = config.with_failure_threshold(threshold);
        }
        if let Some(size) = tuning.max_message_size {
            config = config.with_max_message_size(size);
        }
        config
    }

    /// Server settings, primary first so that the engine accepts them.
    pub fn server_settings(&self) -> Result<Vec<ServerSettings>, AgentFileError> {
        let mut settings = self
            .servers
            .iter()
            .map(|entry| -> Result<ServerSettings, AgentFileError> {
                Ok(ServerSettings::new(parse_role(&entry.role)?, entry.url.as_str())
                    .with_owner(entry.owner.as_str())
                    .with_ping_interval(Duration::from_secs(entry.ping_interval_secs))
                    .with_protocol_version(entry.protocol_version)
                    .with_persistent(entry.persistent)
                    .with_timeout(Duration::from_secs(entry.timeout_secs)))
            })
            .collect::<Result<Vec<_>, _>>()?;
        settings.sort_by_key(|s| s.role != ServerRole::Primary);
        Ok(settings)
    }

    /// Adds every device and server to `engine`.
    pub fn apply<T: Transport>(&self, engine: &mut Engine<T>) -> Result<(), AgentFileError> {
        for device in &self.devices {
            let id = engine.add_device(&device.model, &device.serial)?;
            if !device.enabled {
                engine.set_device_enabled(id, false)?;
            }
        }
        for settings in self.server_settings()? {
            engine.initialize_configuration(&settings)?;
        }
        Ok(())
    }
}
