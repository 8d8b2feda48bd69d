//! Validate command implementation.

use crate::agent::AgentFile;
use edgelink_engine::{Engine, MockTransport, Transport};
use serde::Serialize;
use std::path::Path;

/// Topology built from an agent file.
#[derive(Debug, Serialize)]
pub struct ValidateResult {
    /// Agent file path.
    pub path: String,
    /// Managed devices, master first.
    pub devices: Vec<DeviceSummary>,
    /// Server configurations in creation order.
    pub servers: Vec<ServerSummary>,
    /// Distinct server locations.
    pub location_count: usize,
    /// Queue byte budget.
    pub queue_budget: usize,
}

/// One device in the topology.
#[derive(Debug, Serialize)]
pub struct DeviceSummary {
    /// Device index.
    pub id: usize,
    /// `model/serial`.
    pub identity: String,
    /// Whether the device is enabled.
    pub enabled: bool,
}

/// One server configuration in the topology.
#[derive(Debug, Serialize)]
pub struct ServerSummary {
    /// Configuration index.
    pub id: usize,
    /// Role name.
    pub role: String,
    /// Normalized URL of the home location.
    pub url: String,
    /// Owner identifier.
    pub owner: String,
    /// Base ping interval in seconds.
    pub ping_interval_secs: u64,
    /// Devices whose binding starts armed.
    pub active_bindings: usize,
}

/// Runs the validate command.
pub fn run(path: &Path, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let agent = AgentFile::load(path)?;
    let mut engine = Engine::new(agent.engine_config(), MockTransport::new());
    agent.apply(&mut engine)?;

    let result = summarize(path, &engine);
    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&result)?),
        _ => print_text(&result),
    }
    Ok(())
}

fn summarize<T: Transport>(path: &Path, engine: &Engine<T>) -> ValidateResult {
    let model = engine.model();
    let devices = model
        .devices()
        .ids()
        .filter_map(|id| {
            model.devices().get(id).map(|device| DeviceSummary {
                id: id.0,
                identity: device.identity().to_string(),
                enabled: device.is_enabled(),
            })
        })
        .collect();

    let servers = model
        .config_ids()
        .filter_map(|id| {
            let config = model.config(id)?;
            let url = model.locations().get(config.location())?.url().to_string();
            let active_bindings = model
                .devices()
                .ids()
                .filter(|device| config.binding(*device).is_some_and(|b| b.is_active()))
                .count();
            Some(ServerSummary {
                id: id.0,
                role: config.role().as_str().to_string(),
                url,
                owner: config.owner().to_string(),
                ping_interval_secs: config.base_ping_interval().as_secs(),
                active_bindings,
            })
        })
        .collect();

    ValidateResult {
        path: path.display().to_string(),
        devices,
        servers,
        location_count: model.locations().ids().count(),
        queue_budget: engine.queue().budget_bytes(),
    }
}

fn print_text(result: &ValidateResult) {
    println!("Agent file: {}", result.path);
    println!();
    println!("Devices ({}):", result.devices.len());
    for device in &result.devices {
        let state = if device.enabled { "enabled" } else { "disabled" };
        let master = if device.id == 0 { " (master)" } else { "" };
        println!("  #{} {} [{}]{}", device.id, device.identity, state, master);
    }
    println!();
    println!("Servers ({}):", result.servers.len());
    for server in &result.servers {
        println!(
            "  #{} {:<10} {} owner={:?} ping={}s armed={}",
            server.id,
            server.role,
            server.url,
            server.owner,
            server.ping_interval_secs,
            server.active_bindings
        );
    }
    println!();
    println!("Locations: {}", result.location_count);
    println!("Queue budget: {} bytes", result.queue_budget);
}
