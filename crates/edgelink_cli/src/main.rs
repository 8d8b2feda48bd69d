//! EdgeLink CLI
//!
//! Command-line tools for exercising the EdgeLink synchronization core.
//!
//! # Commands
//!
//! - `validate` - Load an agent file and report the resulting topology
//! - `simulate` - Run the engine against an in-process server

mod agent;
mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// EdgeLink agent tools.
#[derive(Parser)]
#[command(name = "edgelink")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the agent description file (JSON)
    #[arg(global = true, short, long)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load the agent file and print the configured topology
    Validate {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Run the engine against a simulated server
    Simulate {
        /// How long to run, in seconds
        #[arg(short, long, default_value = "5")]
        seconds: u64,

        /// Telemetry interval per device, in milliseconds
        #[arg(short, long, default_value = "200")]
        interval_ms: u64,

        /// Telemetry payload size in bytes
        #[arg(short, long, default_value = "64")]
        payload_bytes: usize,

        /// Make the primary server fail for this many seconds
        #[arg(long)]
        fail_primary_secs: Option<u64>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Validate { format } => {
            let path = cli.config.ok_or("Agent file required for validate")?;
            commands::validate::run(&path, &format)?;
        }
        Commands::Simulate {
            seconds,
            interval_ms,
            payload_bytes,
            fail_primary_secs,
            format,
        } => {
            let path = cli.config.ok_or("Agent file required for simulate")?;
            let options = commands::simulate::SimulateOptions {
                seconds,
                interval_ms,
                payload_bytes,
                fail_primary_secs,
            };
            commands::simulate::run(&path, &options, &format)?;
        }
        Commands::Version => {
            println!("EdgeLink CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("EdgeLink protocol v{}", edgelink_protocol::PROTOCOL_VERSION);
        }
    }

    Ok(())
}
