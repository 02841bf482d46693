//! # Teltonika Gateway
//!
//! Accept Teltonika GPS trackers over TCP or UDP, acknowledge their telemetry,
//! and let an operator send commands and files from the console.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};

use teltonika_gateway::config::Config;
use teltonika_gateway::console::run_console;
use teltonika_gateway::logging;
use teltonika_gateway::server::Gateway;
use teltonika_gateway::telemetry::TelemetryLogger;

/// Teltonika Gateway - telemetry, commands and file transfer for Teltonika trackers
#[derive(Parser, Debug)]
#[command(name = "teltonika-gateway", version, about)]
struct Args {
    /// Configuration file path (defaults are used when it does not exist)
    #[arg(default_value = "config/default.toml")]
    config: PathBuf,
}

/// Main entry point for the gateway
///
/// # Control Flow
///
/// 1. **Initialization**
///    - Load configuration (first argument, or `config/default.toml`)
///    - Set up console and file logging
///    - Start the telemetry recorder when enabled
///
/// 2. **Main Loop**
///    - Accept devices and run one session task per device
///    - Read operator commands from stdin
///    - Handle Ctrl+C for graceful shutdown
///
/// # Errors
///
/// Returns error if:
/// - The config file exists but is invalid
/// - The listen address cannot be bound
/// - The telemetry directory cannot be created
///
/// # Examples
///
/// ```bash
/// cargo run --release -- config/default.toml
/// ```
#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let (config, config_found) = Config::load_or_default(&args.config)
        .with_context(|| format!("Failed to load config from {}", args.config.display()))?;

    let _log_guard = logging::init(&config.logging);

    info!("Teltonika Gateway v{} starting...", env!("CARGO_PKG_VERSION"));
    if !config_found {
        warn!("Config file {} not found, using defaults", args.config.display());
    }

    let gateway = Gateway::from_config(config);

    if gateway.config().telemetry.enabled {
        let recorder = TelemetryLogger::new(&gateway.config().telemetry)
            .context("Failed to start telemetry recorder")?;
        tokio::spawn(recorder.run(gateway.events().subscribe()));
    }

    let listener = gateway.bind().await.context("Failed to bind listener")?;
    info!(
        "Listening on {} ({:?}), type 'help' for commands",
        listener.local_addr()?,
        gateway.config().server.protocol
    );

    tokio::spawn(run_console(gateway.clone()));

    tokio::select! {
        result = gateway.serve(listener) => {
            if let Err(e) = result {
                error!("Listener stopped: {}", e);
                return Err(e.into());
            }
        }

        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
            info!("Disconnecting {} devices", gateway.registry().online_count());
            for device in gateway.devices().iter().filter(|d| d.online) {
                let _ = gateway.kick(&device.imei);
            }
        }
    }

    Ok(())
}
