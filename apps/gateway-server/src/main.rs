//! Gateway Server - standalone headless SDR client gateway process.
//!
//! Bridges a remote SDR server to local audio sinks and radio-control
//! protocols with no HTTP/REST surface, embedded UI, or persistent config
//! store of its own - those belong to whatever front-end a deployment wires
//! in front of the core this binary bootstraps.

mod config;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;

use crate::config::ServerConfig;

/// Gateway Server - headless SDR client gateway.
#[derive(Parser, Debug)]
#[command(name = "gateway-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (YAML).
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(short, long, default_value = "info", env = "GATEWAY_LOG_LEVEL")]
    log_level: log::LevelFilter,

    /// Upstream SDR server host (overrides config file).
    #[arg(long, env = "GATEWAY_HOST")]
    host: Option<String>,

    /// Upstream SDR server port (overrides config file).
    #[arg(short = 'p', long, env = "GATEWAY_PORT")]
    port: Option<u16>,

    /// Connect to the upstream server immediately on startup.
    #[arg(long)]
    auto_connect: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(args.log_level)
        .format_timestamp_millis()
        .init();

    log::info!("Gateway Server v{}", env!("CARGO_PKG_VERSION"));

    let config_path = args.config.clone();
    let mut config =
        ServerConfig::load(args.config.as_deref()).context("Failed to load configuration")?;

    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if args.auto_connect {
        config.auto_connect = true;
    }

    log::info!(
        "Configuration: host={}, port={}, auto_connect={}",
        config.host,
        config.port,
        config.auto_connect
    );

    let core_config = config.to_core_config();
    let core = gateway_core::bootstrap(core_config)
        .await
        .context("Failed to bootstrap gateway core")?;

    log::info!("Gateway core bootstrapped successfully");

    spawn_config_reload_listener(core.clone(), config_path);

    shutdown_signal().await;

    log::info!("Shutdown signal received, cleaning up...");

    core.shutdown().await;

    log::info!("Shutdown complete");
    Ok(())
}

/// Reloads configuration from the same file on SIGHUP and applies it to the
/// live core via `update_config` - this binary has no RPC/REST surface of
/// its own, so a reload signal is the only live-config-change entry point.
#[cfg(unix)]
fn spawn_config_reload_listener(core: gateway_core::BootstrappedCore, config_path: Option<PathBuf>) {
    tokio::spawn(async move {
        let mut hangup = match signal::unix::signal(signal::unix::SignalKind::hangup()) {
            Ok(s) => s,
            Err(e) => {
                log::warn!("failed to install SIGHUP handler, config reload disabled: {e}");
                return;
            }
        };
        loop {
            hangup.recv().await;
            log::info!("SIGHUP received, reloading configuration");
            match ServerConfig::load(config_path.as_deref()) {
                Ok(reloaded) => {
                    let core_config = reloaded.to_core_config();
                    core.session
                        .update_config(|config| *config = core_config)
                        .await;
                    log::info!("configuration reloaded");
                }
                Err(e) => log::warn!("config reload failed: {e}"),
            }
        }
    });
}

#[cfg(not(unix))]
fn spawn_config_reload_listener(_core: gateway_core::BootstrappedCore, _config_path: Option<PathBuf>) {}

/// Waits for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
