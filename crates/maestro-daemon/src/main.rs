//! `maestrod` — watches local AI coding-agent CLIs and serves their
//! sessions, activity streams, and terminals to LAN clients over an
//! authenticated HTTP + WebSocket gateway.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use maestro_gateway::{Gateway, GatewayConfig, NoopLauncher};
use maestro_monitor::{AgentMonitor, MonitorConfig};
use tracing::info;

#[derive(Parser)]
#[command(name = "maestrod", about = "Remote gateway for local AI coding agents")]
struct Cli {
    /// Address to bind the HTTP/WebSocket listener on
    #[arg(long, env = "MAESTRO_BIND", default_value = "0.0.0.0")]
    bind: IpAddr,

    /// Listening port
    #[arg(long, env = "MAESTRO_PORT", default_value_t = maestro_gateway::DEFAULT_PORT)]
    port: u16,

    /// Directory for device registry, pairing state, and the token secret
    #[arg(long, env = "MAESTRO_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Fallback rescan interval for agent session directories, in ms
    #[arg(long, default_value_t = 5000)]
    scan_interval_ms: u64,

    /// Process table polling interval, in ms
    #[arg(long, default_value_t = 5000)]
    process_scan_interval_ms: u64,

    /// Seconds without activity before a session is marked idle
    #[arg(long, default_value_t = 30)]
    idle_threshold_secs: u64,
}

fn default_data_dir() -> anyhow::Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME is not set and --data-dir was not given")?;
    Ok(PathBuf::from(home).join(".maestro"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Respects RUST_LOG, defaults to info.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let data_dir = match cli.data_dir {
        Some(dir) => dir,
        None => default_data_dir()?,
    };

    let monitor = AgentMonitor::start(MonitorConfig {
        rescan_interval: Duration::from_millis(cli.scan_interval_ms),
        process_scan_interval: Duration::from_millis(cli.process_scan_interval_ms),
        idle_threshold: Duration::from_secs(cli.idle_threshold_secs),
        ..MonitorConfig::default()
    });

    let (gateway, mut space_commands) = Gateway::start(
        GatewayConfig {
            bind: SocketAddr::new(cli.bind, cli.port),
            data_dir,
        },
        Arc::clone(monitor.registry()),
        Arc::new(NoopLauncher),
    )
    .await
    .context("gateway failed to start")?;

    info!(addr = %gateway.local_addr(), "maestrod running");

    // Headless build: no host UI is attached, so space create requests are
    // drained and logged.
    let command_drain = tokio::spawn(async move {
        while let Some(command) = space_commands.recv().await {
            tracing::warn!(?command, "space command received but no host UI is attached");
        }
    });

    shutdown_signal().await;
    info!("shutdown signal received");

    // Gateway first (closes sockets, kills PTYs), then the monitor
    // (watchers, timers, maps).
    gateway.shutdown().await;
    monitor.stop().await;
    command_drain.abort();

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
