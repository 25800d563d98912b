//! sqltunnel daemon
//!
//! Accepts tunnel commands on a loopback port and forwards local ports to
//! MySQL servers through SSH.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use st_core::config::{self, DaemonConfig};
use st_daemon::control::ControlServer;
use st_daemon::expiry::run_expiry_monitor;
use st_daemon::ssh::{RusshConnector, SshConnector};
use st_daemon::{AppStatus, DaemonState, StatusManager, TunnelOrchestrator};

#[derive(Parser)]
#[command(name = "sqltunneld")]
#[command(about = "Forward local ports to MySQL servers over SSH")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Control port (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Run in foreground with verbose output
    #[arg(short, long)]
    foreground: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.foreground { "debug" } else { &args.log_level };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("sqltunnel daemon starting...");

    let mut config = if let Some(config_path) = &args.config {
        config::load_config(config_path)
            .with_context(|| format!("Failed to load config from {:?}", config_path))?
    } else {
        let default_path = config::default_config_path();
        if default_path.exists() {
            config::load_config(&default_path).unwrap_or_else(|e| {
                tracing::warn!("Failed to load config from {:?}: {}", default_path, e);
                DaemonConfig::default()
            })
        } else {
            tracing::info!("Using default configuration");
            DaemonConfig::default()
        }
    };

    if let Some(port) = args.port {
        config.listen_port = port;
    }
    config.validate().context("Invalid configuration")?;

    tracing::info!(
        "Tunnel ports {}..{}, expiry {:?}",
        config.min_port_range,
        config.max_port_range,
        config.tunnel_expiration
    );

    let daemon = Arc::new(DaemonState::new(config));
    let connector: Arc<dyn SshConnector> =
        Arc::new(RusshConnector::new(daemon.config.connect_timeout));
    let orchestrator = Arc::new(TunnelOrchestrator::new(Arc::clone(&daemon), connector));

    tokio::spawn(watch_signals(Arc::clone(&daemon.status)));

    let monitor = tokio::spawn(run_expiry_monitor(Arc::clone(&daemon)));

    let server = ControlServer::new(orchestrator);
    let listener = server.bind().await?;
    daemon.status.set(AppStatus::Running);

    let result = server.serve(listener).await;

    daemon.status.set(AppStatus::Stopping);
    let closed = daemon.close_all_tunnels();
    if closed > 0 {
        tracing::info!("Closed {} active tunnels", closed);
    }

    if let Err(e) = monitor.await {
        tracing::warn!("Expiry monitor ended abnormally: {}", e);
    }

    tracing::info!("sqltunnel daemon shutdown complete");
    result
}

/// First Ctrl+C or SIGTERM starts a graceful shutdown; a second Ctrl+C
/// exits immediately.
async fn watch_signals(status: Arc<StatusManager>) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown...");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown...");
        }
    }

    status.set(AppStatus::Stopping);

    if tokio::signal::ctrl_c().await.is_ok() {
        tracing::warn!("Received second Ctrl+C, exiting immediately");
        std::process::exit(130);
    }
}
