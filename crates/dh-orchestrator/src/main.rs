//! devhost daemon
//!
//! Supervises local service instances, keeps the reverse proxy and the DNS
//! responder in step with the registry, and serves the control socket.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use dh_core::config::{self, DevhostConfig};
use dh_core::pidfile::PidFileGuard;
use dh_core::DevhostError;
use dh_orchestrator::ipc::IpcServer;
use dh_orchestrator::OrchestratorState;

#[derive(Parser)]
#[command(name = "devhost")]
#[command(about = "devhost daemon - local services, domains and DNS")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, env = "DEVHOST_CONFIG")]
    config: Option<PathBuf>,

    /// Data directory (overrides config)
    #[arg(long, env = "DEVHOST_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Local top-level domain (overrides config)
    #[arg(long)]
    tld: Option<String>,

    /// DNS responder bind address (overrides config)
    #[arg(long)]
    dns_bind: Option<SocketAddr>,

    /// Control socket path (overrides config)
    #[arg(long, env = "DEVHOST_SOCKET")]
    socket: Option<PathBuf>,

    /// Run in foreground with verbose output
    #[arg(short, long)]
    foreground: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Do not start the DNS responder
    #[arg(long)]
    no_dns: bool,

    /// Do not render or reload the reverse proxy
    #[arg(long)]
    no_proxy: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.foreground { "debug" } else { &args.log_level };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("devhost daemon starting...");

    let config = load_config(&args)?;
    tokio::fs::create_dir_all(&config.data_dir)
        .await
        .with_context(|| format!("Failed to create data directory {:?}", config.data_dir))?;

    let _pid_guard = PidFileGuard::acquire(config.pid_file_path())
        .context("Refusing to start a second daemon")?;

    let socket_path = config.ipc_socket_path();
    let dns_enabled = config.dns.enabled;
    let state = Arc::new(
        OrchestratorState::new(config)
            .await
            .context("Failed to initialise orchestrator state")?,
    );

    state.recover().await.context("Failed to recover state")?;

    if dns_enabled {
        match state.dns.start().await {
            Ok(status) => tracing::debug!("DNS status: {:?}", status),
            Err(DevhostError::PortInUse(addr)) => {
                tracing::warn!("DNS port {} is in use; continuing without DNS", addr);
            }
            Err(e) => return Err(e).context("Failed to start DNS responder"),
        }
    }

    // Create cancellation token for graceful shutdown
    let cancel = CancellationToken::new();

    // Setup signal handlers
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    tracing::error!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("Received Ctrl+C, initiating shutdown...");
            }
            _ = terminate => {
                tracing::info!("Received SIGTERM, initiating shutdown...");
            }
        }

        cancel_clone.cancel();
    });

    let background = state.spawn_background(cancel.clone());

    let server = IpcServer::new(socket_path, Arc::clone(&state)).with_shutdown_token(cancel.clone());
    let served = server.run().await;
    cancel.cancel();

    for task in background {
        if let Err(e) = task.await {
            tracing::warn!("Background task ended abnormally: {}", e);
        }
    }
    state.shutdown().await;
    served?;

    tracing::info!("devhost shutdown complete");
    Ok(())
}

/// Load the config file (or defaults) and apply command-line overrides
fn load_config(args: &Args) -> Result<DevhostConfig> {
    let mut config = if let Some(config_path) = &args.config {
        config::load_config(config_path)
            .with_context(|| format!("Failed to load config from {:?}", config_path))?
    } else {
        let default_path = config::default_config_path();
        if default_path.exists() {
            config::load_config(&default_path).unwrap_or_else(|e| {
                tracing::warn!("Failed to load config from {:?}: {}", default_path, e);
                DevhostConfig::default()
            })
        } else {
            tracing::info!("Using default configuration");
            DevhostConfig::default()
        }
    };

    if let Some(data_dir) = &args.data_dir {
        config.data_dir = data_dir.clone();
    }
    if let Some(tld) = &args.tld {
        config.tld = tld.trim_matches('.').to_string();
    }
    if let Some(bind) = args.dns_bind {
        config.dns.bind = bind;
    }
    if let Some(socket) = &args.socket {
        config.ipc_socket = Some(socket.clone());
    }
    if args.no_dns {
        config.dns.enabled = false;
    }
    if args.no_proxy {
        config.proxy.enabled = false;
    }

    config.validate().context("Invalid configuration")?;
    Ok(config)
}
