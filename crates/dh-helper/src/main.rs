//! devhost privileged helper
//!
//! Runs as root and performs the few system changes the daemon cannot:
//! trusting the local CA, installing daemon definitions and preparing
//! root-owned directories.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use dh_core::config::{self, DevhostConfig, HelperConfig};
use dh_helper::{HelperServer, SystemOps};

#[derive(Parser)]
#[command(name = "devhost-helper")]
#[command(about = "devhost privileged helper")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, env = "DEVHOST_CONFIG")]
    config: Option<PathBuf>,

    /// Helper socket path (overrides config)
    #[arg(long, env = "DEVHOST_HELPER_SOCKET")]
    socket: Option<PathBuf>,

    /// Additional uid allowed to connect (overrides config)
    #[arg(long)]
    allowed_uid: Option<u32>,

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

    tracing::info!("devhost helper starting...");

    // SAFETY: geteuid has no preconditions
    if unsafe { libc::geteuid() } != 0 {
        tracing::warn!("Not running as root; privileged requests will fail");
    }

    let helper_config = load_config(&args)?;
    let daemon_dir = helper_config.daemon_dir.clone();
    let server = Arc::new(HelperServer::new(
        helper_config,
        Arc::new(SystemOps::new(daemon_dir)),
    ));

    let cancel = CancellationToken::new();
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
            _ = ctrl_c => tracing::info!("Received Ctrl+C, initiating shutdown..."),
            _ = terminate => tracing::info!("Received SIGTERM, initiating shutdown..."),
        }

        cancel_clone.cancel();
    });

    server.run(cancel).await?;
    tracing::info!("devhost helper stopped");
    Ok(())
}

/// The helper section of the shared config file, with overrides applied
fn load_config(args: &Args) -> Result<HelperConfig> {
    let full: DevhostConfig = match &args.config {
        Some(path) => config::load_config(path)
            .with_context(|| format!("Failed to load config from {:?}", path))?,
        None => {
            let default_path = config::default_config_path();
            if default_path.exists() {
                config::load_config(&default_path).unwrap_or_else(|e| {
                    tracing::warn!("Failed to load config from {:?}: {}", default_path, e);
                    DevhostConfig::default()
                })
            } else {
                DevhostConfig::default()
            }
        }
    };

    let mut helper = full.helper;
    if let Some(socket) = &args.socket {
        helper.socket_path = socket.clone();
    }
    if args.allowed_uid.is_some() {
        helper.allowed_uid = args.allowed_uid;
    }
    Ok(helper)
}
