//! player-sync node daemon.
//!
//! Usage:
//!   # Run one node against the configured Redis
//!   player-sync run --config player-sync.toml
//!
//!   # Validate a config file and print the effective settings
//!   player-sync check-config --config player-sync.toml

use anyhow::Context;
use clap::{Parser, Subcommand};
use player_sync::bus::RedisBus;
use player_sync::sync::LockDenial;
use player_sync::{Config, NodeId, SyncError, SyncOrchestrator};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// How often the daemon logs cluster membership.
const MEMBERSHIP_LOG_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser, Debug)]
#[command(name = "player-sync", version, about = "Cross-node player state synchronization")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start a sync node and run until Ctrl+C
    Run {
        /// Path to the TOML config file
        #[arg(short, long, default_value = "player-sync.toml")]
        config: PathBuf,
    },
    /// Load and validate a config file, then print it
    CheckConfig {
        #[arg(short, long, default_value = "player-sync.toml")]
        config: PathBuf,
    },
}

fn init_tracing(fallback: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(fallback));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::CheckConfig { config } => {
            let config = Config::load_from_path(&config)
                .with_context(|| format!("failed to load {}", config.display()))?;
            print!("{}", config.to_redacted_toml());
            Ok(())
        }
        Command::Run { config: path } => {
            let config = Config::load_from_path(&path)
                .with_context(|| format!("failed to load {}", path.display()))?;
            init_tracing(&config.logging.filter);
            run(config).await
        }
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    let node_id = NodeId::resolve(config.node.id.as_deref());
    let bus = Arc::new(RedisBus::new(&config.sync)?);
    let node = SyncOrchestrator::new(config.sync.clone(), node_id, bus);

    node.on_lock_denied(Arc::new(|denial: &LockDenial| {
        let err = SyncError::from(denial.clone());
        tracing::info!(kind = err.kind(), "{err}");
    }));

    if !node.start().await {
        tracing::warn!("Starting in single-node mode; will keep retrying the bus");
    }

    let shutdown = wait_for_shutdown_signal();
    tokio::pin!(shutdown);
    let mut ticker = tokio::time::interval(MEMBERSHIP_LOG_INTERVAL);
    ticker.tick().await;
    loop {
        tokio::select! {
            () = &mut shutdown => break,
            _ = ticker.tick() => {
                let live = node.heartbeat().live_nodes();
                tracing::info!(
                    node = %node.node_id(),
                    degraded = node.is_degraded(),
                    held = node.held_players().len(),
                    live = live.len(),
                    peers = ?live.iter().map(NodeId::as_str).collect::<Vec<_>>(),
                    "Cluster membership"
                );
            }
        }
    }

    tracing::info!("Shutdown signal received");
    node.shutdown().await;
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM.
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
