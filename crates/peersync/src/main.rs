#![warn(missing_docs)]

//! peersyncd: replication daemon.

use anyhow::Result;
use clap::Parser;
use peersync::{
    copier_from_config, dump_watched_paths, load_items, DaemonConfig, JsonStatusStore,
    StaticRoleProvider, SyncOrchestrator, SyncStatus,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Replicate configured files and directories to the redundant peer.
#[derive(Debug, Parser)]
#[command(name = "peersyncd", version, about)]
struct Args {
    /// Daemon config file (TOML or JSON).
    #[arg(
        short,
        long,
        env = "PEERSYNC_CONFIG",
        default_value = "/etc/peersync/peersyncd.toml"
    )]
    config: PathBuf,

    /// Start with sync disabled regardless of the config file.
    #[arg(long)]
    disable_sync: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    tracing::info!("peersyncd starting...");

    let mut config = if args.config.exists() {
        DaemonConfig::from_file(&args.config)?
    } else {
        tracing::warn!(
            "Config file not found, using defaults: {}",
            args.config.display()
        );
        DaemonConfig::default()
    };
    if args.disable_sync {
        config.disable_sync = true;
    }

    let items = load_items(&config.config_dir);
    tracing::info!(
        "Loaded {} replication items from {}",
        items.len(),
        config.config_dir.display()
    );

    let store = Arc::new(JsonStatusStore::new(config.status_file.clone()));
    let status = Arc::new(SyncStatus::restore(store, config.disable_sync));
    let role = Arc::new(StaticRoleProvider::new(config.role, config.redundancy_enabled));
    let copier = copier_from_config(&config.transfer);
    let orchestrator = SyncOrchestrator::new(
        config.orchestrator_settings(),
        items,
        role,
        copier,
        status,
    );

    let runner = Arc::clone(&orchestrator);
    tokio::spawn(async move {
        runner.run().await;
    });

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut dump = signal(SignalKind::user_defined1())?;
    let mut full_sync = signal(SignalKind::user_defined2())?;

    loop {
        tokio::select! {
            _ = interrupt.recv() => break,
            _ = terminate.recv() => break,
            _ = dump.recv() => {
                let registry = orchestrator.registry();
                if let Err(e) = dump_watched_paths(&registry, &config.watched_paths_dump).await {
                    tracing::error!("Failed to dump watched paths: {}", e);
                }
            }
            _ = full_sync.recv() => {
                if let Err(e) = orchestrator.request_full_sync() {
                    tracing::warn!("Full sync request rejected: {}", e);
                }
            }
        }
    }

    orchestrator.shutdown();
    tracing::info!("peersyncd stopped");
    Ok(())
}
