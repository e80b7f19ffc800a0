//! fleetsync daemon
//!
//! Serves the sync and tunnel routes of the orchestration engine over axum.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use color_eyre::Result;
use fleetsync_client::HttpClient;
use fleetsync_core::{Collaborators, EngineActor, EngineArgs, MemoryStore, StaticInventory};
use kameo::actor::Spawn;
use tokio::sync::broadcast;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod api;
mod bus;
mod config;
mod router;
mod state;

use crate::bus::{HttpBus, HttpNotifier};
use crate::config::{Config, DaemonConfig, LogFormat};
use crate::state::AppState;

/// Fan-out/fan-in command orchestration daemon
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// Configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Address to bind, overrides the configuration file
    #[arg(short, long)]
    bind: Option<String>,
}

fn init_tracing(daemon: &DaemonConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&daemon.log_level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match daemon.log_format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.init(),
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default()?,
    };
    if let Some(bind) = cli.bind {
        config.daemon.bind = bind;
    }
    init_tracing(&config.daemon);

    let client = bus::http_client(&config)?;
    let collaborators = Collaborators {
        store: Arc::new(MemoryStore::new()),
        bus: Arc::new(HttpBus::new(&config, &client)?),
        inventory: Arc::new(StaticInventory::new(config.host.clone())),
        notifier: Arc::new(HttpNotifier::new(HttpClient::with_client(
            &config.daemon.public_url,
            client,
        )?)),
    };

    let (event_tx, _) = broadcast::channel(config.engine.event_channel_capacity);
    let engine = EngineActor::spawn(EngineArgs {
        config: Arc::new(config.engine.clone()),
        collaborators,
        event_tx,
    });

    let bind = config.daemon.bind.clone();
    info!(
        bind = %bind,
        hosts = config.host.len(),
        tunnels = config.tunnel_urls().len(),
        "fleetsync daemon starting"
    );

    let state = Arc::new(AppState::new(engine.clone(), config));
    let app = router::create_router(state);
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("fleetsync daemon stopping");
    engine.stop_gracefully().await.ok();
    Ok(())
}
