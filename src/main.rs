//! Edge listener (v1)
//!
//! Serves a demo application that echoes the effective request metadata on
//! every configured listener.
//!
//! # Architecture Overview
//!
//! ```text
//!                  ┌──────────────────────────────────────────────────────┐
//!                  │                    EDGE LISTENER                      │
//!                  │                                                       │
//!   Client ────────┼─▶ net (bind, admit, TLS) ─▶ http (hyper, middleware)  │
//!                  │                                    │                  │
//!                  │                                    ▼                  │
//!                  │            forwarding (trust decision, headers)       │
//!                  │                                    │                  │
//!                  │                                    ▼                  │
//!                  │                         application router            │
//!                  │                                                       │
//!                  │  lifecycle (start / stop / rotate)   config (reload)  │
//!                  │  observability (tracing, metrics)                     │
//!                  └──────────────────────────────────────────────────────┘
//! ```

use std::path::{Path, PathBuf};

use clap::Parser;

use edge_listener::config::{load_config, ConfigWatcher, ServerConfig};
use edge_listener::http::echo;
use edge_listener::lifecycle::{startup, SignalEvent, Signals};
use edge_listener::observability::{logging, metrics};
use edge_listener::ServerLifecycleManager;

#[derive(Debug, Parser)]
#[command(name = "edge-listener", version, about = "Edge HTTP listener")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "edge-listener.toml")]
    config: PathBuf,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = load_config(&args.config)?;

    logging::init(&config.observability);
    tracing::info!(config = %args.config.display(), "edge-listener v{} starting", env!("CARGO_PKG_VERSION"));

    let runtime = startup::build_runtime(&config.runtime)?;
    runtime.block_on(run(&args.config, config))
}

async fn run(path: &Path, config: ServerConfig) -> Result<(), Box<dyn std::error::Error>> {
    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let manager = ServerLifecycleManager::new();
    start(&manager, &config).await?;

    let (watcher, mut updates) = ConfigWatcher::new(path);
    let _watcher = match watcher.run() {
        Ok(watcher) => Some(watcher),
        Err(e) => {
            tracing::warn!(error = %e, "Config watcher unavailable, hot reload disabled");
            None
        }
    };

    let mut signals = Signals::install()?;
    let mut current = config;

    loop {
        tokio::select! {
            event = signals.recv() => match event {
                SignalEvent::Shutdown => break,
                SignalEvent::Reload => match load_config(path) {
                    Ok(next) => reload(&manager, &mut current, next).await,
                    Err(e) => tracing::error!(error = %e, "Failed to reload config, keeping current configuration"),
                },
            },
            Some(next) = updates.recv() => reload(&manager, &mut current, next).await,
        }
    }

    manager.stop().await?;
    tracing::info!("Shutdown complete");
    Ok(())
}

async fn start(manager: &ServerLifecycleManager, config: &ServerConfig) -> Result<(), Box<dyn std::error::Error>> {
    let app = startup::server_app(config, echo::router(), Some(echo::management_router()))?;
    manager.start(startup::listener_set(config), app).await?;
    Ok(())
}

/// Replace the running generation with one built from `next`. When the new
/// generation cannot start, the previous configuration is brought back.
async fn reload(manager: &ServerLifecycleManager, current: &mut ServerConfig, next: ServerConfig) {
    if *current == next {
        tracing::debug!("Configuration unchanged, skipping reload");
        return;
    }
    if current.runtime != next.runtime || current.observability != next.observability {
        tracing::warn!("Runtime and observability settings only apply after a restart");
    }

    if let Err(e) = manager.stop().await {
        tracing::error!(error = %e, "Stopping the previous generation failed");
    }

    match start(manager, &next).await {
        Ok(()) => {
            tracing::info!("Configuration reloaded");
            *current = next;
        }
        Err(e) => {
            tracing::error!(error = %e, "New configuration failed to start, restoring previous one");
            if let Err(e) = start(manager, current).await {
                tracing::error!(error = %e, "Previous configuration failed to start as well");
            }
        }
    }
}
