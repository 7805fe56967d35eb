//! Code Sync Proxy - Relay Daemon
//!
//! Pairs IDE clients with deployment sidecars over two WebSocket endpoints
//! and relays code pushes, push results and verification requests between
//! them.

mod collaborators;
mod config;
mod error;
mod http_api;
mod manager;
mod registry;
mod standalone;
mod store;
mod transport;

#[cfg(test)]
mod test_support;

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use collaborators::Collaborators;
use config::{CliOverrides, ProxyConfig};
use manager::ConnectionManager;
use registry::ConnectionRegistry;

/// How long shutdown waits for receive loops to release their claims.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "cspd")]
#[command(author, version, about = "Code sync proxy - IDE/sidecar WebSocket relay")]
struct Cli {
    /// Address to listen on (overrides CSP_BIND_ADDR)
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// Worker identity (overrides CSP_WORKER_ID)
    #[arg(long)]
    worker_id: Option<String>,

    /// Use the Redis connection store
    #[arg(long)]
    redis: bool,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = ProxyConfig::from_env()?;
    config.apply_cli(&CliOverrides {
        bind: cli.bind,
        worker_id: cli.worker_id,
        redis: cli.redis,
        verbose: cli.verbose,
    });

    init_logging(&config.log_level.value, config.log_json.value);

    info!("Starting code sync proxy...");
    config.log_summary();

    let store = store::connect_store(&config.store.value, config.connection_ttl.value)
        .await
        .context("Failed to initialize connection store")?;

    let manager = Arc::new(ConnectionManager::new(
        config.worker_id.value.clone(),
        Arc::new(ConnectionRegistry::new()),
        store,
        Collaborators::standalone(),
    ));

    let listener = tokio::net::TcpListener::bind(config.bind_addr.value)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_addr.value))?;

    let state = http_api::HttpState {
        manager: Arc::clone(&manager),
        version: env!("CARGO_PKG_VERSION"),
        started_at: Instant::now(),
    };

    // Sockets are closed before the server stops waiting on connections.
    let shutdown_manager = Arc::clone(&manager);
    let shutdown = async move {
        shutdown_signal().await;
        info!("Shutdown signal received, closing connections");
        shutdown_manager.shutdown(SHUTDOWN_GRACE).await;
    };

    http_api::serve(listener, state, shutdown).await?;
    info!("Code sync proxy stopped");
    Ok(())
}

fn init_logging(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Failed to listen for Ctrl+C: {}", e);
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
                tracing::warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
