// The stores expose API surface beyond what the HTTP dispatcher reaches
// today (tag lookup, direct blob open).  Allow dead_code crate-wide until
// the full call graph is connected.
#![allow(dead_code)]

mod config;
mod digest;
mod error;
mod http;
mod metrics;
mod proxy;
mod reference;
mod registry;
mod scheduler;
mod storage;
mod upstream;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::metrics::MetricsRegistry;
use crate::proxy::ProxiedRegistry;
use crate::registry::LocalRegistry;
use crate::storage::FilesystemDriver;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "ocicache", about = "Pull-through caching registry proxy")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "/etc/ocicache/config.yaml")]
    config: String,
}

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

/// Global state shared across all request handlers.
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: ProxiedRegistry,
    pub metrics: MetricsRegistry,
}

// ---------------------------------------------------------------------------
// HTTP server (axum)
// ---------------------------------------------------------------------------

async fn run_http_server(state: Arc<AppState>) -> Result<()> {
    let listen_addr: std::net::SocketAddr = state
        .config
        .http_listen
        .parse()
        .context("invalid http_listen address")?;

    let app = http::handler::create_router(Arc::clone(&state));

    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {listen_addr}"))?;

    tracing::info!(%listen_addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // ---- CLI ----
    let cli = Cli::parse();

    // ---- Config ----
    let config = config::load_config(&cli.config)?;
    let config = Arc::new(config);

    // ---- Tracing ----
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    tracing::info!(config_path = %cli.config, "starting ocicache");

    // ---- Local storage ----
    tokio::fs::create_dir_all(&config.storage.rootdirectory)
        .await
        .with_context(|| {
            format!(
                "failed to create storage root: {}",
                config.storage.rootdirectory
            )
        })?;

    let driver = FilesystemDriver::new(&config.storage.rootdirectory)
        .await
        .context("failed to initialise filesystem driver")?;
    let local = LocalRegistry::new(Arc::new(driver));

    // ---- Upstream HTTP client ----
    let http_client = reqwest::Client::builder()
        .user_agent("ocicache/0.1")
        .build()
        .context("failed to build reqwest client")?;

    // ---- Metrics ----
    let metrics = MetricsRegistry::new();

    // ---- Proxied registry (scheduler + challenger + public scan) ----
    let registry =
        ProxiedRegistry::new(&config.proxy, local, http_client, metrics.clone()).await?;

    // ---- App state ----
    let state = Arc::new(AppState {
        config: Arc::clone(&config),
        registry,
        metrics,
    });

    // ---- Serve until shutdown ----
    run_http_server(Arc::clone(&state)).await?;

    // ---- Wind down: stop the scan and flush scheduler state ----
    state.registry.shutdown().await;

    tracing::info!("ocicache shut down cleanly");
    Ok(())
}
