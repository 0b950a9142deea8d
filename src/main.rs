use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use ratewarden::clock::{SharedClock, SystemClock};
use ratewarden::config::{LogFormat, LoggingConfig, RatewardenConfig, StoreBackend};
use ratewarden::http::{AppState, HttpServer};
use ratewarden::ratelimit::RateLimiter;
use ratewarden::registry::{NodeRegistry, RegistryConfig};
use ratewarden::store::{MemoryStore, RedisStore, StateStore};

#[derive(Parser, Debug)]
#[command(name = "ratewarden")]
#[command(about = "Sliding-window rate limiting node", version)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Override the configured node id
    #[arg(long)]
    node_id: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = RatewardenConfig::load(args.config.as_deref())?;
    if let Some(node_id) = args.node_id {
        config.node.node_id = node_id;
    }

    init_tracing(&config.logging);

    info!("Starting Ratewarden Rate Limiting Service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(
        node_id = %config.node.node_id,
        http_addr = %config.server.http_addr,
        backend = ?config.store.backend,
        "Configuration loaded"
    );

    let clock: SharedClock = Arc::new(SystemClock);

    let store: Arc<dyn StateStore> = match config.store.backend {
        StoreBackend::Redis => Arc::new(
            RedisStore::connect(&config.store.url, config.store.connection_count).await?,
        ),
        StoreBackend::Memory => {
            warn!("Using the in-memory store; limits are only exact within this node");
            Arc::new(MemoryStore::new(clock.clone()))
        }
    };

    let rate_limiter = Arc::new(RateLimiter::new(
        store.clone(),
        clock.clone(),
        &config.rate_limiting,
    ));
    info!("Rate limiter initialized");

    let registry = Arc::new(NodeRegistry::new(
        store.clone(),
        clock,
        RegistryConfig::from_config(&config),
    ));
    if let Err(e) = registry.register().await {
        // The heartbeat loop registers on its next tick.
        warn!(error = %e, "Initial node registration failed");
    }
    let heartbeat = registry.spawn_heartbeat();

    let state = AppState::new(rate_limiter, store, &config);
    let http_server = HttpServer::new(config.server.http_addr, state);

    // Run the server with graceful shutdown on Ctrl+C
    let served = http_server.serve_with_shutdown(shutdown_signal()).await;

    if let Err(e) = heartbeat.stop().await {
        error!(error = %e, "Heartbeat task did not stop cleanly");
    }

    served?;
    info!("Ratewarden Rate Limiting Service stopped");
    Ok(())
}

/// Initialize tracing. `RUST_LOG` takes precedence over the configured level.
fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    match logging.format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init(),
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init(),
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
