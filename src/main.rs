//! Nonce Keeper - nonce allocation and pending transaction supervision
//!
//! Allocates collision-free nonces for wallet accounts and watches broadcast
//! transactions until they are confirmed or failed.

use anyhow::Result;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};

use nonce_keeper::api::{self, AppState};
use nonce_keeper::chain::{BlockListener, EthProvider};
use nonce_keeper::config::Settings;
use nonce_keeper::metrics::{self, MetricsServer};
use nonce_keeper::state::InMemoryStore;
use nonce_keeper::tx::{NonceAllocator, PendingTxSupervisor, SubmissionTracker};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    info!("Starting Nonce Keeper v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let settings = Settings::load()?;
    info!(
        "Loaded configuration for chain {} ({} RPC URLs)",
        settings.network.chain_id,
        settings.network.rpc_urls.len()
    );

    let provider = Arc::new(EthProvider::new(settings.network.clone())?);
    let store = Arc::new(InMemoryStore::new());

    let allocator = Arc::new(NonceAllocator::new(
        store.clone(),
        provider.clone(),
        settings.keeper.rpc_timeout(),
        settings.keeper.block_wait_timeout(),
    ));

    let supervisor = Arc::new(PendingTxSupervisor::new(
        store.clone(),
        provider.clone(),
        provider.clone(),
        provider.clone(),
        settings.keeper.clone(),
    ));

    let tracker = Arc::new(SubmissionTracker::new(
        allocator.clone(),
        store.clone(),
        provider.clone(),
        settings.keeper.rpc_timeout(),
    ));

    let listener = Arc::new(BlockListener::new(
        provider.clone(),
        std::time::Duration::from_millis(settings.network.poll_interval_ms),
    ));

    // Apply supervisor outcomes to the store
    let sink_handle = tokio::spawn({
        let store = store.clone();
        let events = supervisor.subscribe();
        async move { store.run_event_sink(events).await }
    });

    // Start block listener
    let listener_handle = tokio::spawn({
        let listener = listener.clone();
        async move { listener.listen().await }
    });

    // Start supervisor
    let supervisor_handle = tokio::spawn({
        let supervisor = supervisor.clone();
        async move { supervisor.run().await }
    });

    // Start API server
    let api_handle = tokio::spawn({
        let config = settings.api.clone();
        let state = AppState {
            provider: provider.clone(),
            store: store.clone(),
            allocator: allocator.clone(),
            tracker: tracker.clone(),
        };
        async move {
            if let Err(e) = api::run_server(config, state).await {
                error!("API server error: {}", e);
            }
        }
    });

    // Start metrics server
    let metrics_handle = if settings.metrics.enabled {
        let server = MetricsServer::new(settings.metrics.port);
        Some(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        }))
    } else {
        None
    };

    // Health check loop
    let health_handle = tokio::spawn({
        let provider = provider.clone();
        let interval = settings.keeper.health_check_interval_secs.max(1);
        async move {
            loop {
                tokio::time::sleep(tokio::time::Duration::from_secs(interval)).await;
                metrics::record_health_check(provider.health_check().await);
            }
        }
    });

    info!("Nonce Keeper is running");
    info!("API server: http://{}:{}", settings.api.host, settings.api.port);
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    // Graceful shutdown
    supervisor.stop();
    listener.stop();

    // Abort background tasks
    api_handle.abort();
    listener_handle.abort();
    supervisor_handle.abort();
    sink_handle.abort();
    health_handle.abort();
    if let Some(h) = metrics_handle {
        h.abort();
    }

    info!("Nonce Keeper stopped");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,nonce_keeper=debug,hyper=warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
