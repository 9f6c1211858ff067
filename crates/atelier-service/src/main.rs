//! Atelier credits service - HTTP API for credits, billing webhooks and resets.

use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use atelier_service::{create_router, spawn_reset_scheduler, AppState, ServiceConfig};
use atelier_store::{PgStore, Store};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,atelier=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting atelier credits service");

    let config = ServiceConfig::from_env();

    tracing::info!(
        listen_addr = %config.listen_addr,
        postgres = %config.database_url.is_some(),
        data_dir = %config.data_dir,
        webhook_secret_configured = %config.webhook_secret.is_some(),
        notifier_configured = %config.notifier_url.is_some(),
        reset_scheduler = %config.reset_scheduler_enabled,
        "Service configuration loaded"
    );

    let store = open_store(&config).await?;

    let state = AppState::new(store, config.clone());

    if config.reset_scheduler_enabled {
        tracing::info!("Starting in-process monthly reset scheduler");
        spawn_reset_scheduler(state.clone());
    }

    let app = create_router(state);
    tracing::info!("Router configured with all API endpoints");

    tracing::info!(listen_addr = %config.listen_addr, "Starting HTTP server");
    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// PostgreSQL when `DATABASE_URL` is set, otherwise RocksDB, otherwise memory.
async fn open_store(config: &ServiceConfig) -> Result<Arc<dyn Store>, Box<dyn std::error::Error>> {
    if let Some(url) = &config.database_url {
        tracing::info!("Connecting to PostgreSQL");
        let store = PgStore::connect(url).await?;
        store.migrate().await?;
        return Ok(Arc::new(store));
    }

    #[cfg(feature = "rocksdb-backend")]
    {
        tracing::info!(path = %config.data_dir, "Opening RocksDB store");
        Ok(Arc::new(atelier_store::RocksStore::open(&config.data_dir)?))
    }

    #[cfg(not(feature = "rocksdb-backend"))]
    {
        tracing::warn!("No persistent store configured - using in-memory ledger");
        Ok(Arc::new(atelier_store::MemoryStore::new()))
    }
}
