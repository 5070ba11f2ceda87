//! ParcelTrack tracker service.
//!
//! Single process hosting the REST API, the auto-update scheduler, the
//! email ingestion daemon and the cache sweeper. Shipment state lives in
//! an embedded SQLite store; carrier access goes through the client
//! factory (API, headless browser or scraping per configuration).

mod admin;
mod cache;
mod email;
mod error;
mod handlers;
mod refresh;
mod routes;
mod updater;

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use parceltrack_carriers::ClientFactory;
use parceltrack_core::Config;
use parceltrack_store::Store;

use cache::CacheManager;
use email::{EmailIngestor, ImapMailClient};
use refresh::RefreshEngine;
use updater::TrackingUpdater;

pub use error::{Error, Result};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub config: Arc<Config>,
    pub factory: Arc<ClientFactory>,
    pub cache: Arc<CacheManager>,
    pub engine: Arc<RefreshEngine>,
    pub updater: Arc<TrackingUpdater>,
    pub email: Option<Arc<EmailIngestor>>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting ParcelTrack tracker service");

    let config = Arc::new(Config::from_env()?);
    let store = Store::connect(&config.database.path).await?;

    let cache = Arc::new(CacheManager::new(
        store.clone(),
        config.cache.ttl(),
        config.cache.disabled,
    ));
    // Expired persisted rows are dropped before the service takes traffic
    let purged = cache.purge_expired().await;
    if purged > 0 {
        info!(purged, "Purged expired cache rows at startup");
    }

    let factory = Arc::new(ClientFactory::new(&config.carriers));
    let engine = Arc::new(RefreshEngine::new(
        store.clone(),
        cache.clone(),
        factory.clone(),
        config.clone(),
    ));
    let updater = Arc::new(TrackingUpdater::new(
        store.clone(),
        cache.clone(),
        engine.clone(),
        factory.clone(),
        config.clone(),
    ));

    let shutdown = CancellationToken::new();
    let mut workers: Vec<JoinHandle<()>> = vec![cache.clone().spawn_sweeper(shutdown.clone())];

    if config.auto_update.enabled {
        workers.push(updater.clone().spawn(shutdown.clone()));
    } else {
        info!("Auto-update scheduler disabled by configuration");
    }

    let email = if config.email.enabled {
        let mail = Arc::new(ImapMailClient::new(config.email.clone())?);
        let mut ingestor = EmailIngestor::new(store.clone(), engine.clone(), mail, config.clone());
        // Email state may live in its own file, isolated from the shipments
        if let Some(state_path) = &config.email.state_db_path {
            ingestor = ingestor.with_state_store(Store::connect(state_path).await?);
        }
        let ingestor = Arc::new(ingestor);
        // A broken mailbox or store is a fatal misconfiguration
        ingestor
            .health_check()
            .await
            .map_err(|e| anyhow::anyhow!("email ingestion pre-start check failed: {e}"))?;
        workers.push(ingestor.clone().spawn(shutdown.clone()));
        Some(ingestor)
    } else {
        None
    };

    let state = AppState {
        store: store.clone(),
        config: config.clone(),
        factory,
        cache,
        engine,
        updater,
        email,
    };
    let app = routes::create_router(state);

    let bind_address = config.bind_address();
    let listener = TcpListener::bind(&bind_address).await?;
    info!(address = %bind_address, "Tracker listening");

    let serve_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            wait_for_shutdown().await;
            info!("Shutdown signal received, draining");
            serve_shutdown.cancel();
        })
        .await?;

    // Background workers finish their in-flight tick within the grace period
    let grace = Duration::from_secs(config.server.shutdown_grace_secs);
    let drain = async {
        for worker in workers {
            let _ = worker.await;
        }
    };
    if tokio::time::timeout(grace, drain).await.is_err() {
        warn!(grace_secs = grace.as_secs(), "Workers did not drain in time");
    }

    store.close().await;
    info!("Shutdown complete");
    Ok(())
}

async fn wait_for_shutdown() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("Failed to listen for Ctrl+C");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to listen for SIGTERM")
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
