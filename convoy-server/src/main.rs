//! Convoy Server - Headless Sync Coordinator
//!
//! Every container of a fleet runs this daemon against the same Postgres
//! instance. They elect a leader through a lease table; the leader drains
//! the sync job queue while the followers sit hot, serving reads and
//! answering the status API. Kill the leader and a follower takes over
//! within the lease TTL.

use anyhow::{Context, Result};
use axum::routing::get;
use axum::Router;
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod api;
mod cli;
mod state;

#[cfg(test)]
mod test_helpers;

use convoy_core::conflict::ConflictResolver;
use convoy_core::coordinator::SyncCoordinator;
use convoy_core::election::LeaderElector;
use convoy_core::state::StateManager;
use convoy_core::store::{
    self, EntityStore, LeaseStore, MemoryEntityStore, MemoryLeaseStore, PgEntityStore, PgLeaseStore,
};
use convoy_core::metrics;
use state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = cli::Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    let config = cli.coordinator_config();
    config
        .validate()
        .context("invalid coordinator configuration")?;

    info!(
        node = %config.node_id,
        lock = %config.lock_name,
        port = cli.port,
        "convoy server starting"
    );

    metrics::init_metrics();

    let (lease_store, entity_store): (Arc<dyn LeaseStore>, Arc<dyn EntityStore>) =
        if cli.standalone {
            info!("standalone mode: in-memory store, nothing survives a restart");
            (
                Arc::new(MemoryLeaseStore::new()),
                Arc::new(MemoryEntityStore::new()),
            )
        } else {
            let url = cli
                .database_url
                .as_deref()
                .context("DATABASE_URL is required unless --standalone is set")?;
            let pool = store::connect(url)
                .await
                .context("failed to connect to the authoritative store")?;
            store::run_migrations(&pool)
                .await
                .context("failed to run migrations")?;
            info!("connected to authoritative store, migrations applied");
            (
                Arc::new(PgLeaseStore::new(pool.clone())),
                Arc::new(PgEntityStore::new(pool)),
            )
        };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let elector = Arc::new(LeaderElector::new(lease_store.clone(), config.clone()));
    let manager = Arc::new(StateManager::new(
        entity_store.clone(),
        elector.handle(),
        ConflictResolver::new(config.conflict_strategy),
        config.clone(),
    ));
    let coordinator = Arc::new(SyncCoordinator::new(
        entity_store.clone(),
        manager.clone(),
        elector.handle(),
        config.clone(),
    ));

    let election_task = tokio::spawn(elector.clone().run(shutdown_rx.clone()));
    let sync_task = tokio::spawn(coordinator.clone().run(shutdown_rx.clone()));
    let cache_task = tokio::spawn(manager.clone().run_cache_maintenance(shutdown_rx.clone()));

    let app_state = AppState::new(
        config.clone(),
        elector.handle(),
        manager,
        coordinator,
        entity_store,
        lease_store,
    );
    let app = build_router(app_state);

    let addr = SocketAddr::from(([0, 0, 0, 0], cli.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("status API listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Stop the loops; the elector releases its lease on the way out so a
    // peer can take over without waiting for the TTL.
    info!(node = %config.node_id, "shutting down");
    let _ = shutdown_tx.send(true);
    let _ = election_task.await;
    let _ = sync_task.await;
    let _ = cache_task.await;
    info!(node = %config.node_id, "shutdown complete");

    Ok(())
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .nest("/api", api::router())
        .route("/health", get(api::get_health))
        .route("/healthz", get(api::get_health))
        .route("/metrics", get(api::get_metrics))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install sigterm handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
