//! procpool server - HTTP front end for a supervised worker pool.
//!
//! # Configuration
//!
//! The pool is configured from `PROCPOOL_*` variables (at least
//! `PROCPOOL_WORKER_PROGRAM`), the HTTP surface from `LISTEN_ADDR`,
//! `MAX_BODY_BYTES` and `REQUEST_TIMEOUT_SECONDS`.
//!
//! # HTTP Endpoints
//!
//! - `GET /health` - Liveness
//! - `GET /ready` - Readiness
//! - `POST /v1/execute` - Run a command on the pool
//! - `GET /v1/stats` - Pool occupancy
//! - `GET /v1/workers` - Per-worker diagnostics
//! - `GET /v1/sessions` - Active sessions
//! - `DELETE /v1/sessions/:session_id` - Forget a session

use std::sync::Arc;

use procpool_manager::{PoolConfig, PoolEvent, ProcessPool, WorkerPool};
use procpool_server::{create_router, AppState, ServerConfig};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,procpool=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting procpool server");

    let server_config = ServerConfig::from_env();
    let pool_config = PoolConfig::from_env();
    tracing::info!(
        listen_addr = %server_config.listen_addr,
        program = %pool_config.worker.program,
        pool_size = pool_config.pool_size,
        overflow = pool_config.overflow,
        framing = %pool_config.worker.framing,
        "Configuration loaded"
    );

    let pool = Arc::new(ProcessPool::start(pool_config).await?);
    spawn_event_logger(&pool);

    let listen_addr = server_config.listen_addr.clone();
    let app = create_router(AppState::new(Arc::clone(&pool), server_config));

    tracing::info!(listen_addr = %listen_addr, "Starting HTTP server");
    let listener = tokio::net::TcpListener::bind(&listen_addr).await?;

    let watched = Arc::clone(&pool);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => tracing::info!("Shutdown signal received"),
                status = watched.terminated() => {
                    tracing::error!(?status, "Pool stopped; shutting down");
                }
            }
        })
        .await?;

    if let Err(e) = pool.shutdown().await {
        tracing::warn!(error = %e, "Pool shutdown incomplete");
    }
    tracing::info!("Server stopped");
    Ok(())
}

/// Forward pool events to the log.
fn spawn_event_logger(pool: &ProcessPool) {
    let mut events = pool.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(PoolEvent::OperationCompleted { .. }) => {}
                Ok(event) => tracing::info!(?event, "Pool event"),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event logger fell behind");
                }
                Err(RecvError::Closed) => return,
            }
        }
    });
}
