//! Router configuration.
//!
//! This module sets up the Axum router with all routes and middleware.

use std::sync::Arc;

use axum::routing::{delete, get, post};
use axum::Router;
use procpool_manager::WorkerPool;
use tower::ServiceBuilder;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::handlers::{health, pool};
use crate::state::AppState;

/// Create the router with all routes and middleware.
///
/// # Routes
///
/// ## Health
/// - `GET /health` - Liveness
/// - `GET /ready` - Readiness (pool answers a ping)
///
/// ## Pool
/// - `POST /v1/execute` - Run a command
/// - `GET /v1/stats` - Pool occupancy
/// - `GET /v1/workers` - Per-worker diagnostics
///
/// ## Sessions
/// - `GET /v1/sessions` - Active sessions
/// - `DELETE /v1/sessions/:session_id` - Forget a session
pub fn create_router<P>(state: AppState<P>) -> Router
where
    P: WorkerPool + 'static,
{
    let max_body_bytes = state.config.max_body_bytes;
    let request_timeout = state.config.request_timeout();
    let state = Arc::new(state);

    Router::new()
        .route("/health", get(health::health))
        .route("/ready", get(health::ready::<P>))
        .route("/v1/execute", post(pool::execute::<P>))
        .route("/v1/stats", get(pool::stats::<P>))
        .route("/v1/workers", get(pool::list_workers::<P>))
        .route("/v1/sessions", get(pool::list_sessions::<P>))
        .route("/v1/sessions/:session_id", delete(pool::end_session::<P>))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(RequestBodyLimitLayer::new(max_body_bytes))
                .layer(TimeoutLayer::new(request_timeout)),
        )
        .with_state(state)
}
