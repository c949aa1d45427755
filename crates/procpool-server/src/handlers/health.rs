//! Health and readiness endpoints.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use procpool_core::ErrorReport;
use procpool_manager::{ExecuteOptions, PoolStatus, WorkerPool};
use serde::Serialize;

use crate::state::AppState;

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Service status.
    pub status: &'static str,
    /// Service name.
    pub service: &'static str,
    /// Service version.
    pub version: &'static str,
}

/// Readiness response.
#[derive(Debug, Serialize)]
pub struct ReadyResponse {
    /// `ready` or `not_ready`.
    pub status: &'static str,
    /// Pool lifecycle status.
    pub pool: PoolStatus,
    /// Why the pool is not ready.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorReport>,
}

/// Liveness of the HTTP process itself.
///
/// ```text
/// GET /health
///
/// Response: 200 OK
/// {
///   "status": "healthy",
///   "service": "procpool-server",
///   "version": "0.1.0"
/// }
/// ```
pub async fn health() -> impl IntoResponse {
    let response = HealthResponse {
        status: "healthy",
        service: "procpool-server",
        version: env!("CARGO_PKG_VERSION"),
    };

    (StatusCode::OK, Json(response))
}

/// Readiness: a worker can be checked out and answers `ping`.
pub async fn ready<P>(State(state): State<Arc<AppState<P>>>) -> impl IntoResponse
where
    P: WorkerPool + 'static,
{
    let pool = state.pool.status();
    match state.pool.health_check(ExecuteOptions::default()).await {
        Ok(()) => (
            StatusCode::OK,
            Json(ReadyResponse {
                status: "ready",
                pool,
                error: None,
            }),
        ),
        Err(e) => {
            tracing::debug!(error = %e, "Readiness check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(ReadyResponse {
                    status: "not_ready",
                    pool,
                    error: Some(e.report()),
                }),
            )
        }
    }
}
