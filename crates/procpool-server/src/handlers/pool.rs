//! Pool endpoints: execution, stats, workers and sessions.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use procpool_core::SessionId;
use procpool_manager::{ExecuteOptions, PoolStats, SessionStats, WorkerInfo, WorkerPool};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{ApiError, Result};
use crate::state::AppState;

// =============================================================================
// Request / Response Types
// =============================================================================

/// Request body for `POST /v1/execute`.
#[derive(Debug, Deserialize)]
pub struct ExecuteRequest {
    /// Command name understood by the workers.
    pub command: String,
    /// Command arguments.
    #[serde(default)]
    pub args: Map<String, Value>,
    /// Optional session to attribute the call to.
    #[serde(default)]
    pub session_id: Option<String>,
    /// Override of the pool's operation timeout.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Override of the pool's checkout timeout.
    #[serde(default)]
    pub checkout_timeout_ms: Option<u64>,
}

impl ExecuteRequest {
    fn options(&self) -> ExecuteOptions {
        ExecuteOptions {
            checkout_timeout: self.checkout_timeout_ms.map(Duration::from_millis),
            operation_timeout: self.timeout_ms.map(Duration::from_millis),
        }
    }
}

/// Response body for a successful execution.
#[derive(Debug, Serialize)]
pub struct ExecuteResponse {
    /// The worker's result map.
    pub result: Map<String, Value>,
}

/// Response for listing workers.
#[derive(Debug, Serialize)]
pub struct ListWorkersResponse {
    /// Per-worker diagnostics.
    pub workers: Vec<WorkerInfo>,
}

// =============================================================================
// Handlers
// =============================================================================

/// Run one command on the pool.
///
/// # Errors
///
/// Returns `BadRequest` for an empty command or invalid session id and the
/// pool's structured error otherwise.
pub async fn execute<P>(
    State(state): State<Arc<AppState<P>>>,
    Json(request): Json<ExecuteRequest>,
) -> Result<Json<ExecuteResponse>>
where
    P: WorkerPool + 'static,
{
    if request.command.trim().is_empty() {
        return Err(ApiError::BadRequest("command must not be empty".to_string()));
    }
    let options = request.options();

    let result = match &request.session_id {
        Some(raw) => {
            let session_id = parse_session_id(raw)?;
            state
                .pool
                .execute_in_session(&session_id, &request.command, request.args, options)
                .await?
        }
        None => {
            state
                .pool
                .execute_anonymous(&request.command, request.args, options)
                .await?
        }
    };

    Ok(Json(ExecuteResponse { result }))
}

/// Pool occupancy.
///
/// # Errors
///
/// Returns `PoolUnavailable` if the pool is not running.
pub async fn stats<P>(State(state): State<Arc<AppState<P>>>) -> Result<Json<PoolStats>>
where
    P: WorkerPool + 'static,
{
    Ok(Json(state.pool.get_stats().await?))
}

/// Per-worker diagnostics.
///
/// # Errors
///
/// Returns `PoolUnavailable` if the pool is not running.
pub async fn list_workers<P>(
    State(state): State<Arc<AppState<P>>>,
) -> Result<Json<ListWorkersResponse>>
where
    P: WorkerPool + 'static,
{
    let workers = state.pool.worker_info().await?;
    Ok(Json(ListWorkersResponse { workers }))
}

/// Active sessions.
pub async fn list_sessions<P>(State(state): State<Arc<AppState<P>>>) -> Json<SessionStats>
where
    P: WorkerPool + 'static,
{
    Json(state.pool.session_stats())
}

/// Forget a session.
///
/// # Errors
///
/// Returns `NotFound` if the session is not tracked.
pub async fn end_session<P>(
    State(state): State<Arc<AppState<P>>>,
    Path(session_id): Path<String>,
) -> Result<impl IntoResponse>
where
    P: WorkerPool + 'static,
{
    let session_id = parse_session_id(&session_id)?;
    if state.pool.end_session(&session_id) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!("session {session_id}")))
    }
}

fn parse_session_id(raw: &str) -> Result<SessionId> {
    SessionId::new(raw).map_err(|e| ApiError::BadRequest(format!("invalid session id: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use procpool_manager::MockPool;

    fn state(pool: &Arc<MockPool>) -> Arc<AppState<MockPool>> {
        Arc::new(AppState::new(Arc::clone(pool), ServerConfig::default()))
    }

    fn request(command: &str, session_id: Option<&str>) -> ExecuteRequest {
        ExecuteRequest {
            command: command.to_string(),
            args: Map::new(),
            session_id: session_id.map(str::to_string),
            timeout_ms: Some(250),
            checkout_timeout_ms: None,
        }
    }

    #[test]
    fn request_options_map_timeouts() {
        let options = request("echo", None).options();
        assert_eq!(options.operation_timeout, Some(Duration::from_millis(250)));
        assert_eq!(options.checkout_timeout, None);
    }

    #[tokio::test]
    async fn execute_routes_sessions() {
        let pool = Arc::new(MockPool::new());

        execute(State(state(&pool)), Json(request("echo", Some("s1"))))
            .await
            .unwrap();
        execute(State(state(&pool)), Json(request("echo", None)))
            .await
            .unwrap();

        let calls = pool.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].session_id.as_ref().map(SessionId::as_str), Some("s1"));
        assert!(calls[1].session_id.is_none());
        assert_eq!(pool.session_stats().active, 1);
    }

    #[tokio::test]
    async fn execute_rejects_bad_input() {
        let pool = Arc::new(MockPool::new());

        let err = execute(State(state(&pool)), Json(request("  ", None)))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::BadRequest(_)));

        let err = execute(State(state(&pool)), Json(request("echo", Some(""))))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::BadRequest(_)));
        assert!(pool.calls().is_empty());
    }

    #[tokio::test]
    async fn end_session_reports_missing() {
        let pool = Arc::new(MockPool::new());
        execute(State(state(&pool)), Json(request("echo", Some("s1"))))
            .await
            .unwrap();

        let ok = end_session(State(state(&pool)), Path("s1".to_string())).await;
        assert!(ok.is_ok());
        let missing = end_session(State(state(&pool)), Path("s1".to_string())).await;
        assert!(matches!(missing, Err(ApiError::NotFound(_))));
    }
}
