//! API error types and responses.
//!
//! Pool failures are returned as their structured [`ErrorReport`]; request
//! validation failures use a plain code and message.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use procpool_core::{ErrorReport, PoolError};
use serde::Serialize;
use thiserror::Error;

/// Crate result alias.
pub type Result<T> = std::result::Result<T, ApiError>;

/// API error type that implements `IntoResponse`.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Invalid request body or parameters.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// The requested resource was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// The pool rejected or failed the operation.
    #[error(transparent)]
    Pool(#[from] PoolError),
}

/// Error response body.
#[derive(Debug, Serialize)]
struct ErrorResponse<T> {
    error: T,
}

/// Details for errors that do not come from the pool.
#[derive(Debug, Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

impl ApiError {
    /// Get the HTTP status code for this error.
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Pool(e) => StatusCode::from_u16(e.http_status_code())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
        }
    }

    /// Get the error code string for this error.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "bad_request",
            Self::NotFound(_) => "not_found",
            Self::Pool(e) => e.kind().as_str(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        match self {
            Self::Pool(e) => {
                if status.is_server_error() {
                    tracing::warn!(error = %e, kind = %e.kind(), "Pool operation failed");
                }
                let report: ErrorReport = e.report();
                (status, Json(ErrorResponse { error: report })).into_response()
            }
            other => {
                let body = ErrorBody {
                    code: other.code(),
                    message: other.to_string(),
                };
                (status, Json(ErrorResponse { error: body })).into_response()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn error_status_codes() {
        assert_eq!(
            ApiError::BadRequest("test".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::NotFound("test".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::from(PoolError::CheckoutTimeout {
                timeout: Duration::from_millis(100)
            })
            .status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ApiError::from(PoolError::unavailable("stopped")).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn error_codes() {
        assert_eq!(ApiError::BadRequest("x".into()).code(), "bad_request");
        assert_eq!(ApiError::NotFound("x".into()).code(), "not_found");
        assert_eq!(
            ApiError::from(PoolError::Internal("x".into())).code(),
            "internal"
        );
    }

    #[tokio::test]
    async fn pool_error_body_is_structured_report() {
        let err = ApiError::from(PoolError::CheckoutTimeout {
            timeout: Duration::from_millis(100),
        });
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"]["category"], "timeout_error");
        assert_eq!(body["error"]["kind"], "checkout_timeout");
        assert!(body["error"]["message"].as_str().is_some());
    }
}
