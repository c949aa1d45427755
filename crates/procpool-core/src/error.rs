//! Error taxonomy for procpool.
//!
//! Every failure that crosses the pool boundary is a [`PoolError`]. Each
//! variant maps to exactly one [`ErrorKind`], and each kind belongs to one
//! [`ErrorCategory`]. Callers that need a serializable view use
//! [`PoolError::report`], which yields `{category, kind, message, context}`.
//!
//! ```text
//! timeout_error        checkout_timeout, operation_timeout
//! resource_error       pool_unavailable, worker_init_failed, invalid_config
//! communication_error  port_closed, protocol_error, message_too_large
//! system_error         supervisor_crash, invalid_transition, internal
//! worker_error         command_failed
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::ids::WorkerId;
use crate::lifecycle::TransitionError;
use crate::protocol::ProtocolError;

/// A result type using `PoolError`.
pub type Result<T> = std::result::Result<T, PoolError>;

/// Broad class of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// A bounded wait elapsed.
    TimeoutError,
    /// The pool or one of its workers could not be provisioned.
    ResourceError,
    /// The channel to a worker process failed.
    CommunicationError,
    /// The pool itself failed.
    SystemError,
    /// The worker processed the request and reported a failure.
    WorkerError,
}

impl ErrorCategory {
    /// Returns the wire name of the category.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::TimeoutError => "timeout_error",
            Self::ResourceError => "resource_error",
            Self::CommunicationError => "communication_error",
            Self::SystemError => "system_error",
            Self::WorkerError => "worker_error",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Machine-checkable failure kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// No worker became available before the checkout deadline.
    CheckoutTimeout,
    /// A worker did not answer a request in time.
    OperationTimeout,
    /// The pool manager is not running.
    PoolUnavailable,
    /// A worker failed its startup handshake.
    WorkerInitFailed,
    /// The pool configuration was rejected.
    InvalidConfig,
    /// The worker process went away mid-operation.
    PortClosed,
    /// The worker sent a frame that could not be understood.
    ProtocolError,
    /// A frame exceeded the configured size limit.
    MessageTooLarge,
    /// The pool manager crashed too often.
    SupervisorCrash,
    /// A lifecycle transition was rejected.
    InvalidTransition,
    /// An unexpected internal failure.
    Internal,
    /// The worker answered with `success: false`.
    CommandFailed,
}

impl ErrorKind {
    /// Returns the category this kind belongs to.
    #[must_use]
    pub const fn category(self) -> ErrorCategory {
        match self {
            Self::CheckoutTimeout | Self::OperationTimeout => ErrorCategory::TimeoutError,
            Self::PoolUnavailable | Self::WorkerInitFailed | Self::InvalidConfig => {
                ErrorCategory::ResourceError
            }
            Self::PortClosed | Self::ProtocolError | Self::MessageTooLarge => {
                ErrorCategory::CommunicationError
            }
            Self::SupervisorCrash | Self::InvalidTransition | Self::Internal => {
                ErrorCategory::SystemError
            }
            Self::CommandFailed => ErrorCategory::WorkerError,
        }
    }

    /// Returns the wire name of the kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::CheckoutTimeout => "checkout_timeout",
            Self::OperationTimeout => "operation_timeout",
            Self::PoolUnavailable => "pool_unavailable",
            Self::WorkerInitFailed => "worker_init_failed",
            Self::InvalidConfig => "invalid_config",
            Self::PortClosed => "port_closed",
            Self::ProtocolError => "protocol_error",
            Self::MessageTooLarge => "message_too_large",
            Self::SupervisorCrash => "supervisor_crash",
            Self::InvalidTransition => "invalid_transition",
            Self::Internal => "internal",
            Self::CommandFailed => "command_failed",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Serializable structured error: `{category, kind, message, context}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReport {
    /// Broad class of the failure.
    pub category: ErrorCategory,
    /// Specific failure kind.
    pub kind: ErrorKind,
    /// Human-readable description.
    pub message: String,
    /// Free-form details (worker id, command, timeouts).
    #[serde(default)]
    pub context: BTreeMap<String, Value>,
}

/// Errors surfaced by pool operations.
#[derive(Debug, Error)]
pub enum PoolError {
    /// No worker became available in time.
    #[error("no worker available within {}ms", .timeout.as_millis())]
    CheckoutTimeout {
        /// The checkout timeout that elapsed.
        timeout: Duration,
    },

    /// The worker did not answer before the operation timeout.
    #[error("worker {worker_id} did not answer '{command}' within {}ms", .timeout.as_millis())]
    OperationTimeout {
        /// The worker that timed out.
        worker_id: WorkerId,
        /// The command in flight.
        command: String,
        /// The operation timeout that elapsed.
        timeout: Duration,
    },

    /// The pool manager is not running.
    #[error("pool unavailable: {reason}")]
    PoolUnavailable {
        /// Why the pool cannot serve requests.
        reason: String,
    },

    /// A worker failed to start or to answer its startup ping.
    #[error("worker {worker_id} failed to initialize: {reason}")]
    WorkerInitFailed {
        /// The worker that failed.
        worker_id: WorkerId,
        /// What went wrong.
        reason: String,
    },

    /// The worker's channel closed mid-operation.
    #[error("worker {worker_id} channel closed: {reason}")]
    PortClosed {
        /// The worker whose channel closed.
        worker_id: WorkerId,
        /// What was observed.
        reason: String,
    },

    /// A frame could not be encoded or decoded.
    #[error("protocol error{}: {source}", worker_suffix(.worker_id.as_ref()))]
    Protocol {
        /// The worker on the other end, when known.
        worker_id: Option<WorkerId>,
        /// The underlying codec failure.
        #[source]
        source: ProtocolError,
    },

    /// The pool manager exhausted its restart budget.
    #[error("pool manager crashed {restarts} times within the restart window: {reason}")]
    SupervisorCrash {
        /// Restarts attempted inside the window.
        restarts: u32,
        /// The last failure observed.
        reason: String,
    },

    /// The worker processed the command and reported failure.
    #[error("worker {worker_id} failed '{command}': {message}")]
    CommandFailed {
        /// The worker that answered.
        worker_id: WorkerId,
        /// The command that failed.
        command: String,
        /// The error string returned by the worker.
        message: String,
    },

    /// A lifecycle transition was rejected.
    #[error(transparent)]
    InvalidTransition(#[from] TransitionError),

    /// The pool configuration is invalid.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Unexpected internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

fn worker_suffix(worker_id: Option<&WorkerId>) -> String {
    worker_id.map_or_else(String::new, |id| format!(" from worker {id}"))
}

impl From<ProtocolError> for PoolError {
    fn from(source: ProtocolError) -> Self {
        Self::Protocol {
            worker_id: None,
            source,
        }
    }
}

impl PoolError {
    /// Wraps a codec failure observed on a specific worker's channel.
    #[must_use]
    pub fn protocol(worker_id: WorkerId, source: ProtocolError) -> Self {
        Self::Protocol {
            worker_id: Some(worker_id),
            source,
        }
    }

    /// Shorthand for [`PoolError::PoolUnavailable`].
    #[must_use]
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::PoolUnavailable {
            reason: reason.into(),
        }
    }

    /// Returns the specific kind of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::CheckoutTimeout { .. } => ErrorKind::CheckoutTimeout,
            Self::OperationTimeout { .. } => ErrorKind::OperationTimeout,
            Self::PoolUnavailable { .. } => ErrorKind::PoolUnavailable,
            Self::WorkerInitFailed { .. } => ErrorKind::WorkerInitFailed,
            Self::PortClosed { .. } => ErrorKind::PortClosed,
            Self::Protocol { source, .. } => match source {
                ProtocolError::MessageTooLarge { .. } => ErrorKind::MessageTooLarge,
                ProtocolError::Closed | ProtocolError::Io(_) => ErrorKind::PortClosed,
                ProtocolError::Malformed { .. } | ProtocolError::Unmatched { .. } => {
                    ErrorKind::ProtocolError
                }
            },
            Self::SupervisorCrash { .. } => ErrorKind::SupervisorCrash,
            Self::CommandFailed { .. } => ErrorKind::CommandFailed,
            Self::InvalidTransition(_) => ErrorKind::InvalidTransition,
            Self::Config(_) => ErrorKind::InvalidConfig,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Returns the broad category of this error.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        self.kind().category()
    }

    /// Returns the worker involved in this failure, if any.
    #[must_use]
    pub const fn worker_id(&self) -> Option<WorkerId> {
        match self {
            Self::OperationTimeout { worker_id, .. }
            | Self::WorkerInitFailed { worker_id, .. }
            | Self::PortClosed { worker_id, .. }
            | Self::CommandFailed { worker_id, .. } => Some(*worker_id),
            Self::Protocol { worker_id, .. } => *worker_id,
            _ => None,
        }
    }

    /// Returns structured details about the failure.
    #[must_use]
    pub fn context(&self) -> BTreeMap<String, Value> {
        let mut ctx = BTreeMap::new();
        if let Some(id) = self.worker_id() {
            ctx.insert("worker_id".to_string(), json!(id.to_string()));
        }
        match self {
            Self::CheckoutTimeout { timeout } => {
                ctx.insert("timeout_ms".into(), json!(duration_ms(*timeout)));
            }
            Self::OperationTimeout {
                command, timeout, ..
            } => {
                ctx.insert("command".into(), json!(command));
                ctx.insert("timeout_ms".into(), json!(duration_ms(*timeout)));
            }
            Self::CommandFailed { command, .. } => {
                ctx.insert("command".into(), json!(command));
            }
            Self::Protocol { source, .. } => match source {
                ProtocolError::MessageTooLarge { size, limit } => {
                    ctx.insert("size".into(), json!(size));
                    ctx.insert("limit".into(), json!(limit));
                }
                ProtocolError::Unmatched { id } => {
                    ctx.insert("id".into(), json!(id));
                }
                _ => {}
            },
            Self::SupervisorCrash { restarts, .. } => {
                ctx.insert("restarts".into(), json!(restarts));
            }
            Self::InvalidTransition(TransitionError::InvalidTransition { from, to }) => {
                ctx.insert("from".into(), json!(from.as_str()));
                ctx.insert("to".into(), json!(to.as_str()));
            }
            Self::InvalidTransition(TransitionError::AlreadyTerminated { to }) => {
                ctx.insert("to".into(), json!(to.as_str()));
            }
            _ => {}
        }
        ctx
    }

    /// Returns the serializable `{category, kind, message, context}` view.
    #[must_use]
    pub fn report(&self) -> ErrorReport {
        ErrorReport {
            category: self.category(),
            kind: self.kind(),
            message: self.to_string(),
            context: self.context(),
        }
    }

    /// Returns true if this error might be resolved by retrying.
    #[must_use]
    pub const fn is_retriable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::CheckoutTimeout
                | ErrorKind::OperationTimeout
                | ErrorKind::PortClosed
                | ErrorKind::ProtocolError
                | ErrorKind::WorkerInitFailed
        )
    }

    /// Returns the appropriate HTTP status code for this error.
    #[must_use]
    pub const fn http_status_code(&self) -> u16 {
        match self.kind() {
            ErrorKind::CheckoutTimeout | ErrorKind::PoolUnavailable => 503,
            ErrorKind::OperationTimeout => 504,
            ErrorKind::PortClosed | ErrorKind::ProtocolError | ErrorKind::WorkerInitFailed => 502,
            ErrorKind::MessageTooLarge => 413,
            ErrorKind::CommandFailed => 422,
            ErrorKind::InvalidConfig => 400,
            ErrorKind::InvalidTransition | ErrorKind::Internal | ErrorKind::SupervisorCrash => 500,
        }
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::WorkerState;

    #[test]
    fn kinds_map_to_categories() {
        assert_eq!(
            ErrorKind::CheckoutTimeout.category(),
            ErrorCategory::TimeoutError
        );
        assert_eq!(
            ErrorKind::InvalidConfig.category(),
            ErrorCategory::ResourceError
        );
        assert_eq!(
            ErrorKind::MessageTooLarge.category(),
            ErrorCategory::CommunicationError
        );
        assert_eq!(ErrorKind::Internal.category(), ErrorCategory::SystemError);
        assert_eq!(
            ErrorKind::CommandFailed.category(),
            ErrorCategory::WorkerError
        );
    }

    #[test]
    fn checkout_timeout_report() {
        let err = PoolError::CheckoutTimeout {
            timeout: Duration::from_millis(100),
        };
        let report = err.report();
        assert_eq!(report.category, ErrorCategory::TimeoutError);
        assert_eq!(report.kind, ErrorKind::CheckoutTimeout);
        assert_eq!(report.context["timeout_ms"], json!(100));
        assert!(err.is_retriable());
        assert_eq!(err.http_status_code(), 503);
    }

    #[test]
    fn report_serializes_snake_case() {
        let err = PoolError::unavailable("shutting down");
        let value = serde_json::to_value(err.report()).unwrap();
        assert_eq!(value["category"], "resource_error");
        assert_eq!(value["kind"], "pool_unavailable");
        assert!(value["message"].as_str().unwrap().contains("shutting down"));
    }

    #[test]
    fn protocol_kind_follows_source() {
        let id = WorkerId::generate();
        let too_large = PoolError::protocol(
            id,
            ProtocolError::MessageTooLarge {
                size: 10,
                limit: 5,
            },
        );
        assert_eq!(too_large.kind(), ErrorKind::MessageTooLarge);
        assert_eq!(too_large.http_status_code(), 413);
        assert_eq!(too_large.context()["limit"], json!(5));

        let closed = PoolError::protocol(id, ProtocolError::Closed);
        assert_eq!(closed.kind(), ErrorKind::PortClosed);
        assert_eq!(closed.worker_id(), Some(id));

        let malformed = PoolError::from(ProtocolError::Malformed {
            reason: "eof".into(),
        });
        assert_eq!(malformed.kind(), ErrorKind::ProtocolError);
        assert_eq!(malformed.worker_id(), None);
    }

    #[test]
    fn command_failed_is_worker_error() {
        let err = PoolError::CommandFailed {
            worker_id: WorkerId::generate(),
            command: "predict".into(),
            message: "bad input".into(),
        };
        assert_eq!(err.category(), ErrorCategory::WorkerError);
        assert!(!err.is_retriable());
        assert_eq!(err.context()["command"], json!("predict"));
        assert!(err.to_string().contains("bad input"));
    }

    #[test]
    fn transition_error_context() {
        let err = PoolError::from(TransitionError::InvalidTransition {
            from: WorkerState::Initializing,
            to: WorkerState::Busy,
        });
        assert_eq!(err.category(), ErrorCategory::SystemError);
        let ctx = err.context();
        assert_eq!(ctx["from"], json!("initializing"));
        assert_eq!(ctx["to"], json!("busy"));
    }
}
