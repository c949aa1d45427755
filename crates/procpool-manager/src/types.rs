//! Public value types returned by the pool.

use std::time::Duration;

use chrono::{DateTime, Utc};
use procpool_core::{PoolError, TransitionRecord, WorkerHealth, WorkerId, WorkerState};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Whether a worker belongs to the fixed allocation or absorbs a burst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerKind {
    /// Counted against `pool_size`; always replaced on failure.
    Fixed,
    /// Temporary; torn down once idle, never replaced.
    Overflow,
}

/// How a caller finished with a checked-out worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckinOutcome {
    /// The worker answered; return it to the ready set.
    Success,
    /// The worker answered with a failure; mark it degraded.
    Error,
    /// The channel is unusable (timeout, closed, malformed); kill the worker.
    Broken,
}

impl CheckinOutcome {
    /// Derive the outcome from the result of a request.
    #[must_use]
    pub fn for_result<T>(result: &Result<T, PoolError>) -> Self {
        match result {
            Ok(_) => Self::Success,
            Err(PoolError::CommandFailed { .. }) => Self::Error,
            Err(_) => Self::Broken,
        }
    }
}

/// Per-call overrides of the pool's default timeouts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteOptions {
    /// Bound on waiting for a worker.
    #[serde(default)]
    pub checkout_timeout: Option<Duration>,
    /// Bound on the request itself.
    #[serde(default)]
    pub operation_timeout: Option<Duration>,
}

impl ExecuteOptions {
    /// Options with a custom checkout timeout.
    #[must_use]
    pub const fn with_checkout_timeout(mut self, timeout: Duration) -> Self {
        self.checkout_timeout = Some(timeout);
        self
    }

    /// Options with a custom operation timeout.
    #[must_use]
    pub const fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = Some(timeout);
        self
    }
}

/// Snapshot of the pool's occupancy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    /// Configured number of fixed workers.
    pub pool_size: usize,
    /// Live overflow workers.
    pub overflow_active: usize,
    /// Workers ready for checkout.
    pub available: usize,
    /// Workers checked out.
    pub busy: usize,
    /// Callers waiting for a worker.
    pub queued: usize,
    /// Workers marked degraded.
    pub degraded: usize,
    /// Workers still starting up.
    pub initializing: usize,
    /// Sessions currently tracked.
    pub sessions_active: usize,
}

/// Per-worker counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStats {
    /// Times the worker was checked out.
    pub checkouts: u64,
    /// Checkins with [`CheckinOutcome::Success`].
    pub successful_checkins: u64,
    /// Checkins with any other outcome.
    pub error_checkins: u64,
    /// Last checkout or checkin.
    pub last_activity: DateTime<Utc>,
}

impl Default for WorkerStats {
    fn default() -> Self {
        Self {
            checkouts: 0,
            successful_checkins: 0,
            error_checkins: 0,
            last_activity: Utc::now(),
        }
    }
}

/// Diagnostics for one worker.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerInfo {
    /// Worker identity.
    pub id: WorkerId,
    /// Fixed or overflow.
    pub kind: WorkerKind,
    /// Lifecycle state.
    pub state: WorkerState,
    /// Last health observation.
    pub health: WorkerHealth,
    /// OS process id.
    pub pid: Option<u32>,
    /// Counters.
    pub stats: WorkerStats,
    /// Spawn time.
    pub started_at: DateTime<Utc>,
    /// Seconds since spawn.
    pub uptime_seconds: u64,
    /// Seconds spent in the current state.
    pub state_seconds: u64,
    /// Metadata merged from the worker's transitions.
    pub metadata: Map<String, Value>,
    /// Most recent transitions, oldest first.
    pub history: Vec<TransitionRecord>,
}

/// Lifecycle of the pool as a whole.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum PoolStatus {
    /// The manager is serving requests.
    Running,
    /// The manager crashed and is being restarted.
    Restarting,
    /// The pool was shut down.
    Stopped,
    /// The restart budget was exhausted.
    Failed {
        /// Restarts inside the window when the budget ran out.
        restarts: u32,
        /// The last failure.
        reason: String,
    },
}

impl PoolStatus {
    /// Returns true once the pool will never serve again.
    #[must_use]
    pub const fn is_final(&self) -> bool {
        matches!(self, Self::Stopped | Self::Failed { .. })
    }
}
