//! Worker lifecycle state machine.
//!
//! Every worker owns one [`WorkerStateMachine`]. Normal transitions go through
//! [`WorkerStateMachine::transition`], which only accepts edges from the fixed
//! table below. Process death and operation timeouts use
//! [`WorkerStateMachine::force`], the single edge that bypasses the table.
//!
//! # State Machine
//!
//! ```text
//!     ┌──────────────┐
//!     │ Initializing │
//!     └──────┬───────┘
//!            │ init_complete
//!            ▼
//!     ┌──────────────┐  checkout        ┌──────────┐
//!     │    Ready     │─────────────────▶│   Busy   │
//!     │              │◀─────────────────│          │
//!     └──┬────────▲──┘  checkin_success └────┬─────┘
//!        │        │                          │ checkin_error
//!        │        │ health_restored          ▼
//!        │        │                   ┌──────────────┐
//!        │        └───────────────────│   Degraded   │
//!        └───────────────────────────▶│              │
//!          health_check_failed        └──────────────┘
//!
//!     any non-terminal ──shutdown──▶ Terminating ──terminate──▶ Terminated
//!     any non-terminal ──forced────▶ Terminating | Terminated
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};
use thiserror::Error;

/// Number of transition records retained per worker.
pub const HISTORY_LIMIT: usize = 64;

/// Lifecycle state of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Process spawned, startup handshake pending.
    Initializing,
    /// Idle and eligible for checkout.
    Ready,
    /// Checked out by a caller.
    Busy,
    /// Failed a probe or a checkin; may recover.
    Degraded,
    /// Shutting down.
    Terminating,
    /// Process gone. No transition leaves this state.
    Terminated,
}

impl WorkerState {
    /// Returns the wire name of the state.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::Busy => "busy",
            Self::Degraded => "degraded",
            Self::Terminating => "terminating",
            Self::Terminated => "terminated",
        }
    }

    /// Returns true for `Terminating` and `Terminated`.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Terminating | Self::Terminated)
    }

    /// Returns true if a worker in this state counts as alive.
    #[must_use]
    pub const fn is_live(self) -> bool {
        !self.is_terminal()
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Health as last observed by probes and checkins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerHealth {
    /// No observation yet.
    Unknown,
    /// Answered its last probe or handshake.
    Healthy,
    /// Failed enough probes to be considered unhealthy.
    Unhealthy,
}

impl fmt::Display for WorkerHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unknown => "unknown",
            Self::Healthy => "healthy",
            Self::Unhealthy => "unhealthy",
        })
    }
}

/// Errors raised by the state machine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    /// The requested edge is not in the transition table.
    #[error("invalid transition: cannot move from {from} to {to}")]
    InvalidTransition {
        /// The current state.
        from: WorkerState,
        /// The requested target state.
        to: WorkerState,
    },

    /// The worker has already terminated.
    #[error("worker already terminated: cannot move to {to}")]
    AlreadyTerminated {
        /// The requested target state.
        to: WorkerState,
    },
}

/// One entry of a worker's transition history.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransitionRecord {
    /// State before the transition.
    pub from: WorkerState,
    /// State after the transition.
    pub to: WorkerState,
    /// Trigger name, e.g. `checkout` or `health_check_failed`.
    pub reason: String,
    /// Metadata supplied with the transition.
    pub metadata: Map<String, Value>,
    /// Time spent in `from`.
    #[serde(rename = "duration_ms", serialize_with = "serialize_millis")]
    pub duration: Duration,
    /// Wall-clock time of the transition.
    pub timestamp: DateTime<Utc>,
    /// True if the edge bypassed the transition table.
    pub forced: bool,
}

fn serialize_millis<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

/// Check if a state transition is in the table.
#[must_use]
pub const fn is_valid_transition(from: WorkerState, to: WorkerState) -> bool {
    use WorkerState::{Busy, Degraded, Initializing, Ready, Terminated, Terminating};

    matches!(
        (from, to),
        (Initializing | Busy | Degraded, Ready)
            | (Ready, Busy)
            | (Busy | Ready, Degraded)
            | (Initializing | Ready | Busy | Degraded, Terminating)
            | (Terminating, Terminated)
    )
}

/// Returns the list of valid target states from the given state.
#[must_use]
pub fn valid_transitions_from(state: WorkerState) -> Vec<WorkerState> {
    use WorkerState::{Busy, Degraded, Initializing, Ready, Terminated, Terminating};

    match state {
        Initializing => vec![Ready, Terminating],
        Ready => vec![Busy, Degraded, Terminating],
        Busy => vec![Ready, Degraded, Terminating],
        Degraded => vec![Ready, Terminating],
        Terminating => vec![Terminated],
        Terminated => vec![],
    }
}

/// State, health and bounded transition history for a single worker.
#[derive(Debug, Clone)]
pub struct WorkerStateMachine {
    state: WorkerState,
    health: WorkerHealth,
    entered_state_at: Instant,
    metadata: Map<String, Value>,
    history: VecDeque<TransitionRecord>,
}

impl Default for WorkerStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerStateMachine {
    /// Create a machine in `Initializing` with unknown health.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: WorkerState::Initializing,
            health: WorkerHealth::Unknown,
            entered_state_at: Instant::now(),
            metadata: Map::new(),
            history: VecDeque::new(),
        }
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> WorkerState {
        self.state
    }

    /// Current health.
    #[must_use]
    pub const fn health(&self) -> WorkerHealth {
        self.health
    }

    /// Time spent in the current state.
    #[must_use]
    pub fn time_in_state(&self) -> Duration {
        self.entered_state_at.elapsed()
    }

    /// Metadata merged from every transition so far.
    #[must_use]
    pub const fn metadata(&self) -> &Map<String, Value> {
        &self.metadata
    }

    /// The most recent transitions, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &TransitionRecord> {
        self.history.iter()
    }

    /// Apply a transition from the table.
    ///
    /// # Errors
    ///
    /// Returns `TransitionError::AlreadyTerminated` once the machine is
    /// terminated, and `TransitionError::InvalidTransition` for any edge not
    /// in the table.
    pub fn transition(
        &mut self,
        to: WorkerState,
        reason: &str,
        metadata: Option<Map<String, Value>>,
    ) -> Result<(), TransitionError> {
        if self.state == WorkerState::Terminated {
            return Err(TransitionError::AlreadyTerminated { to });
        }
        if !is_valid_transition(self.state, to) {
            return Err(TransitionError::InvalidTransition {
                from: self.state,
                to,
            });
        }
        self.record(to, reason, metadata.unwrap_or_default(), false);
        Ok(())
    }

    /// Move to `Terminating` or `Terminated` regardless of the table.
    ///
    /// Used when the process exits or is killed.
    ///
    /// # Errors
    ///
    /// Returns `TransitionError::AlreadyTerminated` if the machine is already
    /// terminated, and `TransitionError::InvalidTransition` if `to` is not a
    /// terminal state.
    pub fn force(&mut self, to: WorkerState, reason: &str) -> Result<(), TransitionError> {
        if self.state == WorkerState::Terminated {
            return Err(TransitionError::AlreadyTerminated { to });
        }
        if !to.is_terminal() {
            return Err(TransitionError::InvalidTransition {
                from: self.state,
                to,
            });
        }
        self.record(to, reason, Map::new(), true);
        Ok(())
    }

    /// True iff the worker is ready and healthy.
    #[must_use]
    pub fn can_accept_work(&self) -> bool {
        self.state == WorkerState::Ready && self.health == WorkerHealth::Healthy
    }

    /// True iff the worker is terminating or terminated.
    #[must_use]
    pub const fn should_remove(&self) -> bool {
        self.state.is_terminal()
    }

    /// Record a new health observation. Does not change state.
    pub fn update_health(&mut self, health: WorkerHealth) {
        self.health = health;
    }

    fn record(
        &mut self,
        to: WorkerState,
        reason: &str,
        metadata: Map<String, Value>,
        forced: bool,
    ) {
        let now = Instant::now();
        let entry = TransitionRecord {
            from: self.state,
            to,
            reason: reason.to_string(),
            metadata: metadata.clone(),
            duration: now.duration_since(self.entered_state_at),
            timestamp: Utc::now(),
            forced,
        };

        self.metadata.extend(metadata);
        if self.history.len() == HISTORY_LIMIT {
            self.history.pop_front();
        }
        self.history.push_back(entry);
        self.state = to;
        self.entered_state_at = now;
    }
}
