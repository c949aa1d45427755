//! Session bookkeeping.
//!
//! Sessions are purely observational: the tracker records which caller-supplied
//! session ids are active and how many operations each has issued. It is never
//! consulted when choosing a worker, and it lives outside the pool manager so
//! updates never wait on checkout or checkin.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use procpool_core::SessionId;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::config::SessionConfig;

/// One tracked session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Session {
    /// Caller-supplied id.
    pub session_id: SessionId,
    /// First operation.
    pub started_at: DateTime<Utc>,
    /// Most recent operation.
    pub last_activity: DateTime<Utc>,
    /// Operations issued so far.
    pub operation_count: u64,
}

/// Summary returned by [`SessionTracker::stats`].
#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    /// Number of active sessions.
    pub active: usize,
    /// Every tracked session, most recently active first.
    pub sessions: Vec<Session>,
}

/// Concurrent map of active sessions.
#[derive(Debug, Default)]
pub struct SessionTracker {
    sessions: DashMap<SessionId, Session>,
}

impl SessionTracker {
    /// Create an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an operation for `session_id`, creating the session if needed.
    pub fn touch(&self, session_id: &SessionId) {
        self.touch_at(session_id, Utc::now());
    }

    fn touch_at(&self, session_id: &SessionId, now: DateTime<Utc>) {
        self.sessions
            .entry(session_id.clone())
            .and_modify(|s| {
                s.last_activity = now;
                s.operation_count += 1;
            })
            .or_insert_with(|| Session {
                session_id: session_id.clone(),
                started_at: now,
                last_activity: now,
                operation_count: 1,
            });
    }

    /// Forget a session. Returns true if it was tracked.
    pub fn remove(&self, session_id: &SessionId) -> bool {
        self.sessions.remove(session_id).is_some()
    }

    /// Get a copy of one session.
    #[must_use]
    pub fn get(&self, session_id: &SessionId) -> Option<Session> {
        self.sessions.get(session_id).map(|s| s.clone())
    }

    /// Number of tracked sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Check if no sessions are tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Active count plus per-session summaries.
    #[must_use]
    pub fn stats(&self) -> SessionStats {
        let mut sessions: Vec<Session> = self.sessions.iter().map(|e| e.value().clone()).collect();
        sessions.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
        SessionStats {
            active: sessions.len(),
            sessions,
        }
    }

    /// Evict up to `max` sessions idle for longer than `ttl`.
    ///
    /// Returns the number of sessions removed.
    pub fn sweep(&self, ttl: Duration, max: usize) -> usize {
        self.sweep_at(Utc::now(), ttl, max)
    }

    fn sweep_at(&self, now: DateTime<Utc>, ttl: Duration, max: usize) -> usize {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        let Some(cutoff) = now.checked_sub_signed(ttl) else {
            return 0;
        };

        let mut stale: Vec<(DateTime<Utc>, SessionId)> = self
            .sessions
            .iter()
            .filter(|e| e.last_activity < cutoff)
            .map(|e| (e.last_activity, e.key().clone()))
            .collect();
        // Oldest first, so a capped sweep removes the longest-idle sessions.
        stale.sort();

        let mut removed = 0;
        for (_, id) in stale.into_iter().take(max) {
            // Skip sessions touched since the scan.
            if self
                .sessions
                .remove_if(&id, |_, s| s.last_activity < cutoff)
                .is_some()
            {
                removed += 1;
            }
        }
        removed
    }

    /// Spawn the periodic sweeper.
    #[must_use]
    pub fn spawn_sweeper(self: &Arc<Self>, config: SessionConfig) -> JoinHandle<()> {
        let tracker = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(config.cleanup_interval());
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval.tick().await;
            loop {
                interval.tick().await;
                let removed = tracker.sweep(config.ttl(), config.max_sessions_per_cleanup);
                if removed > 0 {
                    debug!(
                        removed,
                        remaining = tracker.len(),
                        "Evicted inactive sessions"
                    );
                }
            }
        })
    }
}
