//! Structured pool events.
//!
//! The pool publishes a [`PoolEvent`] for every lifecycle change worth
//! exporting. Consumers call [`ProcessPool::subscribe`](crate::ProcessPool::subscribe)
//! and forward events to whatever telemetry sink they use. Publishing never
//! blocks; a subscriber that falls behind loses the oldest events.

use std::time::Duration;

use procpool_core::{ErrorKind, SessionId, WorkerId};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::types::WorkerKind;

const EVENT_CAPACITY: usize = 256;

/// A lifecycle or operation event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum PoolEvent {
    /// A worker passed its startup handshake.
    WorkerStarted {
        /// The new worker.
        worker_id: WorkerId,
        /// Fixed or overflow.
        kind: WorkerKind,
        /// OS process id.
        pid: Option<u32>,
    },
    /// A worker process exited.
    WorkerExited {
        /// The worker.
        worker_id: WorkerId,
        /// Exit code, if the process exited normally.
        code: Option<i32>,
        /// False if the exit was not requested by the pool.
        expected: bool,
    },
    /// A fixed worker was replaced by a fresh one.
    WorkerReplaced {
        /// The worker that went away.
        old: WorkerId,
        /// Its replacement.
        new: WorkerId,
    },
    /// A worker was marked degraded.
    WorkerDegraded {
        /// The worker.
        worker_id: WorkerId,
        /// Trigger name.
        reason: String,
    },
    /// A degraded worker passed a probe again.
    WorkerRecovered {
        /// The worker.
        worker_id: WorkerId,
    },
    /// A caller gave up waiting for a worker.
    CheckoutTimedOut {
        /// How long the caller waited.
        waited_ms: u64,
    },
    /// A request finished.
    OperationCompleted {
        /// Session the request belonged to, if any.
        session_id: Option<SessionId>,
        /// Command name.
        command: String,
        /// Wall time including checkout.
        duration_ms: u64,
        /// Failure kind, `None` on success.
        error: Option<ErrorKind>,
    },
    /// The pool manager was restarted by its supervisor.
    PoolRestarted {
        /// Restarts inside the current window.
        restarts: u32,
        /// Why the previous manager stopped.
        reason: String,
    },
}

/// Broadcast sender for [`PoolEvent`]s.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: broadcast::Sender<PoolEvent>,
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink {
    /// Create a sink with the default buffer.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    /// Publish an event. Dropped silently when nobody listens.
    pub fn emit(&self, event: PoolEvent) {
        let _ = self.tx.send(event);
    }

    /// Subscribe to events published from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.tx.subscribe()
    }
}

pub(crate) fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emit_without_subscribers_is_noop() {
        let sink = EventSink::new();
        sink.emit(PoolEvent::WorkerRecovered {
            worker_id: WorkerId::generate(),
        });
    }

    #[tokio::test]
    async fn subscribers_receive_events() {
        let sink = EventSink::new();
        let mut rx = sink.subscribe();
        let worker_id = WorkerId::generate();

        sink.emit(PoolEvent::WorkerDegraded {
            worker_id,
            reason: "checkin_error".into(),
        });

        match rx.recv().await.unwrap() {
            PoolEvent::WorkerDegraded { worker_id: id, .. } => assert_eq!(id, worker_id),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn events_serialize_tagged() {
        let value = serde_json::to_value(PoolEvent::CheckoutTimedOut { waited_ms: 100 }).unwrap();
        assert_eq!(value["event"], "checkout_timed_out");
        assert_eq!(value["waited_ms"], 100);
    }
}
