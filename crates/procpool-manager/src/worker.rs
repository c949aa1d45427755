//! One external worker process.
//!
//! A [`Worker`] owns the lifecycle state of a spawned process and, while the
//! worker is idle, its [`WorkerChannel`]. Checkout moves the channel out to
//! the caller and checkin moves it back, so at most one party can talk to a
//! worker at any time.
//!
//! ```text
//!               ┌──────────── Worker (owned by the pool manager) ───────────┐
//!   checkout ──▶│ state machine, stats, Option<WorkerChannel>, kill switch  │
//!               └───────┬───────────────────────────────────────────────────┘
//!                       │ kill switch (mpsc)
//!                       ▼
//!               ┌────────────── watcher task ──────────────┐
//!               │ owns Child; waits for exit or kill;      │──▶ WorkerExit
//!               └──────────────────────────────────────────┘
//! ```
//!
//! The process is killed when the watcher's kill switch fires or when every
//! sender of it is dropped, so dropping a `Worker` always reaps its process.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::SinkExt;
use parking_lot::Mutex;
use procpool_core::protocol::{self, MessageCodec, ProtocolError, Request, Response};
use procpool_core::{PoolError, Result, WorkerHealth, WorkerId, WorkerState, WorkerStateMachine};
use serde_json::{json, Map, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, warn};

use crate::config::WorkerSpec;
use crate::types::{CheckinOutcome, WorkerInfo, WorkerKind, WorkerStats};

/// Command used for the startup handshake.
pub const PING_COMMAND: &str = "ping";

/// Command asking a worker to exit gracefully.
pub const SHUTDOWN_COMMAND: &str = "shutdown";

/// Extra time past the operation timeout before the pool kills a worker
/// whose caller has not given up on its own.
pub(crate) const ENFORCEMENT_GRACE: Duration = Duration::from_millis(500);

/// Reported by the watcher task when a worker process exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct WorkerExit {
    pub worker_id: WorkerId,
    pub code: Option<i32>,
}

/// Start time of the request currently in flight, shared between a channel
/// and its worker so the pool can enforce timeouts while the channel is out.
type InFlight = Arc<Mutex<Option<Instant>>>;

/// Exclusive duplex channel to one worker process.
pub struct WorkerChannel {
    worker_id: WorkerId,
    writer: FramedWrite<ChildStdin, MessageCodec>,
    reader: FramedRead<ChildStdout, MessageCodec>,
    next_id: u64,
    pending: HashMap<u64, String>,
    in_flight: InFlight,
    poisoned: bool,
}

impl std::fmt::Debug for WorkerChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerChannel")
            .field("worker_id", &self.worker_id)
            .field("next_id", &self.next_id)
            .field("poisoned", &self.poisoned)
            .finish_non_exhaustive()
    }
}

impl WorkerChannel {
    fn new(worker_id: WorkerId, stdin: ChildStdin, stdout: ChildStdout, spec: &WorkerSpec) -> Self {
        let codec = MessageCodec::new(spec.framing, spec.max_message_size);
        Self {
            worker_id,
            writer: FramedWrite::new(stdin, codec.clone()),
            reader: FramedRead::new(stdout, codec),
            next_id: 1,
            pending: HashMap::new(),
            in_flight: Arc::new(Mutex::new(None)),
            poisoned: false,
        }
    }

    /// The worker on the other end.
    #[must_use]
    pub const fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    /// True while a request is waiting for its response.
    #[must_use]
    pub fn is_in_flight(&self) -> bool {
        self.in_flight.lock().is_some()
    }

    /// True once the channel has seen an unrecoverable failure.
    #[must_use]
    pub const fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Send `command` and wait up to `timeout` for its response.
    ///
    /// A late response to a timed-out request is discarded when it arrives.
    ///
    /// # Errors
    ///
    /// - `OperationTimeout` if no response arrives in time
    /// - `PortClosed` if the process closed its pipes
    /// - `Protocol` for malformed or oversized frames; the channel is then
    ///   unusable
    pub async fn call(
        &mut self,
        command: &str,
        args: Map<String, Value>,
        timeout: Duration,
    ) -> Result<Response> {
        if self.poisoned {
            return Err(PoolError::PortClosed {
                worker_id: self.worker_id,
                reason: "channel unusable after an earlier failure".to_string(),
            });
        }

        let id = self.next_id;
        self.next_id += 1;
        let request = Request::new(id, command, args);
        self.pending.insert(id, command.to_string());
        *self.in_flight.lock() = Some(Instant::now());

        let result = tokio::time::timeout(timeout, self.exchange(request)).await;
        *self.in_flight.lock() = None;

        match result {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => {
                self.poisoned = true;
                Err(e)
            }
            Err(_) => {
                self.pending.remove(&id);
                Err(PoolError::OperationTimeout {
                    worker_id: self.worker_id,
                    command: command.to_string(),
                    timeout,
                })
            }
        }
    }

    async fn exchange(&mut self, request: Request) -> Result<Response> {
        let id = request.id;
        if let Err(e) = self.writer.send(&request).await {
            return Err(self.channel_error(e));
        }

        loop {
            let frame = match protocol::read_frame(&mut self.reader).await {
                Ok(frame) => frame,
                Err(e) => return Err(self.channel_error(e)),
            };
            let response = protocol::decode_response(&frame)
                .map_err(|e| PoolError::protocol(self.worker_id, e))?;

            match protocol::correlate(&response, &mut self.pending) {
                Ok(_) if response.id == id => return Ok(response),
                Ok(command) => {
                    debug!(
                        worker_id = %self.worker_id,
                        id = response.id,
                        command = %command,
                        "Dropping response to an abandoned request"
                    );
                }
                Err(e) => {
                    warn!(worker_id = %self.worker_id, error = %e, "Dropping unmatched response");
                }
            }
        }
    }

    fn channel_error(&self, err: ProtocolError) -> PoolError {
        match err {
            ProtocolError::Closed => PoolError::PortClosed {
                worker_id: self.worker_id,
                reason: "worker closed its output".to_string(),
            },
            ProtocolError::Io(e) => PoolError::PortClosed {
                worker_id: self.worker_id,
                reason: e.to_string(),
            },
            other => PoolError::protocol(self.worker_id, other),
        }
    }
}

/// A spawned worker process and its lifecycle state.
pub(crate) struct Worker {
    id: WorkerId,
    kind: WorkerKind,
    pid: Option<u32>,
    machine: WorkerStateMachine,
    stats: WorkerStats,
    started_at: DateTime<Utc>,
    started: Instant,
    ready_at: Instant,
    channel: Option<WorkerChannel>,
    in_flight: InFlight,
    lease_timeout: Duration,
    probe_failures: u32,
    kill_tx: mpsc::Sender<()>,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("state", &self.machine.state())
            .field("pid", &self.pid)
            .finish_non_exhaustive()
    }
}

impl Worker {
    /// Spawn the process and complete the startup handshake.
    ///
    /// The process is killed if the handshake fails.
    ///
    /// # Errors
    ///
    /// Returns `WorkerInitFailed` if the process cannot be spawned or does not
    /// answer `ping` successfully within the startup timeout.
    pub(crate) async fn start(
        spec: &WorkerSpec,
        kind: WorkerKind,
        exits: mpsc::UnboundedSender<WorkerExit>,
    ) -> Result<Self> {
        let id = WorkerId::generate();
        let init_failed = |reason: String| PoolError::WorkerInitFailed {
            worker_id: id,
            reason,
        };

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(flag) = &spec.worker_id_arg {
            command.arg(flag).arg(id.to_string());
        }
        if let Some(dir) = &spec.working_dir {
            command.current_dir(dir);
        }

        let mut child = command
            .spawn()
            .map_err(|e| init_failed(format!("failed to spawn '{}': {e}", spec.program)))?;
        let pid = child.id();
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| init_failed("stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| init_failed("stdout not captured".to_string()))?;
        if let Some(stderr) = child.stderr.take() {
            forward_stderr(id, stderr);
        }

        let (kill_tx, kill_rx) = mpsc::channel(1);
        watch_process(id, child, kill_rx, exits);

        let channel = WorkerChannel::new(id, stdin, stdout, spec);
        let now = Instant::now();
        let mut worker = Self {
            id,
            kind,
            pid,
            machine: WorkerStateMachine::new(),
            stats: WorkerStats::default(),
            started_at: Utc::now(),
            started: now,
            ready_at: now,
            in_flight: Arc::clone(&channel.in_flight),
            channel: None,
            lease_timeout: Duration::ZERO,
            probe_failures: 0,
            kill_tx,
        };

        // Dropping `worker` on any error below kills the process.
        let mut channel = channel;
        let response = channel
            .call(PING_COMMAND, Map::new(), spec.startup_timeout())
            .await
            .map_err(|e| init_failed(format!("startup ping failed: {e}")))?;
        if !response.success {
            return Err(init_failed(format!(
                "startup ping rejected: {}",
                response.error.unwrap_or_default()
            )));
        }

        let mut metadata = Map::new();
        metadata.insert("pid".to_string(), json!(pid));
        metadata.insert("kind".to_string(), json!(kind));
        worker
            .machine
            .transition(WorkerState::Ready, "init_complete", Some(metadata))?;
        worker.machine.update_health(WorkerHealth::Healthy);
        worker.channel = Some(channel);
        worker.ready_at = Instant::now();

        info!(worker_id = %id, pid, ?kind, "Worker ready");
        Ok(worker)
    }

    pub(crate) const fn id(&self) -> WorkerId {
        self.id
    }

    pub(crate) const fn kind(&self) -> WorkerKind {
        self.kind
    }

    pub(crate) const fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub(crate) const fn state(&self) -> WorkerState {
        self.machine.state()
    }

    pub(crate) const fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    /// True if the worker can be handed out right now.
    pub(crate) fn is_available(&self) -> bool {
        self.machine.can_accept_work() && self.channel.is_some()
    }

    /// True if the worker counts toward its kind's allocation.
    pub(crate) const fn is_live(&self) -> bool {
        self.machine.state().is_live()
    }

    /// Move the channel out to a caller.
    pub(crate) fn checkout(&mut self, operation_timeout: Duration) -> Result<WorkerChannel> {
        if !self.is_available() {
            return Err(PoolError::Internal(format!(
                "worker {} is not available ({})",
                self.id,
                self.machine.state()
            )));
        }
        self.machine.transition(WorkerState::Busy, "checkout", None)?;
        self.stats.checkouts += 1;
        self.stats.last_activity = Utc::now();
        self.lease_timeout = operation_timeout;
        self.channel
            .take()
            .ok_or_else(|| PoolError::Internal(format!("worker {} has no channel", self.id)))
    }

    /// Take the channel back from a caller.
    pub(crate) fn checkin(
        &mut self,
        channel: Option<WorkerChannel>,
        outcome: CheckinOutcome,
    ) -> Result<()> {
        self.stats.last_activity = Utc::now();
        if self.machine.state() != WorkerState::Busy {
            // Killed or retired while checked out; the channel is dead weight.
            return Ok(());
        }

        let outcome = match channel {
            Some(ref ch) if !ch.is_poisoned() => outcome,
            _ => CheckinOutcome::Broken,
        };
        match outcome {
            CheckinOutcome::Success => {
                self.stats.successful_checkins += 1;
                self.machine
                    .transition(WorkerState::Ready, "checkin_success", None)?;
                self.channel = channel;
            }
            CheckinOutcome::Error => {
                self.stats.error_checkins += 1;
                self.machine
                    .transition(WorkerState::Degraded, "checkin_error", None)?;
                self.channel = channel;
            }
            CheckinOutcome::Broken => {
                self.stats.error_checkins += 1;
                self.kill("checkin_broken");
            }
        }
        Ok(())
    }

    /// Lend the channel to the health monitor. The state is left unchanged;
    /// the worker is unavailable until [`Worker::end_probe`].
    pub(crate) fn begin_probe(&mut self, recovery_delay: Duration) -> Option<WorkerChannel> {
        let probe_state = matches!(
            self.machine.state(),
            WorkerState::Ready | WorkerState::Degraded
        );
        if !probe_state || self.ready_at.elapsed() < recovery_delay {
            return None;
        }
        self.channel.take()
    }

    /// Return a probe's channel and record the result.
    ///
    /// Returns the consecutive failure count after this probe.
    pub(crate) fn end_probe(&mut self, channel: Option<WorkerChannel>, healthy: bool) -> u32 {
        if self.machine.state().is_terminal() {
            return self.probe_failures;
        }
        match channel {
            Some(ch) if !ch.is_poisoned() => self.channel = Some(ch),
            _ => {
                self.kill("probe_channel_broken");
                return self.probe_failures;
            }
        }
        if healthy {
            self.probe_failures = 0;
        } else {
            self.probe_failures += 1;
        }
        self.probe_failures
    }

    /// Return a lent channel whose probe never ran.
    pub(crate) fn cancel_probe(&mut self, channel: WorkerChannel) {
        if !self.machine.state().is_terminal() && self.channel.is_none() {
            self.channel = Some(channel);
        }
    }

    /// `ready -> degraded` after repeated probe failures.
    pub(crate) fn mark_unhealthy(&mut self) -> Result<bool> {
        self.machine.update_health(WorkerHealth::Unhealthy);
        if self.machine.state() == WorkerState::Ready {
            self.machine
                .transition(WorkerState::Degraded, "health_check_failed", None)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// `degraded -> ready` after a passing probe.
    pub(crate) fn mark_healthy(&mut self) -> Result<bool> {
        self.machine.update_health(WorkerHealth::Healthy);
        if self.machine.state() == WorkerState::Degraded {
            self.machine
                .transition(WorkerState::Ready, "health_restored", None)?;
            self.ready_at = Instant::now();
            return Ok(true);
        }
        Ok(false)
    }

    /// Force the worker out of service and kill its process now.
    pub(crate) fn kill(&mut self, reason: &str) {
        if self.machine.state().is_terminal() {
            let _ = self.kill_tx.try_send(());
            return;
        }
        warn!(worker_id = %self.id, reason, "Killing worker");
        let _ = self.machine.force(WorkerState::Terminating, reason);
        self.channel = None;
        let _ = self.kill_tx.try_send(());
    }

    /// Ask the worker to exit, killing it after `grace` if it does not.
    pub(crate) fn retire(&mut self, reason: &str, grace: Duration) {
        if self.machine.state().is_terminal() {
            return;
        }
        info!(worker_id = %self.id, reason, "Retiring worker");
        let _ = self
            .machine
            .transition(WorkerState::Terminating, "shutdown", Some(reason_metadata(reason)));

        let channel = self.channel.take();
        let kill_tx = self.kill_tx.clone();
        let worker_id = self.id;
        tokio::spawn(async move {
            if let Some(mut channel) = channel {
                let mut args = Map::new();
                args.insert("worker_id".to_string(), json!(worker_id.to_string()));
                if let Err(e) = channel.call(SHUTDOWN_COMMAND, args, grace).await {
                    debug!(worker_id = %worker_id, error = %e, "Shutdown command not acknowledged");
                }
                // Closing stdin is the second exit signal.
                drop(channel);
            }
            tokio::time::sleep(grace).await;
            let _ = kill_tx.send(()).await;
        });
    }

    /// The process exited; nothing can follow.
    pub(crate) fn detect_exit(&mut self) {
        let result = if self.machine.state() == WorkerState::Terminating {
            self.machine.transition(WorkerState::Terminated, "terminate", None)
        } else {
            self.machine.force(WorkerState::Terminated, "process_exit")
        };
        if let Err(e) = result {
            debug!(worker_id = %self.id, error = %e, "Exit after termination");
        }
        self.channel = None;
    }

    /// Kill the worker if its current request has outlived its lease.
    ///
    /// Returns true if the worker was killed.
    pub(crate) fn enforce_operation_timeout(&mut self, now: Instant) -> bool {
        if self.machine.state() != WorkerState::Busy {
            return false;
        }
        let started = *self.in_flight.lock();
        let limit = self.lease_timeout + ENFORCEMENT_GRACE;
        match started {
            Some(at) if now.saturating_duration_since(at) > limit => {
                warn!(
                    worker_id = %self.id,
                    timeout_ms = u64::try_from(self.lease_timeout.as_millis()).unwrap_or(u64::MAX),
                    "Operation outlived its timeout"
                );
                self.kill("operation_timeout");
                true
            }
            _ => false,
        }
    }

    pub(crate) fn info(&self) -> WorkerInfo {
        WorkerInfo {
            id: self.id,
            kind: self.kind,
            state: self.machine.state(),
            health: self.machine.health(),
            pid: self.pid,
            stats: self.stats,
            started_at: self.started_at,
            uptime_seconds: self.started.elapsed().as_secs(),
            state_seconds: self.machine.time_in_state().as_secs(),
            metadata: self.machine.metadata().clone(),
            history: self.machine.history().cloned().collect(),
        }
    }
}

fn reason_metadata(reason: &str) -> Map<String, Value> {
    let mut metadata = Map::new();
    metadata.insert("reason".to_string(), json!(reason));
    metadata
}

fn forward_stderr(worker_id: WorkerId, stderr: tokio::process::ChildStderr) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(worker_id = %worker_id, "{line}");
        }
    });
}

fn watch_process(
    worker_id: WorkerId,
    mut child: Child,
    mut kill_rx: mpsc::Receiver<()>,
    exits: mpsc::UnboundedSender<WorkerExit>,
) {
    tokio::spawn(async move {
        let status = tokio::select! {
            status = child.wait() => status,
            // Fires on an explicit kill and when every sender is dropped.
            _ = kill_rx.recv() => {
                if let Err(e) = child.start_kill() {
                    debug!(worker_id = %worker_id, error = %e, "Kill failed");
                }
                child.wait().await
            }
        };
        let code = match status {
            Ok(status) => status.code(),
            Err(e) => {
                warn!(worker_id = %worker_id, error = %e, "Failed to wait for worker process");
                None
            }
        };
        let _ = exits.send(WorkerExit { worker_id, code });
    });
}
