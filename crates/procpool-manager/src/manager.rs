//! The pool manager actor.
//!
//! A single task owns every [`Worker`] and the FIFO queue of waiting callers.
//! All mutations arrive as [`PoolCommand`] messages (or process exit reports),
//! so there is exactly one serialization point for "which worker is free".
//! Payload traffic never passes through here: a checkout moves the worker's
//! channel into a [`WorkerHandle`] and the caller talks to the process
//! directly.
//!
//! ```text
//!   ProcessPool ──┐                         ┌── WorkerStarted (spawn tasks)
//!   HealthMonitor ├──▶ mpsc<PoolCommand> ──▶│
//!   WorkerHandle ─┘     (checkin on drop)   │   Manager { workers, queue }
//!                                           │
//!   watcher tasks ───▶ mpsc<WorkerExit> ───▶└── maintenance tick
//! ```

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use procpool_core::{PoolError, Result, WorkerId, WorkerState};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::PoolConfig;
use crate::events::{millis, EventSink, PoolEvent};
use crate::handle::WorkerHandle;
use crate::types::{CheckinOutcome, PoolStats, WorkerInfo, WorkerKind};
use crate::worker::{Worker, WorkerChannel, WorkerExit};

const MAINTENANCE_INTERVAL: Duration = Duration::from_millis(250);

/// Slack added to a checkout deadline before the caller stops waiting for
/// the manager's answer.
const REPLY_SLACK: Duration = Duration::from_secs(1);

/// Messages understood by the manager.
#[derive(Debug)]
pub(crate) enum PoolCommand {
    Checkout {
        deadline: Instant,
        timeout: Duration,
        operation_timeout: Duration,
        reply: oneshot::Sender<Result<WorkerHandle>>,
    },
    Checkin {
        worker_id: WorkerId,
        channel: Option<WorkerChannel>,
        outcome: CheckinOutcome,
    },
    WorkerStarted {
        kind: WorkerKind,
        result: Box<Result<Worker>>,
    },
    Stats {
        reply: oneshot::Sender<PoolStats>,
    },
    Workers {
        reply: oneshot::Sender<Vec<WorkerInfo>>,
    },
    ProbeTargets {
        reply: oneshot::Sender<Vec<ProbeLease>>,
    },
    ProbeResult {
        worker_id: WorkerId,
        channel: Option<WorkerChannel>,
        healthy: bool,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
    #[cfg(test)]
    Crash,
}

/// A worker's channel lent to the health monitor.
#[derive(Debug)]
pub(crate) struct ProbeLease {
    pub worker_id: WorkerId,
    pub channel: WorkerChannel,
}

struct QueuedCheckout {
    enqueued_at: Instant,
    deadline: Instant,
    timeout: Duration,
    operation_timeout: Duration,
    reply: oneshot::Sender<Result<WorkerHandle>>,
}

/// Client side of the manager's mailbox.
#[derive(Debug, Clone)]
pub(crate) struct ManagerHandle {
    tx: mpsc::UnboundedSender<PoolCommand>,
}

impl ManagerHandle {
    fn send(&self, command: PoolCommand) -> Result<()> {
        self.tx
            .send(command)
            .map_err(|_| PoolError::unavailable("pool manager is not running"))
    }

    async fn ask<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> PoolCommand) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.send(make(reply))?;
        rx.await
            .map_err(|_| PoolError::unavailable("pool manager stopped before replying"))
    }

    pub(crate) async fn checkout(
        &self,
        timeout: Duration,
        operation_timeout: Duration,
    ) -> Result<WorkerHandle> {
        let deadline = Instant::now() + timeout;
        let (reply, rx) = oneshot::channel();
        self.send(PoolCommand::Checkout {
            deadline,
            timeout,
            operation_timeout,
            reply,
        })?;
        match tokio::time::timeout(timeout + REPLY_SLACK, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(PoolError::unavailable("pool manager stopped during checkout")),
            Err(_) => Err(PoolError::Internal(
                "pool manager did not answer a checkout in time".to_string(),
            )),
        }
    }

    pub(crate) async fn stats(&self) -> Result<PoolStats> {
        self.ask(|reply| PoolCommand::Stats { reply }).await
    }

    pub(crate) async fn workers(&self) -> Result<Vec<WorkerInfo>> {
        self.ask(|reply| PoolCommand::Workers { reply }).await
    }

    pub(crate) async fn probe_targets(&self) -> Result<Vec<ProbeLease>> {
        self.ask(|reply| PoolCommand::ProbeTargets { reply }).await
    }

    pub(crate) fn probe_result(
        &self,
        worker_id: WorkerId,
        channel: Option<WorkerChannel>,
        healthy: bool,
    ) -> Result<()> {
        self.send(PoolCommand::ProbeResult {
            worker_id,
            channel,
            healthy,
        })
    }

    pub(crate) async fn shutdown(&self) -> Result<()> {
        self.ask(|reply| PoolCommand::Shutdown { reply }).await
    }

    /// Ask the manager to shut down without waiting for it.
    pub(crate) fn request_shutdown(&self) {
        let (reply, _) = oneshot::channel();
        let _ = self.send(PoolCommand::Shutdown { reply });
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    #[cfg(test)]
    pub(crate) fn crash(&self) -> Result<()> {
        self.send(PoolCommand::Crash)
    }
}

/// Start `pool_size` workers and spawn the manager task.
///
/// Fails fast: if any worker does not come up, the ones that did are killed
/// and no manager is left running.
pub(crate) async fn launch(
    config: PoolConfig,
    events: EventSink,
) -> Result<(ManagerHandle, JoinHandle<Result<()>>)> {
    let (tx, rx) = mpsc::unbounded_channel();
    let (exits_tx, exits_rx) = mpsc::unbounded_channel();

    let starts = (0..config.pool_size)
        .map(|_| Worker::start(&config.worker, WorkerKind::Fixed, exits_tx.clone()));
    let results = futures::future::join_all(starts).await;

    let mut workers = HashMap::with_capacity(config.pool_size);
    let mut first_error = None;
    for result in results {
        match result {
            Ok(worker) => {
                workers.insert(worker.id(), worker);
            }
            Err(e) => {
                error!(error = %e, "Worker failed to start");
                first_error.get_or_insert(e);
            }
        }
    }
    if let Some(e) = first_error {
        // Dropping the workers kills their processes.
        drop(workers);
        return Err(e);
    }

    for worker in workers.values() {
        events.emit(PoolEvent::WorkerStarted {
            worker_id: worker.id(),
            kind: WorkerKind::Fixed,
            pid: worker.pid(),
        });
    }
    info!(pool_size = config.pool_size, overflow = config.overflow, "Pool manager started");

    let manager = Manager {
        config,
        events,
        workers,
        queue: VecDeque::new(),
        mailbox: tx.clone(),
        exits_tx,
        pending_fixed: 0,
        pending_overflow: 0,
        respawn_failures: 0,
        respawn_not_before: None,
        replacing: VecDeque::new(),
        shutdown: None,
    };
    let join = tokio::spawn(manager.run(rx, exits_rx));
    Ok((ManagerHandle { tx }, join))
}

struct ShutdownState {
    reply: Option<oneshot::Sender<()>>,
    deadline: Instant,
}

struct Manager {
    config: PoolConfig,
    events: EventSink,
    workers: HashMap<WorkerId, Worker>,
    queue: VecDeque<QueuedCheckout>,
    mailbox: mpsc::UnboundedSender<PoolCommand>,
    exits_tx: mpsc::UnboundedSender<WorkerExit>,
    pending_fixed: usize,
    pending_overflow: usize,
    respawn_failures: u32,
    respawn_not_before: Option<Instant>,
    replacing: VecDeque<WorkerId>,
    shutdown: Option<ShutdownState>,
}

impl Manager {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<PoolCommand>,
        mut exits: mpsc::UnboundedReceiver<WorkerExit>,
    ) -> Result<()> {
        let mut tick = tokio::time::interval(MAINTENANCE_INTERVAL);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let next_deadline = self.queue.iter().map(|q| q.deadline).min();
            let wake_at = next_deadline.unwrap_or_else(Instant::now);
            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else {
                        break;
                    };
                    self.handle(command)?;
                }
                Some(exit) = exits.recv() => self.on_exit(exit),
                () = sleep_until(wake_at.into()), if next_deadline.is_some() => {
                    self.expire_queue(Instant::now());
                }
                _ = tick.tick() => self.maintain(Instant::now()),
            }

            if self.shutdown_complete() {
                break;
            }
        }

        if let Some(reply) = self.shutdown.as_mut().and_then(|s| s.reply.take()) {
            let _ = reply.send(());
        }
        info!("Pool manager stopped");
        Ok(())
    }

    fn handle(&mut self, command: PoolCommand) -> Result<()> {
        match command {
            PoolCommand::Checkout {
                deadline,
                timeout,
                operation_timeout,
                reply,
            } => self.checkout(QueuedCheckout {
                enqueued_at: Instant::now(),
                deadline,
                timeout,
                operation_timeout,
                reply,
            }),
            PoolCommand::Checkin {
                worker_id,
                channel,
                outcome,
            } => self.checkin(worker_id, channel, outcome),
            PoolCommand::WorkerStarted { kind, result } => self.on_started(kind, *result),
            PoolCommand::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
            PoolCommand::Workers { reply } => {
                let mut infos: Vec<WorkerInfo> = self.workers.values().map(Worker::info).collect();
                infos.sort_by_key(|i| i.started_at);
                let _ = reply.send(infos);
            }
            PoolCommand::ProbeTargets { reply } => {
                let leases = self.probe_targets();
                if let Err(leases) = reply.send(leases) {
                    for lease in leases {
                        if let Some(worker) = self.workers.get_mut(&lease.worker_id) {
                            worker.cancel_probe(lease.channel);
                        }
                    }
                    self.dispatch();
                }
            }
            PoolCommand::ProbeResult {
                worker_id,
                channel,
                healthy,
            } => self.on_probe_result(worker_id, channel, healthy),
            PoolCommand::Shutdown { reply } => self.begin_shutdown(reply),
            #[cfg(test)]
            PoolCommand::Crash => {
                return Err(PoolError::Internal("injected manager crash".to_string()));
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Checkout / checkin
    // ------------------------------------------------------------------

    fn checkout(&mut self, request: QueuedCheckout) {
        if self.shutdown.is_some() {
            let _ = request
                .reply
                .send(Err(PoolError::unavailable("pool is shutting down")));
            return;
        }

        if self.queue.is_empty() {
            if let Some(worker_id) = self.pick_available() {
                self.hand_out(worker_id, request);
                return;
            }
        }

        let now = Instant::now();
        if request.deadline <= now {
            self.reply_timeout(request, now);
            return;
        }

        self.queue.push_back(request);
        self.maybe_spawn_overflow();
    }

    /// Ready and healthy worker with the fewest checkouts.
    fn pick_available(&self) -> Option<WorkerId> {
        self.workers
            .values()
            .filter(|w| w.is_available())
            .min_by_key(|w| (w.stats().checkouts, w.kind() == WorkerKind::Overflow))
            .map(Worker::id)
    }

    fn hand_out(&mut self, worker_id: WorkerId, request: QueuedCheckout) {
        let Some(worker) = self.workers.get_mut(&worker_id) else {
            return;
        };
        match worker.checkout(request.operation_timeout) {
            Ok(channel) => {
                debug!(
                    worker_id = %worker_id,
                    waited_ms = millis(request.enqueued_at.elapsed()),
                    "Worker checked out"
                );
                let handle =
                    WorkerHandle::new(channel, request.operation_timeout, self.mailbox.clone());
                // A caller that gave up drops the handle here, which checks
                // the worker back in.
                let _ = request.reply.send(Ok(handle));
            }
            Err(e) => {
                error!(worker_id = %worker_id, error = %e, "Checkout of available worker failed");
                let _ = request.reply.send(Err(e));
            }
        }
    }

    fn reply_timeout(&self, request: QueuedCheckout, now: Instant) {
        let waited = now.saturating_duration_since(request.enqueued_at);
        debug!(waited_ms = millis(waited), "Checkout timed out");
        self.events.emit(PoolEvent::CheckoutTimedOut {
            waited_ms: millis(waited),
        });
        let _ = request.reply.send(Err(PoolError::CheckoutTimeout {
            timeout: request.timeout,
        }));
    }

    /// Serve queued callers in FIFO order while workers are available.
    fn dispatch(&mut self) {
        let now = Instant::now();
        while !self.queue.is_empty() {
            let Some(worker_id) = self.pick_available() else {
                break;
            };
            let Some(request) = self.queue.pop_front() else {
                break;
            };
            if request.reply.is_closed() {
                continue;
            }
            if request.deadline <= now {
                self.reply_timeout(request, now);
                continue;
            }
            self.hand_out(worker_id, request);
        }
        self.retire_idle_overflow();
    }

    /// Overflow workers only live while callers are waiting.
    fn retire_idle_overflow(&mut self) {
        if !self.queue.is_empty() {
            return;
        }
        let grace = self.config.worker.shutdown_grace();
        for worker in self.workers.values_mut() {
            if worker.kind() == WorkerKind::Overflow && worker.is_available() {
                worker.retire("overflow_idle", grace);
            }
        }
    }

    fn expire_queue(&mut self, now: Instant) {
        let queued = std::mem::take(&mut self.queue);
        let mut kept = VecDeque::with_capacity(queued.len());
        for request in queued {
            if request.reply.is_closed() {
                continue;
            }
            if request.deadline <= now {
                self.reply_timeout(request, now);
            } else {
                kept.push_back(request);
            }
        }
        self.queue = kept;
        self.retire_idle_overflow();
    }

    fn checkin(
        &mut self,
        worker_id: WorkerId,
        channel: Option<WorkerChannel>,
        outcome: CheckinOutcome,
    ) {
        let grace = self.config.worker.shutdown_grace();
        let shutting_down = self.shutdown.is_some();

        let Some(worker) = self.workers.get_mut(&worker_id) else {
            debug!(worker_id = %worker_id, "Checkin for a worker that is gone");
            return;
        };
        if let Err(e) = worker.checkin(channel, outcome) {
            error!(worker_id = %worker_id, error = %e, "Checkin rejected");
            worker.kill("checkin_rejected");
        }

        match worker.state() {
            WorkerState::Degraded => {
                self.events.emit(PoolEvent::WorkerDegraded {
                    worker_id,
                    reason: "checkin_error".to_string(),
                });
                worker.retire("checkin_error", grace);
            }
            WorkerState::Ready if shutting_down => worker.retire("pool_shutdown", grace),
            _ => {}
        }

        self.dispatch();
        self.reconcile(Instant::now());
    }

    // ------------------------------------------------------------------
    // Spawning and replacement
    // ------------------------------------------------------------------

    fn live_count(&self, kind: WorkerKind) -> usize {
        let pending = match kind {
            WorkerKind::Fixed => self.pending_fixed,
            WorkerKind::Overflow => self.pending_overflow,
        };
        self.workers
            .values()
            .filter(|w| w.kind() == kind && w.is_live())
            .count()
            + pending
    }

    fn spawn(&mut self, kind: WorkerKind) {
        match kind {
            WorkerKind::Fixed => self.pending_fixed += 1,
            WorkerKind::Overflow => self.pending_overflow += 1,
        }
        let spec = self.config.worker.clone();
        let exits = self.exits_tx.clone();
        let mailbox = self.mailbox.clone();
        tokio::spawn(async move {
            let result = Worker::start(&spec, kind, exits).await;
            let _ = mailbox.send(PoolCommand::WorkerStarted {
                kind,
                result: Box::new(result),
            });
        });
    }

    fn maybe_spawn_overflow(&mut self) {
        let total = self.live_count(WorkerKind::Fixed) + self.live_count(WorkerKind::Overflow);
        let capacity = self.config.pool_size + self.config.overflow;
        if total < capacity && self.pending_overflow < self.queue.len() {
            debug!(queued = self.queue.len(), "Spawning overflow worker");
            self.spawn(WorkerKind::Overflow);
        }
    }

    /// Remember fixed workers that left service so their replacement can be
    /// reported against them.
    fn note_replacements(&mut self) {
        for worker in self.workers.values() {
            if worker.kind() == WorkerKind::Fixed
                && !worker.is_live()
                && !self.replacing.contains(&worker.id())
            {
                self.replacing.push_back(worker.id());
            }
        }
    }

    /// Restore the fixed allocation to `pool_size`.
    fn reconcile(&mut self, now: Instant) {
        if self.shutdown.is_some() {
            return;
        }
        self.note_replacements();
        if self.respawn_not_before.is_some_and(|t| now < t) {
            return;
        }
        let live = self.live_count(WorkerKind::Fixed);
        for _ in live..self.config.pool_size {
            self.spawn(WorkerKind::Fixed);
        }
    }

    fn on_started(&mut self, kind: WorkerKind, result: Result<Worker>) {
        match kind {
            WorkerKind::Fixed => self.pending_fixed = self.pending_fixed.saturating_sub(1),
            WorkerKind::Overflow => self.pending_overflow = self.pending_overflow.saturating_sub(1),
        }

        let mut worker = match result {
            Ok(worker) => worker,
            Err(e) => {
                if kind == WorkerKind::Fixed {
                    self.respawn_failures += 1;
                    let delay = self.config.respawn_backoff.delay(self.respawn_failures);
                    self.respawn_not_before = Some(Instant::now() + delay);
                    warn!(
                        error = %e,
                        failures = self.respawn_failures,
                        retry_in_ms = millis(delay),
                        "Replacement worker failed to start"
                    );
                } else {
                    warn!(error = %e, "Overflow worker failed to start");
                }
                return;
            }
        };

        let worker_id = worker.id();
        if self.shutdown.is_some() {
            worker.retire("pool_shutdown", self.config.worker.shutdown_grace());
            self.workers.insert(worker_id, worker);
            return;
        }

        if kind == WorkerKind::Fixed {
            self.respawn_failures = 0;
            self.respawn_not_before = None;
            if let Some(old) = self.replacing.pop_front() {
                info!(old = %old, new = %worker_id, "Worker replaced");
                self.events.emit(PoolEvent::WorkerReplaced {
                    old,
                    new: worker_id,
                });
            }
        }
        self.events.emit(PoolEvent::WorkerStarted {
            worker_id,
            kind,
            pid: worker.pid(),
        });
        self.workers.insert(worker_id, worker);
        self.dispatch();
    }

    fn on_exit(&mut self, exit: WorkerExit) {
        let Some(mut worker) = self.workers.remove(&exit.worker_id) else {
            // Failed startups and duplicates.
            return;
        };
        let expected = worker.state().is_terminal();
        worker.detect_exit();

        if expected {
            debug!(worker_id = %exit.worker_id, code = ?exit.code, "Worker exited");
        } else {
            warn!(
                worker_id = %exit.worker_id,
                code = ?exit.code,
                state = %worker.state(),
                "Worker exited unexpectedly"
            );
        }
        self.events.emit(PoolEvent::WorkerExited {
            worker_id: exit.worker_id,
            code: exit.code,
            expected,
        });

        // Workers retired earlier were noted when they left service.
        if worker.kind() == WorkerKind::Fixed && !expected && self.shutdown.is_none() {
            self.replacing.push_back(exit.worker_id);
        }
        self.reconcile(Instant::now());
    }

    fn maintain(&mut self, now: Instant) {
        for worker in self.workers.values_mut() {
            worker.enforce_operation_timeout(now);
        }
        self.expire_queue(now);
        self.reconcile(now);

        if let Some(shutdown) = &self.shutdown {
            if now >= shutdown.deadline {
                for worker in self.workers.values_mut() {
                    worker.kill("shutdown_deadline");
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Health probes
    // ------------------------------------------------------------------

    fn probe_targets(&mut self) -> Vec<ProbeLease> {
        if self.shutdown.is_some() {
            return Vec::new();
        }
        let recovery_delay = self.config.health.recovery_delay();
        self.workers
            .values_mut()
            .filter_map(|w| {
                w.begin_probe(recovery_delay).map(|channel| ProbeLease {
                    worker_id: w.id(),
                    channel,
                })
            })
            .collect()
    }

    fn on_probe_result(
        &mut self,
        worker_id: WorkerId,
        channel: Option<WorkerChannel>,
        healthy: bool,
    ) {
        let threshold = self.config.failure_threshold;
        let max_failures = self.config.health.max_consecutive_failures;
        let grace = self.config.worker.shutdown_grace();

        let Some(worker) = self.workers.get_mut(&worker_id) else {
            return;
        };
        let failures = worker.end_probe(channel, healthy);

        if healthy {
            match worker.mark_healthy() {
                Ok(true) => {
                    info!(worker_id = %worker_id, "Worker recovered");
                    self.events.emit(PoolEvent::WorkerRecovered { worker_id });
                }
                Ok(false) => {}
                Err(e) => warn!(worker_id = %worker_id, error = %e, "Recovery rejected"),
            }
        } else if failures >= max_failures {
            warn!(worker_id = %worker_id, failures, "Worker failed too many probes");
            worker.retire("health_check_exhausted", grace);
        } else if failures >= threshold {
            match worker.mark_unhealthy() {
                Ok(true) => {
                    warn!(worker_id = %worker_id, failures, "Worker degraded");
                    self.events.emit(PoolEvent::WorkerDegraded {
                        worker_id,
                        reason: "health_check_failed".to_string(),
                    });
                }
                Ok(false) => {}
                Err(e) => warn!(worker_id = %worker_id, error = %e, "Degrade rejected"),
            }
        }

        self.dispatch();
        self.reconcile(Instant::now());
    }

    // ------------------------------------------------------------------
    // Stats and shutdown
    // ------------------------------------------------------------------

    fn stats(&self) -> PoolStats {
        let mut stats = PoolStats {
            pool_size: self.config.pool_size,
            queued: self.queue.len(),
            initializing: self.pending_fixed + self.pending_overflow,
            ..PoolStats::default()
        };
        for worker in self.workers.values() {
            if worker.kind() == WorkerKind::Overflow && worker.is_live() {
                stats.overflow_active += 1;
            }
            match worker.state() {
                // Includes workers lent to a probe.
                WorkerState::Ready => stats.available += 1,
                WorkerState::Busy => stats.busy += 1,
                WorkerState::Degraded => stats.degraded += 1,
                WorkerState::Initializing => stats.initializing += 1,
                WorkerState::Terminating | WorkerState::Terminated => {}
            }
        }
        stats
    }

    fn begin_shutdown(&mut self, reply: oneshot::Sender<()>) {
        if self.shutdown.is_some() {
            let _ = reply.send(());
            return;
        }
        info!(workers = self.workers.len(), "Pool manager shutting down");
        let grace = self.config.worker.shutdown_grace();
        self.shutdown = Some(ShutdownState {
            reply: Some(reply),
            deadline: Instant::now() + grace + REPLY_SLACK,
        });

        for request in self.queue.drain(..) {
            let _ = request
                .reply
                .send(Err(PoolError::unavailable("pool is shutting down")));
        }
        for worker in self.workers.values_mut() {
            worker.retire("pool_shutdown", grace);
        }
    }

    fn shutdown_complete(&self) -> bool {
        self.shutdown.is_some()
            && self.workers.is_empty()
            && self.pending_fixed == 0
            && self.pending_overflow == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkerSpec;
    use crate::worker::tests::sed_spec;

    fn config(pool_size: usize, overflow: usize) -> PoolConfig {
        let mut config = PoolConfig::new(sed_spec());
        config.pool_size = pool_size;
        config.overflow = overflow;
        config.checkout_timeout_ms = 200;
        config
    }

    #[tokio::test]
    async fn launch_and_stats() {
        let (manager, join) = launch(config(2, 0), EventSink::new()).await.unwrap();
        let stats = manager.stats().await.unwrap();
        assert_eq!(stats.pool_size, 2);
        assert_eq!(stats.available, 2);
        assert_eq!(stats.busy, 0);
        assert_eq!(stats.queued, 0);

        manager.shutdown().await.unwrap();
        assert!(join.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn launch_fails_fast() {
        let mut config = config(2, 0);
        config.worker = WorkerSpec::new("/nonexistent/procpool-worker");
        let err = launch(config, EventSink::new()).await.err().unwrap();
        assert_eq!(err.kind(), procpool_core::ErrorKind::WorkerInitFailed);
    }

    #[tokio::test]
    async fn checkout_prefers_least_used_worker() {
        let (manager, _join) = launch(config(2, 0), EventSink::new()).await.unwrap();
        let timeout = Duration::from_millis(200);
        let op = Duration::from_secs(1);

        let first = manager.checkout(timeout, op).await.unwrap();
        let first_id = first.worker_id();
        drop(first);

        let second = manager.checkout(timeout, op).await.unwrap();
        assert_ne!(second.worker_id(), first_id);
        drop(second);
        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn zero_timeout_on_exhausted_pool_fails_immediately() {
        let (manager, _join) = launch(config(1, 0), EventSink::new()).await.unwrap();
        let op = Duration::from_secs(1);
        let held = manager.checkout(Duration::from_millis(200), op).await.unwrap();

        let started = Instant::now();
        let err = manager.checkout(Duration::ZERO, op).await.err().unwrap();
        assert_eq!(err.kind(), procpool_core::ErrorKind::CheckoutTimeout);
        assert!(started.elapsed() < Duration::from_millis(100));

        drop(held);
        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn queued_checkout_served_on_checkin() {
        let (manager, _join) = launch(config(1, 0), EventSink::new()).await.unwrap();
        let op = Duration::from_secs(1);
        let held = manager.checkout(Duration::from_millis(200), op).await.unwrap();
        let held_id = held.worker_id();

        let waiter = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.checkout(Duration::from_secs(2), op).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(manager.stats().await.unwrap().queued, 1);

        held.checkin(CheckinOutcome::Success);
        let handle = waiter.await.unwrap().unwrap();
        assert_eq!(handle.worker_id(), held_id);
        drop(handle);
        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn overflow_worker_retired_when_waiter_gives_up() {
        let (manager, _join) = launch(config(1, 1), EventSink::new()).await.unwrap();
        let op = Duration::from_secs(1);
        let fixed = manager.checkout(Duration::from_millis(200), op).await.unwrap();
        let overflow = manager.checkout(Duration::from_secs(5), op).await.unwrap();
        assert_eq!(manager.stats().await.unwrap().overflow_active, 1);

        let waiter = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.checkout(Duration::from_secs(5), op).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(manager.stats().await.unwrap().queued, 1);
        waiter.abort();
        let _ = waiter.await;

        overflow.checkin(CheckinOutcome::Success);
        let stats = manager.stats().await.unwrap();
        assert_eq!(stats.overflow_active, 0);
        assert_eq!(stats.queued, 0);
        assert_eq!(stats.busy, 1);

        drop(fixed);
        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn overflow_worker_retired_when_waiter_times_out() {
        let (manager, _join) = launch(config(1, 1), EventSink::new()).await.unwrap();
        let op = Duration::from_secs(1);
        let fixed = manager.checkout(Duration::from_millis(200), op).await.unwrap();
        let overflow = manager.checkout(Duration::from_secs(5), op).await.unwrap();

        let err = manager
            .checkout(Duration::from_millis(50), op)
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind(), procpool_core::ErrorKind::CheckoutTimeout);

        overflow.checkin(CheckinOutcome::Success);
        assert_eq!(manager.stats().await.unwrap().overflow_active, 0);

        drop(fixed);
        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn crash_command_fails_the_task() {
        let (manager, join) = launch(config(1, 0), EventSink::new()).await.unwrap();
        manager.crash().unwrap();
        assert!(join.await.unwrap().is_err());
        assert!(manager.stats().await.is_err());
    }
}
