//! The public pool API.
//!
//! [`ProcessPool`] ties the pieces together: a supervised manager actor, its
//! health monitor, the session tracker and its sweeper, and the event sink.
//! [`WorkerPool`] is the trait the service layer programs against, so it can
//! be tested with [`mock::MockPool`].

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use procpool_core::{PoolError, Result, SessionId};
use serde_json::{Map, Value};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::config::PoolConfig;
use crate::events::{millis, EventSink, PoolEvent};
use crate::handle::WorkerHandle;
use crate::health::HealthMonitor;
use crate::manager::{self, ManagerHandle};
use crate::session::{SessionStats, SessionTracker};
use crate::supervisor::supervise;
use crate::types::{CheckinOutcome, ExecuteOptions, PoolStats, PoolStatus, WorkerInfo};
use crate::worker::PING_COMMAND;

/// Operations offered by a worker pool.
#[async_trait]
pub trait WorkerPool: Send + Sync {
    /// Run one command on any available worker.
    ///
    /// # Errors
    ///
    /// Returns a structured [`PoolError`] for checkout timeouts, worker
    /// failures and protocol errors.
    async fn execute_anonymous(
        &self,
        command: &str,
        args: Map<String, Value>,
        options: ExecuteOptions,
    ) -> Result<Map<String, Value>>;

    /// Run one command on behalf of a session.
    ///
    /// Worker selection is the same as [`WorkerPool::execute_anonymous`]; the
    /// session only feeds bookkeeping and events.
    ///
    /// # Errors
    ///
    /// See [`WorkerPool::execute_anonymous`].
    async fn execute_in_session(
        &self,
        session_id: &SessionId,
        command: &str,
        args: Map<String, Value>,
        options: ExecuteOptions,
    ) -> Result<Map<String, Value>>;

    /// Check that a worker can be checked out and answers a ping.
    ///
    /// # Errors
    ///
    /// Returns the error that prevented the round trip.
    async fn health_check(&self, options: ExecuteOptions) -> Result<()>;

    /// Snapshot of pool occupancy.
    ///
    /// # Errors
    ///
    /// Returns `PoolUnavailable` if the manager is not running.
    async fn get_stats(&self) -> Result<PoolStats>;

    /// Per-worker diagnostics.
    ///
    /// # Errors
    ///
    /// Returns `PoolUnavailable` if the manager is not running.
    async fn worker_info(&self) -> Result<Vec<WorkerInfo>>;

    /// Active sessions.
    fn session_stats(&self) -> SessionStats;

    /// Forget a session. Returns true if it was tracked.
    fn end_session(&self, session_id: &SessionId) -> bool;

    /// Current lifecycle status.
    fn status(&self) -> PoolStatus;

    /// Stop every worker and the background tasks.
    ///
    /// # Errors
    ///
    /// Returns `PoolUnavailable` if the manager already stopped.
    async fn shutdown(&self) -> Result<()>;
}

/// State shared between the pool and its supervisor task.
struct Shared {
    config: PoolConfig,
    manager: RwLock<ManagerHandle>,
    monitor: Mutex<Option<JoinHandle<()>>>,
    events: EventSink,
    status: watch::Sender<PoolStatus>,
}

impl Shared {
    fn manager(&self) -> ManagerHandle {
        self.manager.read().clone()
    }

    fn install(&self, manager: ManagerHandle) {
        let monitor = HealthMonitor::new(
            manager.clone(),
            self.config.health_check_interval(),
            self.config.health.clone(),
        )
        .spawn();
        *self.manager.write() = manager;
        if let Some(old) = self.monitor.lock().replace(monitor) {
            old.abort();
        }
    }

    async fn restart(&self, restarts: u32, reason: String) -> Result<JoinHandle<Result<()>>> {
        self.status.send_replace(PoolStatus::Restarting);
        let (manager, join) = manager::launch(self.config.clone(), self.events.clone()).await?;
        self.install(manager);
        info!(restarts, "Pool manager restarted");
        self.events.emit(PoolEvent::PoolRestarted { restarts, reason });
        self.status.send_replace(PoolStatus::Running);
        Ok(join)
    }
}

/// A supervised pool of external worker processes.
pub struct ProcessPool {
    shared: Arc<Shared>,
    sessions: Arc<SessionTracker>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for ProcessPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessPool")
            .field("pool_size", &self.shared.config.pool_size)
            .field("status", &*self.shared.status.borrow())
            .finish_non_exhaustive()
    }
}

impl ProcessPool {
    /// Validate `config`, start `pool_size` workers and the background tasks.
    ///
    /// # Errors
    ///
    /// Returns `Config` for an invalid configuration and `WorkerInitFailed`
    /// if any worker fails its startup handshake. No worker is left running
    /// on failure.
    pub async fn start(config: PoolConfig) -> Result<Self> {
        config.validate()?;
        let events = EventSink::new();
        let (manager, join) = manager::launch(config.clone(), events.clone()).await?;

        let (status, _) = watch::channel(PoolStatus::Running);
        let shared = Arc::new(Shared {
            config,
            manager: RwLock::new(manager.clone()),
            monitor: Mutex::new(None),
            events,
            status,
        });
        shared.install(manager);

        let sessions = Arc::new(SessionTracker::new());
        let sweeper = sessions.spawn_sweeper(shared.config.sessions);
        let supervisor = tokio::spawn(run_supervisor(Arc::clone(&shared), join));

        info!(
            pool_size = shared.config.pool_size,
            overflow = shared.config.overflow,
            program = %shared.config.worker.program,
            "Process pool started"
        );
        Ok(Self {
            shared,
            sessions,
            tasks: Mutex::new(vec![supervisor, sweeper]),
        })
    }

    /// The configuration the pool was started with.
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Take exclusive use of one worker.
    ///
    /// The handle checks itself in when dropped.
    ///
    /// # Errors
    ///
    /// Returns `CheckoutTimeout` if no worker frees up in time and
    /// `PoolUnavailable` if the manager is not running.
    pub async fn checkout(&self, options: &ExecuteOptions) -> Result<WorkerHandle> {
        let config = &self.shared.config;
        let checkout_timeout = options
            .checkout_timeout
            .unwrap_or_else(|| config.checkout_timeout());
        let operation_timeout = options
            .operation_timeout
            .unwrap_or_else(|| config.operation_timeout());
        self.shared
            .manager()
            .checkout(checkout_timeout, operation_timeout)
            .await
    }

    async fn execute(
        &self,
        session_id: Option<&SessionId>,
        command: &str,
        args: Map<String, Value>,
        options: ExecuteOptions,
    ) -> Result<Map<String, Value>> {
        let started = Instant::now();
        if let Some(id) = session_id {
            self.sessions.touch(id);
        }

        let result = match self.checkout(&options).await {
            Ok(mut handle) => {
                let result = handle.call(command, args).await;
                handle.checkin(CheckinOutcome::for_result(&result));
                result
            }
            Err(e) => Err(e),
        };

        let duration_ms = millis(started.elapsed());
        match &result {
            Ok(_) => debug!(session_id = ?session_id, command, duration_ms, "Operation completed"),
            Err(e) => debug!(
                session_id = ?session_id,
                command,
                duration_ms,
                error = %e,
                "Operation failed"
            ),
        }
        self.shared.events.emit(PoolEvent::OperationCompleted {
            session_id: session_id.cloned(),
            command: command.to_string(),
            duration_ms,
            error: result.as_ref().err().map(PoolError::kind),
        });
        result
    }

    /// Subscribe to pool events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.shared.events.subscribe()
    }

    /// The session tracker.
    #[must_use]
    pub fn sessions(&self) -> &SessionTracker {
        &self.sessions
    }

    /// Wait until the pool stops for good and return its final status.
    pub async fn terminated(&self) -> PoolStatus {
        let mut rx = self.shared.status.subscribe();
        let result = rx.wait_for(PoolStatus::is_final).await.map(|s| (*s).clone());
        result.unwrap_or(PoolStatus::Stopped)
    }

    #[cfg(test)]
    fn crash_manager(&self) -> Result<()> {
        self.shared.manager().crash()
    }
}

async fn run_supervisor(shared: Arc<Shared>, join: JoinHandle<Result<()>>) {
    let restart_shared = Arc::clone(&shared);
    let result = supervise(shared.config.supervision, join, move |restarts, reason| {
        let shared = Arc::clone(&restart_shared);
        async move { shared.restart(restarts, reason).await }
    })
    .await;

    if let Some(monitor) = shared.monitor.lock().take() {
        monitor.abort();
    }
    match result {
        Ok(()) => {
            shared.status.send_replace(PoolStatus::Stopped);
        }
        Err(e) => {
            error!(error = %e, "Process pool failed");
            let status = match e {
                PoolError::SupervisorCrash { restarts, reason } => {
                    PoolStatus::Failed { restarts, reason }
                }
                other => PoolStatus::Failed {
                    restarts: 0,
                    reason: other.to_string(),
                },
            };
            shared.status.send_replace(status);
        }
    }
}

#[async_trait]
impl WorkerPool for ProcessPool {
    async fn execute_anonymous(
        &self,
        command: &str,
        args: Map<String, Value>,
        options: ExecuteOptions,
    ) -> Result<Map<String, Value>> {
        self.execute(None, command, args, options).await
    }

    async fn execute_in_session(
        &self,
        session_id: &SessionId,
        command: &str,
        args: Map<String, Value>,
        options: ExecuteOptions,
    ) -> Result<Map<String, Value>> {
        self.execute(Some(session_id), command, args, options).await
    }

    async fn health_check(&self, options: ExecuteOptions) -> Result<()> {
        let status = self.status();
        if status != PoolStatus::Running {
            return Err(PoolError::unavailable(format!("pool is {}", status_name(&status))));
        }
        let probe_timeout = options
            .operation_timeout
            .unwrap_or_else(|| self.shared.config.health.probe_timeout());
        let mut handle = self.checkout(&options).await?;
        let result = handle
            .call_with_timeout(PING_COMMAND, Map::new(), probe_timeout)
            .await;
        handle.checkin(CheckinOutcome::for_result(&result));
        result.map(|_| ())
    }

    async fn get_stats(&self) -> Result<PoolStats> {
        let mut stats = self.shared.manager().stats().await?;
        stats.sessions_active = self.sessions.len();
        Ok(stats)
    }

    async fn worker_info(&self) -> Result<Vec<WorkerInfo>> {
        self.shared.manager().workers().await
    }

    fn session_stats(&self) -> SessionStats {
        self.sessions.stats()
    }

    fn end_session(&self, session_id: &SessionId) -> bool {
        self.sessions.remove(session_id)
    }

    fn status(&self) -> PoolStatus {
        self.shared.status.borrow().clone()
    }

    async fn shutdown(&self) -> Result<()> {
        info!("Shutting down process pool");
        // Stop supervising first so the manager's exit is not seen as a crash.
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in &tasks {
            task.abort();
        }
        let monitor = self.shared.monitor.lock().take();
        if let Some(monitor) = monitor {
            monitor.abort();
        }

        let result = self.shared.manager().shutdown().await;
        self.shared.status.send_replace(PoolStatus::Stopped);
        result
    }
}

impl Drop for ProcessPool {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        if let Some(monitor) = self.shared.monitor.lock().take() {
            monitor.abort();
        }
        // The manager keeps itself alive until told to stop.
        self.shared.manager().request_shutdown();
    }
}

const fn status_name(status: &PoolStatus) -> &'static str {
    match status {
        PoolStatus::Running => "running",
        PoolStatus::Restarting => "restarting",
        PoolStatus::Stopped => "stopped",
        PoolStatus::Failed { .. } => "failed",
    }
}

/// An in-memory pool for testing code that depends on [`WorkerPool`].
#[cfg(any(test, feature = "test-utils"))]
pub mod mock {
    use super::*;
    use std::collections::HashMap;

    /// One recorded call.
    #[derive(Debug, Clone, PartialEq)]
    pub struct MockCall {
        /// Session the call belonged to.
        pub session_id: Option<SessionId>,
        /// Command name.
        pub command: String,
        /// Arguments as sent.
        pub args: Map<String, Value>,
    }

    /// A pool that echoes arguments back without spawning processes.
    #[derive(Default)]
    pub struct MockPool {
        stats: Mutex<PoolStats>,
        failures: Mutex<HashMap<String, String>>,
        unavailable: Mutex<bool>,
        calls: Mutex<Vec<MockCall>>,
        workers: Mutex<Vec<WorkerInfo>>,
        sessions: SessionTracker,
    }

    impl MockPool {
        /// Create a mock with empty stats.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Set the stats returned by `get_stats`.
        pub fn set_stats(&self, stats: PoolStats) {
            *self.stats.lock() = stats;
        }

        /// Set the workers returned by `worker_info`.
        pub fn set_workers(&self, workers: Vec<WorkerInfo>) {
            *self.workers.lock() = workers;
        }

        /// Make `command` fail with `CommandFailed`.
        pub fn fail_command(&self, command: &str, message: &str) {
            self.failures
                .lock()
                .insert(command.to_string(), message.to_string());
        }

        /// Make every call fail with `PoolUnavailable`.
        pub fn set_unavailable(&self, unavailable: bool) {
            *self.unavailable.lock() = unavailable;
        }

        /// Calls received so far.
        #[must_use]
        pub fn calls(&self) -> Vec<MockCall> {
            self.calls.lock().clone()
        }

        fn run(
            &self,
            session_id: Option<&SessionId>,
            command: &str,
            args: Map<String, Value>,
        ) -> Result<Map<String, Value>> {
            if *self.unavailable.lock() {
                return Err(PoolError::unavailable("mock pool unavailable"));
            }
            if let Some(id) = session_id {
                self.sessions.touch(id);
            }
            self.calls.lock().push(MockCall {
                session_id: session_id.cloned(),
                command: command.to_string(),
                args: args.clone(),
            });
            if let Some(message) = self.failures.lock().get(command) {
                return Err(PoolError::CommandFailed {
                    worker_id: procpool_core::WorkerId::generate(),
                    command: command.to_string(),
                    message: message.clone(),
                });
            }
            Ok(args)
        }
    }

    #[async_trait]
    impl WorkerPool for MockPool {
        async fn execute_anonymous(
            &self,
            command: &str,
            args: Map<String, Value>,
            _options: ExecuteOptions,
        ) -> Result<Map<String, Value>> {
            self.run(None, command, args)
        }

        async fn execute_in_session(
            &self,
            session_id: &SessionId,
            command: &str,
            args: Map<String, Value>,
            _options: ExecuteOptions,
        ) -> Result<Map<String, Value>> {
            self.run(Some(session_id), command, args)
        }

        async fn health_check(&self, _options: ExecuteOptions) -> Result<()> {
            if *self.unavailable.lock() {
                return Err(PoolError::unavailable("mock pool unavailable"));
            }
            Ok(())
        }

        async fn get_stats(&self) -> Result<PoolStats> {
            if *self.unavailable.lock() {
                return Err(PoolError::unavailable("mock pool unavailable"));
            }
            let mut stats = *self.stats.lock();
            stats.sessions_active = self.sessions.len();
            Ok(stats)
        }

        async fn worker_info(&self) -> Result<Vec<WorkerInfo>> {
            Ok(self.workers.lock().clone())
        }

        fn session_stats(&self) -> SessionStats {
            self.sessions.stats()
        }

        fn end_session(&self, session_id: &SessionId) -> bool {
            self.sessions.remove(session_id)
        }

        fn status(&self) -> PoolStatus {
            if *self.unavailable.lock() {
                PoolStatus::Stopped
            } else {
                PoolStatus::Running
            }
        }

        async fn shutdown(&self) -> Result<()> {
            self.set_unavailable(true);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockPool;
    use super::*;
    use crate::worker::tests::sed_spec;
    use procpool_core::{ErrorCategory, ErrorKind};
    use std::collections::HashSet;
    use std::time::Duration;

    fn config(pool_size: usize) -> PoolConfig {
        let mut config = PoolConfig::new(sed_spec());
        config.pool_size = pool_size;
        config.overflow = 0;
        config
    }

    fn sid(s: &str) -> SessionId {
        SessionId::new(s).unwrap()
    }

    #[tokio::test]
    async fn start_rejects_invalid_config() {
        let err = ProcessPool::start(config(0)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidConfig);
    }

    #[tokio::test]
    async fn stats_after_start() {
        let pool = ProcessPool::start(config(2)).await.unwrap();
        let stats = pool.get_stats().await.unwrap();
        assert_eq!(stats.pool_size, 2);
        assert_eq!(stats.available, 2);
        assert_eq!(stats.busy, 0);
        assert_eq!(stats.queued, 0);
        assert_eq!(pool.status(), PoolStatus::Running);
        pool.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn execute_anonymous_returns_result() {
        let pool = ProcessPool::start(config(1)).await.unwrap();
        let result = pool
            .execute_anonymous("echo", Map::new(), ExecuteOptions::default())
            .await
            .unwrap();
        assert!(result.is_empty());
        pool.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn sessions_are_tracked_but_not_routed() {
        let pool = ProcessPool::start(config(1)).await.unwrap();
        let mut events = pool.subscribe();
        for _ in 0..2 {
            pool.execute_in_session(&sid("s1"), "echo", Map::new(), ExecuteOptions::default())
                .await
                .unwrap();
        }

        let stats = pool.session_stats();
        assert_eq!(stats.active, 1);
        assert_eq!(stats.sessions[0].operation_count, 2);
        assert_eq!(pool.get_stats().await.unwrap().sessions_active, 1);

        let mut completed = 0;
        while let Ok(event) = events.try_recv() {
            if let PoolEvent::OperationCompleted { session_id, error, .. } = event {
                assert_eq!(session_id, Some(sid("s1")));
                assert!(error.is_none());
                completed += 1;
            }
        }
        assert_eq!(completed, 2);

        assert!(pool.end_session(&sid("s1")));
        assert_eq!(pool.session_stats().active, 0);
        pool.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn exhausted_pool_times_out_checkout() {
        let pool = ProcessPool::start(config(1)).await.unwrap();
        let _held = pool.checkout(&ExecuteOptions::default()).await.unwrap();

        let options = ExecuteOptions::default().with_checkout_timeout(Duration::from_millis(100));
        let started = Instant::now();
        let err = pool
            .execute_anonymous("echo", Map::new(), options)
            .await
            .unwrap_err();
        let waited = started.elapsed();

        assert_eq!(err.category(), ErrorCategory::TimeoutError);
        assert_eq!(err.kind(), ErrorKind::CheckoutTimeout);
        assert!(waited >= Duration::from_millis(90), "returned too early: {waited:?}");
        assert!(waited < Duration::from_secs(1), "returned too late: {waited:?}");
    }

    #[tokio::test]
    async fn health_check_round_trips() {
        let pool = ProcessPool::start(config(1)).await.unwrap();
        pool.health_check(ExecuteOptions::default()).await.unwrap();
        pool.shutdown().await.unwrap();
        assert!(pool.health_check(ExecuteOptions::default()).await.is_err());
    }

    #[tokio::test]
    async fn shutdown_reaches_final_status() {
        let pool = ProcessPool::start(config(1)).await.unwrap();
        pool.shutdown().await.unwrap();
        assert_eq!(pool.terminated().await, PoolStatus::Stopped);
        let err = pool.get_stats().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PoolUnavailable);
    }

    #[tokio::test]
    async fn manager_crash_restarts_with_fresh_workers() {
        let pool = ProcessPool::start(config(2)).await.unwrap();
        let mut events = pool.subscribe();
        let before: HashSet<_> = pool
            .worker_info()
            .await
            .unwrap()
            .into_iter()
            .map(|w| w.id)
            .collect();

        pool.crash_manager().unwrap();
        let restarted = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                if let Ok(PoolEvent::PoolRestarted { restarts, .. }) = events.recv().await {
                    return restarts;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(restarted, 1);
        assert_eq!(pool.status(), PoolStatus::Running);

        let after: HashSet<_> = pool
            .worker_info()
            .await
            .unwrap()
            .into_iter()
            .map(|w| w.id)
            .collect();
        assert_eq!(after.len(), 2);
        assert!(before.is_disjoint(&after));
        pool.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn mock_pool_echoes_and_fails_on_demand() {
        let pool = MockPool::new();
        let mut args = Map::new();
        args.insert("x".to_string(), Value::from(1));

        let result = pool
            .execute_in_session(&sid("s1"), "echo", args.clone(), ExecuteOptions::default())
            .await
            .unwrap();
        assert_eq!(result, args);

        pool.fail_command("explode", "kaboom");
        let err = pool
            .execute_anonymous("explode", Map::new(), ExecuteOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CommandFailed);

        assert_eq!(pool.calls().len(), 2);
        assert_eq!(pool.get_stats().await.unwrap().sessions_active, 1);

        pool.shutdown().await.unwrap();
        assert!(pool.health_check(ExecuteOptions::default()).await.is_err());
    }
}
