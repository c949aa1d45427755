//! Pool configuration.
//!
//! All durations are stored as integer milliseconds so the configuration can
//! be deserialized from plain JSON or environment variables. Accessors return
//! [`Duration`] values.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use procpool_core::protocol::{Framing, DEFAULT_MAX_MESSAGE_SIZE};
use procpool_core::PoolError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised by [`PoolConfig::validate`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// `pool_size` was zero.
    #[error("pool_size must be at least 1")]
    EmptyPool,

    /// No worker program was configured.
    #[error("worker program must not be empty")]
    MissingProgram,

    /// A timeout or interval was zero.
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),

    /// The frame size limit was zero.
    #[error("max_message_size must be greater than zero")]
    ZeroMessageSize,

    /// A threshold was zero or inconsistent.
    #[error("invalid threshold: {0}")]
    Threshold(String),
}

impl From<ConfigError> for PoolError {
    fn from(err: ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

/// How to launch one worker process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSpec {
    /// Executable to run.
    pub program: String,
    /// Arguments passed before the worker id flag.
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment variables.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Working directory; inherits the pool's when unset.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// Frame delimiting on stdin/stdout.
    #[serde(default)]
    pub framing: Framing,
    /// Maximum frame payload in bytes.
    #[serde(default = "WorkerSpec::default_max_message_size")]
    pub max_message_size: usize,
    /// Deadline for the startup ping.
    #[serde(default = "WorkerSpec::default_startup_timeout_ms")]
    pub startup_timeout_ms: u64,
    /// How long a retiring worker may take to exit before it is killed.
    #[serde(default = "WorkerSpec::default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
    /// Flag used to pass the worker id on the command line. `None` disables it.
    #[serde(default = "WorkerSpec::default_worker_id_arg")]
    pub worker_id_arg: Option<String>,
}

impl Default for WorkerSpec {
    fn default() -> Self {
        Self {
            program: String::new(),
            args: Vec::new(),
            env: HashMap::new(),
            working_dir: None,
            framing: Framing::default(),
            max_message_size: Self::default_max_message_size(),
            startup_timeout_ms: Self::default_startup_timeout_ms(),
            shutdown_grace_ms: Self::default_shutdown_grace_ms(),
            worker_id_arg: Self::default_worker_id_arg(),
        }
    }
}

impl WorkerSpec {
    const fn default_max_message_size() -> usize {
        DEFAULT_MAX_MESSAGE_SIZE
    }

    const fn default_startup_timeout_ms() -> u64 {
        10_000
    }

    const fn default_shutdown_grace_ms() -> u64 {
        2_000
    }

    #[allow(clippy::unnecessary_wraps)]
    fn default_worker_id_arg() -> Option<String> {
        Some("--worker-id".to_string())
    }

    /// Create a spec for the given program with default settings.
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    /// Append arguments.
    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Startup handshake deadline.
    #[must_use]
    pub const fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    /// Grace period for a retiring worker.
    #[must_use]
    pub const fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// Probe settings beyond the interval and threshold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Consecutive probe failures after which the worker is replaced.
    #[serde(default = "HealthConfig::default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
    /// Deadline for a single probe.
    #[serde(default = "HealthConfig::default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    /// Quiet period after a worker becomes ready before it is probed.
    #[serde(default = "HealthConfig::default_recovery_delay_ms")]
    pub recovery_delay_ms: u64,
    /// Command sent as the probe.
    #[serde(default = "HealthConfig::default_probe_command")]
    pub probe_command: String,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            max_consecutive_failures: Self::default_max_consecutive_failures(),
            probe_timeout_ms: Self::default_probe_timeout_ms(),
            recovery_delay_ms: Self::default_recovery_delay_ms(),
            probe_command: Self::default_probe_command(),
        }
    }
}

impl HealthConfig {
    const fn default_max_consecutive_failures() -> u32 {
        5
    }

    const fn default_probe_timeout_ms() -> u64 {
        5_000
    }

    const fn default_recovery_delay_ms() -> u64 {
        1_000
    }

    fn default_probe_command() -> String {
        "ping".to_string()
    }

    /// Deadline for a single probe.
    #[must_use]
    pub const fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    /// Quiet period before a fresh worker is probed.
    #[must_use]
    pub const fn recovery_delay(&self) -> Duration {
        Duration::from_millis(self.recovery_delay_ms)
    }
}

/// Bounded restart policy for the pool manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestartPolicy {
    /// Restarts allowed inside the window.
    pub max_restarts: u32,
    /// Sliding window length in seconds.
    pub max_seconds: u64,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_restarts: 5,
            max_seconds: 60,
        }
    }
}

impl RestartPolicy {
    /// Sliding window length.
    #[must_use]
    pub const fn window(&self) -> Duration {
        Duration::from_secs(self.max_seconds)
    }
}

/// Exponential backoff between failed worker spawns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// First delay after a failed spawn.
    pub initial_ms: u64,
    /// Upper bound on the delay.
    pub max_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_ms: 250,
            max_ms: 10_000,
        }
    }
}

impl BackoffConfig {
    /// Delay after `failures` consecutive failed spawns (`failures >= 1`).
    #[must_use]
    pub fn delay(&self, failures: u32) -> Duration {
        let shift = failures.saturating_sub(1).min(16);
        let ms = self.initial_ms.saturating_mul(1u64 << shift).min(self.max_ms);
        Duration::from_millis(ms)
    }
}

/// Session tracker settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Inactivity after which a session is evicted (seconds).
    pub ttl_seconds: u64,
    /// Interval between sweeps (seconds).
    pub cleanup_interval_seconds: u64,
    /// Maximum evictions per sweep.
    pub max_sessions_per_cleanup: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: 1800,             // 30 minutes
            cleanup_interval_seconds: 300, // 5 minutes
            max_sessions_per_cleanup: 1000,
        }
    }
}

impl SessionConfig {
    /// Inactivity TTL.
    #[must_use]
    pub const fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }

    /// Sweep interval.
    #[must_use]
    pub const fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_seconds)
    }
}

/// Configuration for a [`ProcessPool`](crate::ProcessPool).
///
/// Immutable once the pool has started.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Number of fixed workers kept alive.
    #[serde(default = "PoolConfig::default_pool_size")]
    pub pool_size: usize,
    /// Extra temporary workers allowed under load.
    #[serde(default = "PoolConfig::default_overflow")]
    pub overflow: usize,
    /// Default bound on waiting for a worker.
    #[serde(default = "PoolConfig::default_checkout_timeout_ms")]
    pub checkout_timeout_ms: u64,
    /// Default bound on a single request to a worker.
    #[serde(default = "PoolConfig::default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,
    /// Interval between health probes.
    #[serde(default = "PoolConfig::default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,
    /// Consecutive probe failures before a worker is marked degraded.
    #[serde(default = "PoolConfig::default_failure_threshold")]
    pub failure_threshold: u32,
    /// How to launch workers.
    #[serde(default)]
    pub worker: WorkerSpec,
    /// Probe settings.
    #[serde(default)]
    pub health: HealthConfig,
    /// Pool manager restart budget.
    #[serde(default)]
    pub supervision: RestartPolicy,
    /// Backoff between failed replacement spawns.
    #[serde(default)]
    pub respawn_backoff: BackoffConfig,
    /// Session tracker settings.
    #[serde(default)]
    pub sessions: SessionConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            pool_size: Self::default_pool_size(),
            overflow: Self::default_overflow(),
            checkout_timeout_ms: Self::default_checkout_timeout_ms(),
            operation_timeout_ms: Self::default_operation_timeout_ms(),
            health_check_interval_ms: Self::default_health_check_interval_ms(),
            failure_threshold: Self::default_failure_threshold(),
            worker: WorkerSpec::default(),
            health: HealthConfig::default(),
            supervision: RestartPolicy::default(),
            respawn_backoff: BackoffConfig::default(),
            sessions: SessionConfig::default(),
        }
    }
}

impl PoolConfig {
    fn default_pool_size() -> usize {
        num_cpus::get().max(1)
    }

    const fn default_overflow() -> usize {
        2
    }

    const fn default_checkout_timeout_ms() -> u64 {
        5_000
    }

    const fn default_operation_timeout_ms() -> u64 {
        30_000
    }

    const fn default_health_check_interval_ms() -> u64 {
        30_000
    }

    const fn default_failure_threshold() -> u32 {
        3
    }

    /// Create a config for `worker` with default pool settings.
    #[must_use]
    pub fn new(worker: WorkerSpec) -> Self {
        Self {
            worker,
            ..Default::default()
        }
    }

    /// Load configuration from environment variables.
    ///
    /// Supported environment variables:
    /// - `PROCPOOL_WORKER_PROGRAM`: worker executable
    /// - `PROCPOOL_WORKER_ARGS`: whitespace-separated worker arguments
    /// - `PROCPOOL_POOL_SIZE`: fixed worker count
    /// - `PROCPOOL_OVERFLOW`: extra workers under load
    /// - `PROCPOOL_CHECKOUT_TIMEOUT_MS`: default checkout timeout
    /// - `PROCPOOL_OPERATION_TIMEOUT_MS`: default operation timeout
    /// - `PROCPOOL_HEALTH_CHECK_INTERVAL_MS`: probe interval
    /// - `PROCPOOL_FAILURE_THRESHOLD`: probe failures before degrading
    /// - `PROCPOOL_FRAMING`: "newline" or "length_prefixed"
    /// - `PROCPOOL_MAX_MESSAGE_BYTES`: frame size limit
    ///
    /// Unparsable values are ignored and the default is kept.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("PROCPOOL_WORKER_PROGRAM") {
            config.worker.program = val;
        }
        if let Ok(val) = std::env::var("PROCPOOL_WORKER_ARGS") {
            config.worker.args = val.split_whitespace().map(str::to_string).collect();
        }
        if let Ok(val) = std::env::var("PROCPOOL_POOL_SIZE") {
            if let Ok(n) = val.parse() {
                config.pool_size = n;
            }
        }
        if let Ok(val) = std::env::var("PROCPOOL_OVERFLOW") {
            if let Ok(n) = val.parse() {
                config.overflow = n;
            }
        }
        if let Ok(val) = std::env::var("PROCPOOL_CHECKOUT_TIMEOUT_MS") {
            if let Ok(n) = val.parse() {
                config.checkout_timeout_ms = n;
            }
        }
        if let Ok(val) = std::env::var("PROCPOOL_OPERATION_TIMEOUT_MS") {
            if let Ok(n) = val.parse() {
                config.operation_timeout_ms = n;
            }
        }
        if let Ok(val) = std::env::var("PROCPOOL_HEALTH_CHECK_INTERVAL_MS") {
            if let Ok(n) = val.parse() {
                config.health_check_interval_ms = n;
            }
        }
        if let Ok(val) = std::env::var("PROCPOOL_FAILURE_THRESHOLD") {
            if let Ok(n) = val.parse() {
                config.failure_threshold = n;
            }
        }
        if let Ok(val) = std::env::var("PROCPOOL_FRAMING") {
            if let Ok(framing) = val.parse() {
                config.worker.framing = framing;
            }
        }
        if let Ok(val) = std::env::var("PROCPOOL_MAX_MESSAGE_BYTES") {
            if let Ok(n) = val.parse() {
                config.worker.max_message_size = n;
            }
        }

        config
    }

    /// Check the configuration before starting a pool.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` naming the first invalid setting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool_size == 0 {
            return Err(ConfigError::EmptyPool);
        }
        if self.worker.program.trim().is_empty() {
            return Err(ConfigError::MissingProgram);
        }
        if self.worker.max_message_size == 0 {
            return Err(ConfigError::ZeroMessageSize);
        }
        let durations = [
            ("checkout_timeout_ms", self.checkout_timeout_ms),
            ("operation_timeout_ms", self.operation_timeout_ms),
            ("health_check_interval_ms", self.health_check_interval_ms),
            ("startup_timeout_ms", self.worker.startup_timeout_ms),
            ("probe_timeout_ms", self.health.probe_timeout_ms),
            ("cleanup_interval_seconds", self.sessions.cleanup_interval_seconds),
        ];
        if let Some((name, _)) = durations.iter().find(|(_, v)| *v == 0) {
            return Err(ConfigError::ZeroDuration(name));
        }
        if self.failure_threshold == 0 {
            return Err(ConfigError::Threshold(
                "failure_threshold must be at least 1".to_string(),
            ));
        }
        if self.health.max_consecutive_failures < self.failure_threshold {
            return Err(ConfigError::Threshold(format!(
                "max_consecutive_failures ({}) must not be below failure_threshold ({})",
                self.health.max_consecutive_failures, self.failure_threshold
            )));
        }
        Ok(())
    }

    /// Default checkout timeout.
    #[must_use]
    pub const fn checkout_timeout(&self) -> Duration {
        Duration::from_millis(self.checkout_timeout_ms)
    }

    /// Default operation timeout.
    #[must_use]
    pub const fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    /// Interval between health probes.
    #[must_use]
    pub const fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }
}
