//! Supervised pool of external worker processes.
//!
//! This crate provides [`ProcessPool`], which keeps a fixed number of worker
//! processes alive and hands out exclusive access to them. It handles:
//!
//! - Spawning workers and verifying them with a `ping` handshake
//! - Checkout with a FIFO wait queue and temporary overflow workers
//! - Replacing crashed, timed-out and unhealthy workers
//! - Restarting the pool manager itself within a bounded restart budget
//! - Observational session bookkeeping and structured events
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         ProcessPool                              │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────────────┐  │
//! │  │ Supervisor  │  │   Health    │  │    SessionTracker       │  │
//! │  │ (restarts)  │  │   Monitor   │  │    + sweeper            │  │
//! │  └──────┬──────┘  └──────┬──────┘  └─────────────────────────┘  │
//! │         ▼                ▼                                      │
//! │  ┌───────────────────────────────────┐                          │
//! │  │  Manager actor (workers + queue)  │── checkout ──▶ handle   │
//! │  └───────────────────────────────────┘                │         │
//! └───────────────────────────────────────────────────────┼─────────┘
//!                                                         │ framed JSON
//!                                                         ▼ over stdio
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Worker processes                             │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use procpool_manager::{ExecuteOptions, PoolConfig, ProcessPool, WorkerPool, WorkerSpec};
//! use serde_json::Map;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut config = PoolConfig::new(WorkerSpec::new("python3").with_args(["worker.py"]));
//! config.pool_size = 4;
//!
//! let pool = ProcessPool::start(config).await?;
//! let result = pool
//!     .execute_anonymous("predict", Map::new(), ExecuteOptions::default())
//!     .await?;
//! println!("{result:?}");
//!
//! let stats = pool.get_stats().await?;
//! println!("available: {}, busy: {}", stats.available, stats.busy);
//!
//! pool.shutdown().await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Testing
//!
//! For code that only needs the [`WorkerPool`] trait, enable the `test-utils`
//! feature and use the in-memory mock:
//!
//! ```ignore
//! use procpool_manager::{ExecuteOptions, MockPool, WorkerPool};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let pool = MockPool::new();
//! pool.fail_command("explode", "kaboom");
//! let result = pool
//!     .execute_anonymous("explode", Default::default(), ExecuteOptions::default())
//!     .await;
//! assert!(result.is_err());
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod events;
pub mod handle;
mod health;
mod manager;
pub mod pool;
pub mod session;
pub mod supervisor;
pub mod types;
pub mod worker;

pub use config::{
    BackoffConfig, ConfigError, HealthConfig, PoolConfig, RestartPolicy, SessionConfig, WorkerSpec,
};
pub use events::{EventSink, PoolEvent};
pub use handle::WorkerHandle;
pub use pool::{ProcessPool, WorkerPool};
pub use session::{Session, SessionStats, SessionTracker};
pub use types::{
    CheckinOutcome, ExecuteOptions, PoolStats, PoolStatus, WorkerInfo, WorkerKind, WorkerStats,
};
pub use worker::WorkerChannel;

#[cfg(any(test, feature = "test-utils"))]
pub use pool::mock::{MockCall, MockPool};
