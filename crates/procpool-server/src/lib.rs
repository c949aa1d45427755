//! HTTP service for a procpool worker pool.
//!
//! This crate exposes a [`WorkerPool`](procpool_manager::WorkerPool) over HTTP:
//!
//! - Liveness and readiness probes
//! - Command execution with optional session attribution
//! - Pool, worker and session diagnostics
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use procpool_manager::{PoolConfig, ProcessPool};
//! use procpool_server::{create_router, AppState, ServerConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let pool = Arc::new(ProcessPool::start(PoolConfig::from_env()).await?);
//! let config = ServerConfig::default();
//! let listen_addr = config.listen_addr.clone();
//!
//! let app = create_router(AppState::new(pool, config));
//! let listener = tokio::net::TcpListener::bind(listen_addr).await?;
//! axum::serve(listener, app).await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod error;
pub mod handlers;
pub mod routes;
pub mod state;

pub use config::ServerConfig;
pub use error::ApiError;
pub use routes::create_router;
pub use state::AppState;
