//! Server application state.
//!
//! This module defines the shared state that is available to all request handlers.

use std::sync::Arc;

use procpool_manager::WorkerPool;

use crate::config::ServerConfig;

/// Shared application state.
pub struct AppState<P>
where
    P: WorkerPool,
{
    /// The worker pool behind every endpoint.
    pub pool: Arc<P>,
    /// Server configuration.
    pub config: ServerConfig,
}

impl<P> AppState<P>
where
    P: WorkerPool,
{
    /// Create a new application state.
    #[must_use]
    pub fn new(pool: Arc<P>, config: ServerConfig) -> Self {
        Self { pool, config }
    }
}

impl<P> Clone for AppState<P>
where
    P: WorkerPool,
{
    fn clone(&self) -> Self {
        Self {
            pool: Arc::clone(&self.pool),
            config: self.config.clone(),
        }
    }
}
