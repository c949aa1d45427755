//! Periodic worker probes.
//!
//! Every `health_check_interval` the monitor borrows the channel of each idle
//! worker from the manager, sends the probe command, and reports the result
//! back. The manager applies the thresholds, so the monitor itself holds no
//! per-worker state.

use std::time::Duration;

use serde_json::Map;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace};

use crate::config::HealthConfig;
use crate::manager::{ManagerHandle, ProbeLease};

/// Probe loop bound to one manager instance.
#[derive(Debug)]
pub(crate) struct HealthMonitor {
    manager: ManagerHandle,
    interval: Duration,
    config: HealthConfig,
}

impl HealthMonitor {
    pub(crate) const fn new(
        manager: ManagerHandle,
        interval: Duration,
        config: HealthConfig,
    ) -> Self {
        Self {
            manager,
            interval,
            config,
        }
    }

    /// Run until the manager goes away.
    pub(crate) fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(self) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Workers were just handshaken; skip the immediate first tick.
        interval.tick().await;

        loop {
            interval.tick().await;
            if !self.sweep().await {
                debug!("Health monitor stopping; pool manager is gone");
                return;
            }
        }
    }

    /// Probe every eligible worker once. Returns false if the manager is gone.
    async fn sweep(&self) -> bool {
        let leases = match self.manager.probe_targets().await {
            Ok(leases) => leases,
            Err(_) => return false,
        };
        if leases.is_empty() {
            return !self.manager.is_closed();
        }

        trace!(workers = leases.len(), "Probing workers");
        let probes = leases.into_iter().map(|lease| self.probe(lease));
        let results = futures::future::join_all(probes).await;

        for (lease, healthy) in results {
            if self
                .manager
                .probe_result(lease.worker_id, Some(lease.channel), healthy)
                .is_err()
            {
                return false;
            }
        }
        true
    }

    async fn probe(&self, mut lease: ProbeLease) -> (ProbeLease, bool) {
        let result = lease
            .channel
            .call(&self.config.probe_command, Map::new(), self.config.probe_timeout())
            .await;
        let healthy = match result {
            Ok(response) if response.success => true,
            Ok(response) => {
                debug!(
                    worker_id = %lease.worker_id,
                    error = response.error.as_deref().unwrap_or(""),
                    "Health probe rejected"
                );
                false
            }
            Err(e) => {
                debug!(worker_id = %lease.worker_id, error = %e, "Health probe failed");
                false
            }
        };
        (lease, healthy)
    }
}
