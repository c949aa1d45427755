//! Pool-level supervision.
//!
//! Individual worker crashes are routine and handled inside the manager. This
//! module restarts the manager itself when its task fails, within a bounded
//! restart intensity: more than `max_restarts` restarts inside `max_seconds`
//! is fatal and surfaces as `supervisor_crash`.

use std::collections::VecDeque;
use std::future::Future;
use std::time::{Duration, Instant};

use procpool_core::{PoolError, Result};
use tokio::task::{JoinError, JoinHandle};
use tracing::{error, info, warn};

use crate::config::RestartPolicy;

/// Sliding-window restart counter.
#[derive(Debug, Clone)]
pub struct RestartIntensity {
    max_restarts: u32,
    window: Duration,
    restarts: VecDeque<Instant>,
}

impl RestartIntensity {
    /// Create a counter for `policy`.
    #[must_use]
    pub fn new(policy: RestartPolicy) -> Self {
        Self {
            max_restarts: policy.max_restarts,
            window: policy.window(),
            restarts: VecDeque::new(),
        }
    }

    /// Record a restart at `now`.
    ///
    /// Returns the number of restarts inside the window, or `None` if the
    /// budget is exhausted.
    pub fn record(&mut self, now: Instant) -> Option<u32> {
        while let Some(&oldest) = self.restarts.front() {
            if now.saturating_duration_since(oldest) > self.window {
                self.restarts.pop_front();
            } else {
                break;
            }
        }
        self.restarts.push_back(now);
        let count = u32::try_from(self.restarts.len()).unwrap_or(u32::MAX);
        (count <= self.max_restarts).then_some(count)
    }

    /// Restarts currently inside the window.
    #[must_use]
    pub fn recent(&self) -> usize {
        self.restarts.len()
    }
}

/// Why a supervised task stopped. `None` means it stopped on purpose.
fn exit_reason(result: std::result::Result<Result<()>, JoinError>) -> Option<String> {
    match result {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(e.to_string()),
        Err(e) if e.is_cancelled() => None,
        Err(e) => Some(format!("task panicked: {e}")),
    }
}

/// Watch `child`, calling `restart` each time it fails.
///
/// `restart` receives the restart count and the failure reason, and returns
/// the next incarnation's join handle. A failed restart counts against the
/// budget like any other failure.
///
/// # Errors
///
/// Returns `SupervisorCrash` once the restart budget is exhausted.
pub(crate) async fn supervise<F, Fut>(
    policy: RestartPolicy,
    mut child: JoinHandle<Result<()>>,
    mut restart: F,
) -> Result<()>
where
    F: FnMut(u32, String) -> Fut,
    Fut: Future<Output = Result<JoinHandle<Result<()>>>>,
{
    let mut intensity = RestartIntensity::new(policy);

    loop {
        let Some(mut reason) = exit_reason((&mut child).await) else {
            info!("Supervised pool manager stopped");
            return Ok(());
        };

        loop {
            let Some(restarts) = intensity.record(Instant::now()) else {
                let restarts = u32::try_from(intensity.recent()).unwrap_or(u32::MAX);
                error!(restarts, reason = %reason, "Restart budget exhausted");
                return Err(PoolError::SupervisorCrash { restarts, reason });
            };

            warn!(restarts, reason = %reason, "Restarting pool manager");
            match restart(restarts, reason.clone()).await {
                Ok(next) => {
                    child = next;
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "Pool manager restart failed");
                    reason = e.to_string();
                }
            }
        }
    }
}
