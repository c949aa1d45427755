//! Exclusive checkout handle.

use std::time::Duration;

use procpool_core::{PoolError, Result, WorkerId};
use procpool_core::protocol::Response;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::debug;

use crate::manager::PoolCommand;
use crate::types::CheckinOutcome;
use crate::worker::WorkerChannel;

/// Exclusive use of one worker, returned by
/// [`ProcessPool::checkout`](crate::ProcessPool::checkout).
///
/// Requests travel directly over the worker's pipes; the pool manager is not
/// involved until the handle is checked in. Dropping the handle checks it in
/// automatically: as a success if the channel is idle, and as broken if a
/// request was interrupted mid-flight.
#[derive(Debug)]
pub struct WorkerHandle {
    worker_id: WorkerId,
    channel: Option<WorkerChannel>,
    operation_timeout: Duration,
    outcome: Option<CheckinOutcome>,
    mailbox: mpsc::UnboundedSender<PoolCommand>,
}

impl WorkerHandle {
    pub(crate) fn new(
        channel: WorkerChannel,
        operation_timeout: Duration,
        mailbox: mpsc::UnboundedSender<PoolCommand>,
    ) -> Self {
        Self {
            worker_id: channel.worker_id(),
            channel: Some(channel),
            operation_timeout,
            outcome: None,
            mailbox,
        }
    }

    /// The worker this handle is bound to.
    #[must_use]
    pub const fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    /// Default deadline applied by [`WorkerHandle::call`].
    #[must_use]
    pub const fn operation_timeout(&self) -> Duration {
        self.operation_timeout
    }

    /// Send a command and return its result map.
    ///
    /// # Errors
    ///
    /// Returns `CommandFailed` if the worker answers with `success: false`,
    /// and the channel errors of [`WorkerHandle::request`] otherwise.
    pub async fn call(
        &mut self,
        command: &str,
        args: Map<String, Value>,
    ) -> Result<Map<String, Value>> {
        let timeout = self.operation_timeout;
        self.call_with_timeout(command, args, timeout).await
    }

    /// Like [`WorkerHandle::call`] with an explicit deadline.
    ///
    /// # Errors
    ///
    /// See [`WorkerHandle::call`].
    pub async fn call_with_timeout(
        &mut self,
        command: &str,
        args: Map<String, Value>,
        timeout: Duration,
    ) -> Result<Map<String, Value>> {
        let response = self.request(command, args, timeout).await?;
        if response.success {
            Ok(response.result.unwrap_or_default())
        } else {
            Err(PoolError::CommandFailed {
                worker_id: self.worker_id,
                command: command.to_string(),
                message: response
                    .error
                    .unwrap_or_else(|| "worker reported failure without a message".to_string()),
            })
        }
    }

    /// Send a command and return the raw response.
    ///
    /// # Errors
    ///
    /// Returns `OperationTimeout`, `PortClosed` or `Protocol` when the
    /// exchange fails.
    pub async fn request(
        &mut self,
        command: &str,
        args: Map<String, Value>,
        timeout: Duration,
    ) -> Result<Response> {
        let channel = self
            .channel
            .as_mut()
            .ok_or_else(|| PoolError::Internal("handle already checked in".to_string()))?;
        channel.call(command, args, timeout).await
    }

    /// Return the worker to the pool with an explicit outcome.
    pub fn checkin(mut self, outcome: CheckinOutcome) {
        self.outcome = Some(outcome);
    }

    fn implied_outcome(&self) -> CheckinOutcome {
        match &self.channel {
            Some(ch) if !ch.is_in_flight() && !ch.is_poisoned() => CheckinOutcome::Success,
            _ => CheckinOutcome::Broken,
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        let outcome = self.outcome.unwrap_or_else(|| self.implied_outcome());
        let command = PoolCommand::Checkin {
            worker_id: self.worker_id,
            channel: self.channel.take(),
            outcome,
        };
        if self.mailbox.send(command).is_err() {
            debug!(worker_id = %self.worker_id, "Pool manager gone; worker handle dropped");
        }
    }
}
