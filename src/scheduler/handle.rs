//! Scheduler handle for controlling the scheduler.
//!
//! This module provides the `SchedulerHandle` type that allows external control
//! of a running scheduler: wake, status and shutdown.

use std::sync::Arc;

use tokio::sync::{RwLock, mpsc, oneshot};

use super::types::{SchedulerCommand, SchedulerError, SchedulerState, SchedulerStatus};

/// Buffer size for the command channel between SchedulerHandle and Scheduler.
pub(crate) const COMMAND_CHANNEL_BUFFER: usize = 32;

/// Handle for controlling the scheduler.
#[derive(Clone)]
pub struct SchedulerHandle {
    pub(crate) command_tx: mpsc::Sender<SchedulerCommand>,
    pub(crate) state: Arc<RwLock<SchedulerState>>,
}

impl SchedulerHandle {
    /// Helper to send a command and wait for its response.
    async fn send_command<T>(
        &self,
        build_command: impl FnOnce(oneshot::Sender<T>) -> SchedulerCommand,
        operation: &str,
    ) -> Result<T, SchedulerError>
    where
        T: Send + 'static,
    {
        let (response_tx, response_rx) = oneshot::channel();
        self.command_tx
            .send(build_command(response_tx))
            .await
            .map_err(|_| {
                SchedulerError::ChannelError(format!("failed to send {} command", operation))
            })?;

        response_rx.await.map_err(|_| {
            SchedulerError::ChannelError(format!("failed to receive {} response", operation))
        })
    }

    /// Run a dispatch tick immediately.
    ///
    /// Used after a "run now" one-time job is queued.
    pub async fn wake(&self) -> Result<(), SchedulerError> {
        self.send_command(|response| SchedulerCommand::Wake { response }, "wake")
            .await
    }

    /// Report state, running jobs and worker pool usage.
    pub async fn status(&self) -> Result<SchedulerStatus, SchedulerError> {
        self.send_command(|response| SchedulerCommand::Status { response }, "status")
            .await
    }

    /// Shutdown the scheduler.
    ///
    /// Returns once in-flight runs finished or the shutdown timeout passed.
    pub async fn shutdown(&self) -> Result<(), SchedulerError> {
        self.send_command(
            |response| SchedulerCommand::Shutdown { response },
            "shutdown",
        )
        .await
    }

    /// Get the current scheduler state.
    pub async fn state(&self) -> SchedulerState {
        *self.state.read().await
    }

    /// Check if the scheduler is running.
    pub async fn is_running(&self) -> bool {
        *self.state.read().await == SchedulerState::Running
    }
}
