//! Lifecycle management for the agent's background tasks.

use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use log::{error, info, warn};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const DEFAULT_GRACE: Duration = Duration::from_secs(10);

struct NamedTask {
    name: String,
    handle: JoinHandle<Result<()>>,
}

/// Tracks named background tasks and shuts them down together.
///
/// Every task receives a child of the shared cancellation token; shutdown
/// cancels the root and then waits a bounded grace period for each task to
/// drain.
pub struct TaskManager {
    tasks: Vec<NamedTask>,
    root_token: CancellationToken,
    grace: Duration,
}

impl TaskManager {
    pub fn new() -> Self {
        Self::with_grace(DEFAULT_GRACE)
    }

    pub fn with_grace(grace: Duration) -> Self {
        Self {
            tasks: Vec::new(),
            root_token: CancellationToken::new(),
            grace,
        }
    }

    /// Token cancelled when shutdown begins. Handed to code that needs to
    /// observe shutdown without being a registered task.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.root_token.clone()
    }

    /// Spawns a task under the given name. The task owns a child token and
    /// is expected to return promptly once it is cancelled.
    pub fn spawn<F, Fut>(&mut self, name: &str, task_fn: F)
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let token = self.root_token.child_token();
        let task_name = name.to_string();

        let handle = tokio::spawn(async move {
            info!("Task '{task_name}' starting");
            let outcome = task_fn(token).await;
            match &outcome {
                Ok(()) => info!("Task '{task_name}' finished"),
                Err(e) => error!("Task '{task_name}' failed: {e}"),
            }
            outcome
        });

        self.tasks.push(NamedTask {
            name: name.to_string(),
            handle,
        });
    }

    /// Cancels every task and waits out the grace period. Returns the
    /// first failure so the exit code reflects an unclean shutdown.
    pub async fn shutdown(&mut self) -> Result<()> {
        info!("Stopping {} background tasks", self.tasks.len());
        self.root_token.cancel();

        let mut first_error = None;
        for NamedTask { name, handle } in self.tasks.drain(..) {
            let failure = match tokio::time::timeout(self.grace, handle).await {
                Ok(Ok(Ok(()))) => None,
                Ok(Ok(Err(e))) => Some(e.context(format!("task '{name}' failed"))),
                Ok(Err(e)) => Some(anyhow!("task '{name}' panicked: {e}")),
                Err(_) => Some(anyhow!("task '{name}' ignored shutdown for {:?}", self.grace)),
            };

            if let Some(e) = failure {
                warn!("{e:#}");
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e).context("unclean shutdown"),
            None => {
                info!("All background tasks stopped");
                Ok(())
            }
        }
    }

    #[cfg(test)]
    fn active_count(&self) -> usize {
        self.tasks.len()
    }
}

impl Default for TaskManager {
    fn default() -> Self {
        Self::new()
    }
}
