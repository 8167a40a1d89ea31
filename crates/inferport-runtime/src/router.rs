use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use inferport_core::{Backend, ExecError, ExecMode, ResultEnvelope};
use inferport_offload::{OffloadClient, OffloadTask, MAX_OFFLOAD_TIMEOUT};
use tracing::debug;

use crate::{LocalBackendManager, Task};

/// Dispatches each task to the local manager or the offload client. Holds
/// no locks of its own.
pub struct ExecutionRouter<B: Backend> {
    manager: Arc<LocalBackendManager<B>>,
    offload: Option<Arc<OffloadClient>>,
    default_mode: ExecMode,
    offload_timeout: Duration,
}

impl<B: Backend> Clone for ExecutionRouter<B> {
    fn clone(&self) -> Self {
        Self {
            manager: self.manager.clone(),
            offload: self.offload.clone(),
            default_mode: self.default_mode,
            offload_timeout: self.offload_timeout,
        }
    }
}

impl<B: Backend> ExecutionRouter<B> {
    pub fn new(manager: Arc<LocalBackendManager<B>>) -> Self {
        Self {
            manager,
            offload: None,
            default_mode: ExecMode::Cpu,
            offload_timeout: MAX_OFFLOAD_TIMEOUT,
        }
    }

    pub fn with_offload(mut self, client: Arc<OffloadClient>, timeout: Duration) -> Self {
        self.offload = Some(client);
        self.offload_timeout = timeout.min(MAX_OFFLOAD_TIMEOUT);
        self
    }

    pub fn with_default_mode(mut self, mode: ExecMode) -> Self {
        self.default_mode = mode;
        self
    }

    pub fn manager(&self) -> &Arc<LocalBackendManager<B>> {
        &self.manager
    }

    pub fn offload(&self) -> Option<&Arc<OffloadClient>> {
        self.offload.as_ref()
    }

    pub fn default_mode(&self) -> ExecMode {
        self.default_mode
    }

    pub async fn run(&self, mode: ExecMode, task: Task) -> Result<ResultEnvelope, ExecError> {
        debug!(%mode, model = %task.model, top_k = task.top_k, "routing task");
        match mode.local_strategy() {
            Some(strategy) => {
                let manager = self.manager.clone();
                tokio::task::spawn_blocking(move || {
                    manager.run_with_model(task.model, &task.payload, task.top_k, strategy)
                })
                .await
                .map_err(|e| ExecError::LocalExecution(format!("inference worker failed: {e}")))?
            }
            None => {
                let Some(client) = &self.offload else {
                    return Err(ExecError::Connectivity(
                        "offload is not configured".to_string(),
                    ));
                };
                let offload = OffloadTask {
                    image: task.payload,
                    model_name: task.model.name.to_string(),
                };
                client
                    .submit_task(&offload, task.top_k, self.offload_timeout)
                    .await
            }
        }
    }

    /// Runs `task` in its hinted mode, or the router default.
    pub async fn run_task(&self, task: Task) -> Result<ResultEnvelope, ExecError> {
        let mode = task.mode.unwrap_or(self.default_mode);
        self.run(mode, task).await
    }

    /// Runs every task concurrently. Results come back in task order.
    pub async fn run_batch(&self, tasks: Vec<Task>) -> Vec<Result<ResultEnvelope, ExecError>> {
        join_all(tasks.into_iter().map(|task| self.run_task(task))).await
    }
}
