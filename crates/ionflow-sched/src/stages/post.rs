//! Post-processing: archives captured data points.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::control::JobController;
use crate::error::SchedResult;
use crate::queue::TaskQueue;
use crate::results::ResultStore;
use crate::run::RunStatus;
use crate::stages::next_task;
use crate::task::PostProcessingTask;

/// Worker of the post-processing stage.
pub struct PostProcessingWorker {
    id: usize,
    controller: JobController,
    results: Arc<dyn ResultStore>,
    input: Arc<TaskQueue<PostProcessingTask>>,
    poll_timeout: Duration,
}

impl PostProcessingWorker {
    /// Create a worker.
    pub fn new(
        id: usize,
        controller: JobController,
        results: Arc<dyn ResultStore>,
        input: Arc<TaskQueue<PostProcessingTask>>,
    ) -> Self {
        Self {
            id,
            controller,
            results,
            input,
            poll_timeout: Duration::from_millis(200),
        }
    }

    /// Set how long an idle worker waits before checking for shutdown.
    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    /// Consume tasks until shutdown.
    pub async fn run(self, shutdown: CancellationToken) {
        tracing::debug!(worker = self.id, "Post-processing worker started");
        while let Some(task) = next_task(&self.input, self.poll_timeout, &shutdown).await {
            let outcome = self.process(&task).await;
            if let Err(ref e) = outcome {
                tracing::error!(
                    worker = self.id,
                    run_id = %task.run_id,
                    index = task.data_point.index,
                    "Failed to archive data point: {}",
                    e
                );
                let log = e.to_string();
                if let Err(e) = self
                    .controller
                    .set_run_status(&task.run_id, RunStatus::Failed, Some(log.as_str()))
                    .await
                {
                    tracing::error!(run_id = %task.run_id, "Failed to mark run failed: {}", e);
                }
            }
            task.acknowledge(matches!(outcome, Ok(true)));
        }
        tracing::debug!(worker = self.id, "Post-processing worker stopped");
    }

    /// Returns whether the data point was archived.
    async fn process(&self, task: &PostProcessingTask) -> SchedResult<bool> {
        if self.controller.is_aborted(&task.run_id).await? {
            tracing::debug!(
                worker = self.id,
                run_id = %task.run_id,
                index = task.data_point.index,
                "Dropping result of aborted run"
            );
            return Ok(false);
        }

        if task.dry_run {
            tracing::info!(
                worker = self.id,
                run_id = %task.run_id,
                index = task.data_point.index,
                result = ?task.data_point.channels.result_channels,
                "Dry run data point"
            );
            return Ok(true);
        }

        self.results
            .append(task.scheduled_time, &task.data_point)
            .await?;
        tracing::debug!(
            worker = self.id,
            job_id = %task.job_id,
            run_id = %task.run_id,
            index = task.data_point.index,
            "Archived data point"
        );
        Ok(true)
    }
}
