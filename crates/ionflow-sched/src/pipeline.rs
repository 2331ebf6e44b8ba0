//! Pipeline assembly: queues, worker pools and the scheduler.

use std::sync::Arc;

use futures::future::join_all;
use ionflow_hal::{
    DeviceClient, DeviceRegistry, HardwareBackend, ParameterMap, ParameterSource,
    SequenceGenerator,
};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::PipelineConfig;
use crate::control::JobController;
use crate::error::{SchedError, SchedResult};
use crate::events::{EventBus, RunEvent};
use crate::job::{JobId, JobSubmission};
use crate::persistence::StateStore;
use crate::queue::TaskQueue;
use crate::results::ResultStore;
use crate::scheduler::Scheduler;
use crate::snapshot::ParameterUpdate;
use crate::stages::{DeviceLocks, HardwareWorker, PostProcessingWorker, PreProcessingWorker};
use crate::task::{HardwareTask, PostProcessingTask, PreProcessingTask};

/// External collaborators the stages call into.
#[derive(Clone)]
pub struct Collaborators {
    /// Global and local parameter store.
    pub parameters: Arc<dyn ParameterSource>,
    /// Program generator.
    pub generator: Arc<dyn SequenceGenerator>,
    /// Device lookup.
    pub registry: Arc<dyn DeviceRegistry>,
    /// Device access.
    pub devices: Arc<dyn DeviceClient>,
    /// Hardware driver.
    pub hardware: Arc<dyn HardwareBackend>,
    /// Result archive.
    pub results: Arc<dyn ResultStore>,
}

/// A running pipeline.
///
/// Dropping the pipeline does not stop it; call [`Pipeline::shutdown`].
pub struct Pipeline {
    controller: JobController,
    pre_queue: Arc<TaskQueue<PreProcessingTask>>,
    hardware_queue: Arc<TaskQueue<HardwareTask>>,
    post_queue: Arc<TaskQueue<PostProcessingTask>>,
    updates: Vec<mpsc::UnboundedSender<ParameterUpdate>>,
    shutdown: CancellationToken,
    scheduler: JoinHandle<SchedResult<()>>,
    workers: Vec<JoinHandle<()>>,
}

impl Pipeline {
    /// Reconcile leftover state and start every worker and the scheduler.
    pub async fn start(
        config: PipelineConfig,
        store: Arc<dyn StateStore>,
        collaborators: Collaborators,
        events: EventBus,
    ) -> SchedResult<Self> {
        config.validate()?;

        let controller = JobController::new(store, events);
        let pre_queue = Arc::new(TaskQueue::new("pre-processing"));
        let hardware_queue = Arc::new(TaskQueue::new("hardware"));
        let post_queue = Arc::new(TaskQueue::new("post-processing"));
        let shutdown = CancellationToken::new();
        let poll_timeout = config.queue_poll_timeout();

        let mut scheduler = Scheduler::new(
            controller.clone(),
            Arc::clone(&pre_queue),
            config.poll_interval(),
        );
        scheduler.prepare().await?;

        let mut workers = Vec::new();
        let mut updates = Vec::with_capacity(config.pre_processing_workers);

        for id in 0..config.pre_processing_workers {
            let (tx, rx) = mpsc::unbounded_channel();
            updates.push(tx);
            let worker = PreProcessingWorker::new(
                id,
                controller.clone(),
                Arc::clone(&collaborators.parameters),
                Arc::clone(&collaborators.generator),
                Arc::clone(&pre_queue),
                Arc::clone(&hardware_queue),
                rx,
            )
            .with_pipeline_depth(config.pipeline_depth)
            .with_poll_timeout(poll_timeout);
            workers.push(tokio::spawn(worker.run(shutdown.clone())));
        }

        let device_locks = config
            .serialize_device_writes
            .then(|| Arc::new(DeviceLocks::new()));
        for id in 0..config.hardware_workers {
            let mut worker = HardwareWorker::new(
                id,
                controller.clone(),
                Arc::clone(&collaborators.registry),
                Arc::clone(&collaborators.devices),
                Arc::clone(&collaborators.parameters),
                Arc::clone(&collaborators.hardware),
                Arc::clone(&hardware_queue),
                Arc::clone(&post_queue),
            )
            .with_poll_timeout(poll_timeout);
            if let Some(ref locks) = device_locks {
                worker = worker.with_device_locks(Arc::clone(locks));
            }
            workers.push(tokio::spawn(worker.run(shutdown.clone())));
        }

        for id in 0..config.post_processing_workers {
            let worker = PostProcessingWorker::new(
                id,
                controller.clone(),
                Arc::clone(&collaborators.results),
                Arc::clone(&post_queue),
            )
            .with_poll_timeout(poll_timeout);
            workers.push(tokio::spawn(worker.run(shutdown.clone())));
        }

        let scheduler = tokio::spawn(scheduler.serve(shutdown.clone()));

        tracing::info!(
            pre_processing_workers = config.pre_processing_workers,
            hardware_workers = config.hardware_workers,
            post_processing_workers = config.post_processing_workers,
            backend = collaborators.hardware.name(),
            "Pipeline started"
        );

        Ok(Self {
            controller,
            pre_queue,
            hardware_queue,
            post_queue,
            updates,
            shutdown,
            scheduler,
            workers,
        })
    }

    /// Job and run operations.
    pub fn controller(&self) -> &JobController {
        &self.controller
    }

    /// Submit a job.
    pub async fn submit(&self, submission: JobSubmission) -> SchedResult<JobId> {
        self.controller.submit(submission).await
    }

    /// Cancel a job. Returns `false` if it was already processed.
    pub async fn cancel(&self, job_id: &JobId) -> SchedResult<bool> {
        self.controller.cancel(job_id).await
    }

    /// Ask running jobs to re-query parameters at latest.
    ///
    /// With `Some(job_id)` only that job's run refreshes.
    pub fn update_parameters(&self, job_id: Option<JobId>) -> SchedResult<()> {
        self.notify_workers(ParameterUpdate::UpdateParameters { job_id })
    }

    /// Merge calibrated values into every running job without re-querying.
    pub fn calibrate(&self, values: ParameterMap) -> SchedResult<()> {
        self.notify_workers(ParameterUpdate::Calibration { values })
    }

    fn notify_workers(&self, update: ParameterUpdate) -> SchedResult<()> {
        for sender in &self.updates {
            sender
                .send(update.clone())
                .map_err(|_| SchedError::ChannelClosed("parameter updates".to_string()))?;
        }
        Ok(())
    }

    /// Subscribe to run notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.controller.events().subscribe()
    }

    /// Token that stops the pipeline when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Queued task counts (pre-processing, hardware, post-processing).
    pub fn queue_depths(&self) -> (usize, usize, usize) {
        (
            self.pre_queue.len(),
            self.hardware_queue.len(),
            self.post_queue.len(),
        )
    }

    /// Stop the scheduler and every worker, then wait for them.
    ///
    /// Runs still in progress are cancelled by their pre-processing worker.
    pub async fn shutdown(self) -> SchedResult<()> {
        tracing::info!("Shutting down pipeline");
        self.shutdown.cancel();

        let scheduler = self
            .scheduler
            .await
            .map_err(|e| SchedError::ChannelClosed(format!("scheduler task: {e}")))?;

        for result in join_all(self.workers).await {
            if let Err(e) = result {
                tracing::error!("Worker task failed: {}", e);
            }
        }

        self.pre_queue.close();
        self.hardware_queue.close();
        self.post_queue.close();
        tracing::info!("Pipeline stopped");
        scheduler
    }
}
