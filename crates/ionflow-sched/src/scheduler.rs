//! Scheduler: promotes submitted jobs into runs.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::control::JobController;
use crate::error::SchedResult;
use crate::job::{JobFilter, JobStatus};
use crate::queue::TaskQueue;
use crate::run::{JobRun, RunStatus, ScheduleClock};
use crate::stages::SHUTDOWN_LOG;
use crate::task::PreProcessingTask;

/// Single control loop feeding the pre-processing queue.
pub struct Scheduler {
    controller: JobController,
    pre_queue: Arc<TaskQueue<PreProcessingTask>>,
    poll_interval: Duration,
    clock: ScheduleClock,
}

impl Scheduler {
    /// Create a scheduler.
    pub fn new(
        controller: JobController,
        pre_queue: Arc<TaskQueue<PreProcessingTask>>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            controller,
            pre_queue,
            poll_interval,
            clock: ScheduleClock::new(),
        }
    }

    /// Reconcile orphaned state and resume the clock after the last run.
    pub async fn prepare(&mut self) -> SchedResult<()> {
        self.controller.reconcile_on_startup().await?;
        let latest = self.controller.store().latest_scheduled_time().await?;
        self.clock = ScheduleClock::resume_after(latest);
        Ok(())
    }

    /// Promote every SUBMITTED job, most urgent first.
    ///
    /// A failure promoting one job is logged and the job is retried on the
    /// next tick. Returns the number of runs created.
    pub async fn tick(&mut self) -> SchedResult<usize> {
        if self.pre_queue.is_closed() {
            return Ok(0);
        }

        let jobs = self.controller.list_jobs(&JobFilter::submitted()).await?;
        let mut promoted = 0;

        for mut job in jobs {
            let scheduled_time = self.clock.next();
            let run = match self.controller.promote(&job.id, scheduled_time).await {
                Ok(Some(run)) => run,
                Ok(None) => {
                    tracing::debug!(job_id = %job.id, "Job left SUBMITTED before promotion");
                    continue;
                }
                Err(e) => {
                    tracing::error!(job_id = %job.id, "Failed to promote job: {}", e);
                    continue;
                }
            };

            tracing::info!(
                job_id = %job.id,
                run_id = %run.id,
                scheduled_time = %run.scheduled_time,
                "Created run"
            );
            job.status = JobStatus::Processing;
            let (job_id, queued) = (job.id, run.clone());
            if let Err(e) = self.pre_queue.put(PreProcessingTask { job, run }) {
                tracing::error!(job_id = %job_id, run_id = %queued.id, "Failed to queue run: {}", e);
                self.abandon(&queued).await;
                continue;
            }
            promoted += 1;
        }

        Ok(promoted)
    }

    /// Close out a run that never reached the pre-processing queue.
    ///
    /// The queue only refuses tasks once the pipeline is shutting down.
    async fn abandon(&self, run: &JobRun) {
        if let Err(e) = self
            .controller
            .set_run_status(&run.id, RunStatus::Cancelled, Some(SHUTDOWN_LOG))
            .await
        {
            tracing::error!(run_id = %run.id, "Failed to cancel unqueued run: {}", e);
        }
        if let Err(e) = self.controller.finish_job(&run.job_id).await {
            tracing::error!(job_id = %run.job_id, "Failed to mark job processed: {}", e);
        }
    }

    /// Reconcile, then run the control loop until `shutdown` fires.
    pub async fn run(mut self, shutdown: CancellationToken) -> SchedResult<()> {
        self.prepare().await?;
        self.serve(shutdown).await
    }

    /// Run the control loop without reconciling first.
    pub async fn serve(mut self, shutdown: CancellationToken) -> SchedResult<()> {
        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if let Err(e) = self.tick().await {
                if self.pre_queue.is_closed() {
                    break;
                }
                tracing::error!("Error promoting jobs: {}", e);
            }
        }

        tracing::debug!("Scheduler stopped");
        Ok(())
    }

    /// Spawn [`Scheduler::run`] on the runtime.
    pub fn start(self, shutdown: CancellationToken) -> tokio::task::JoinHandle<SchedResult<()>> {
        tokio::spawn(self.run(shutdown))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::job::{JobSubmission, Priority};
    use crate::persistence::SqliteStore;
    use crate::run::{RunFilter, RunStatus};

    fn setup() -> (Scheduler, JobController, Arc<TaskQueue<PreProcessingTask>>) {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let controller = JobController::new(store, EventBus::new());
        let queue = Arc::new(TaskQueue::new("pre"));
        let scheduler = Scheduler::new(
            controller.clone(),
            Arc::clone(&queue),
            Duration::from_millis(10),
        );
        (scheduler, controller, queue)
    }

    #[tokio::test]
    async fn test_tick_promotes_in_priority_order() {
        let (mut scheduler, ctl, queue) = setup();
        let low = ctl.submit(JobSubmission::new("exp").with_priority(20)).await.unwrap();
        let high = ctl.submit(JobSubmission::new("exp").with_priority(1)).await.unwrap();
        let mid = ctl.submit(JobSubmission::new("exp").with_priority(5)).await.unwrap();

        assert_eq!(scheduler.tick().await.unwrap(), 3);
        assert_eq!(scheduler.tick().await.unwrap(), 0);

        let order: Vec<_> = std::iter::from_fn(|| queue.try_get()).map(|t| t.job.id).collect();
        assert_eq!(order, vec![high, mid, low]);

        let runs = ctl.list_runs(&RunFilter::default()).await.unwrap();
        assert_eq!(runs.len(), 3);
        // Scheduled times follow promotion order and are distinct.
        assert_eq!(runs[0].job_id, high);
        assert!(runs.windows(2).all(|w| w[0].scheduled_time < w[1].scheduled_time));
        for run in runs {
            assert_eq!(run.status, RunStatus::Pending);
            assert_eq!(ctl.job(&run.job_id).await.unwrap().status, JobStatus::Processing);
        }
    }

    #[tokio::test]
    async fn test_prepare_reconciles_and_resumes_clock() {
        let (mut scheduler, ctl, queue) = setup();
        let orphan = ctl.submit(JobSubmission::new("exp")).await.unwrap();
        let future = chrono::Utc::now() + chrono::Duration::seconds(30);
        let orphan_run = ctl.promote(&orphan, future).await.unwrap().unwrap();

        scheduler.prepare().await.unwrap();
        assert_eq!(ctl.run(&orphan_run.id).await.unwrap().status, RunStatus::Cancelled);

        let fresh = ctl.submit(JobSubmission::new("exp")).await.unwrap();
        scheduler.tick().await.unwrap();
        let task = queue.try_get().unwrap();
        assert_eq!(task.job.id, fresh);
        assert!(task.run.scheduled_time > future);
    }

    #[tokio::test]
    async fn test_unqueued_run_is_closed_out() {
        let (mut scheduler, ctl, queue) = setup();
        let first = ctl.submit(JobSubmission::new("exp").with_priority(1)).await.unwrap();
        let second = ctl.submit(JobSubmission::new("exp").with_priority(2)).await.unwrap();

        // Promote both, then lose the queue before they are pushed.
        let runs = vec![
            ctl.promote(&first, chrono::Utc::now()).await.unwrap().unwrap(),
            ctl.promote(&second, chrono::Utc::now() + chrono::Duration::seconds(1))
                .await
                .unwrap()
                .unwrap(),
        ];
        queue.close();
        for run in &runs {
            scheduler.abandon(run).await;
        }
        for (job_id, run) in [(first, &runs[0]), (second, &runs[1])] {
            let run = ctl.run(&run.id).await.unwrap();
            assert_eq!(run.status, RunStatus::Cancelled);
            assert_eq!(run.log.as_deref(), Some(SHUTDOWN_LOG));
            assert_eq!(ctl.job(&job_id).await.unwrap().status, JobStatus::Processed);
        }

        // A closed queue stops promotion instead of failing the tick.
        let third = ctl.submit(JobSubmission::new("exp")).await.unwrap();
        assert_eq!(scheduler.tick().await.unwrap(), 0);
        assert_eq!(ctl.job(&third).await.unwrap().status, JobStatus::Submitted);
    }

    #[tokio::test]
    async fn test_run_loop_stops_on_shutdown() {
        let (scheduler, ctl, queue) = setup();
        let shutdown = CancellationToken::new();
        let handle = scheduler.start(shutdown.clone());

        let job_id = ctl
            .submit(JobSubmission::new("exp").with_priority(i64::from(Priority::HIGHEST.value())))
            .await
            .unwrap();
        let task = queue.get_timeout(Duration::from_secs(5)).await.unwrap();
        assert_eq!(task.job.id, job_id);

        shutdown.cancel();
        handle.await.unwrap().unwrap();
    }
}
