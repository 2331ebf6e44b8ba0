//! Job and run lifecycle operations.
//!
//! [`JobController`] is the only place that changes job or run status. It
//! enforces the state machines on top of the store's conditional updates and
//! publishes a [`RunEvent`] for every run change it makes.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::error::{SchedError, SchedResult};
use crate::events::{EventBus, RunEvent};
use crate::job::{Job, JobFilter, JobId, JobStatus, JobSubmission};
use crate::persistence::StateStore;
use crate::run::{JobRun, RunFilter, RunId, RunStatus};

/// Log written on runs cancelled by a user.
pub const CANCELLED_LOG: &str = "Cancelled by user";

/// Log written on runs cancelled by startup reconciliation.
pub const RESTARTED_LOG: &str = "Server restarted";

/// Outcome of [`JobController::reconcile_on_startup`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Runs moved to CANCELLED.
    pub runs_cancelled: usize,
    /// Jobs moved to PROCESSED.
    pub jobs_processed: usize,
}

/// Submits, cancels and transitions jobs and runs.
#[derive(Clone)]
pub struct JobController {
    store: Arc<dyn StateStore>,
    events: EventBus,
}

impl JobController {
    /// Create a controller over `store`, publishing on `events`.
    pub fn new(store: Arc<dyn StateStore>, events: EventBus) -> Self {
        Self { store, events }
    }

    /// Underlying store.
    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    /// Event bus run changes are published on.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Validate a submission and insert the resulting job.
    pub async fn submit(&self, submission: JobSubmission) -> SchedResult<JobId> {
        let job = submission.into_job()?;
        self.submit_job(job).await
    }

    /// Insert an already built job as SUBMITTED.
    pub async fn submit_job(&self, mut job: Job) -> SchedResult<JobId> {
        job.validate()?;
        job.status = JobStatus::Submitted;
        self.store.insert_job(&job).await?;
        tracing::info!(
            job_id = %job.id,
            experiment = %job.experiment,
            priority = job.priority.value(),
            "Submitted job"
        );
        Ok(job.id)
    }

    /// Cancel a job and its open run.
    ///
    /// Returns `false` when the job was already PROCESSED.
    pub async fn cancel(&self, job_id: &JobId) -> SchedResult<bool> {
        let job = self.job(job_id).await?;
        if job.status.is_terminal() {
            tracing::debug!(job_id = %job_id, "Cancel of processed job ignored");
            return Ok(false);
        }

        // Once the job is PROCESSED the scheduler can no longer promote it,
        // so any run that exists is visible below.
        let changed = self.store.update_job_status(job_id, JobStatus::Processed).await?;

        if let Some(run) = self.store.run_for_job(job_id).await? {
            if run.status.is_open() {
                self.set_run_status(&run.id, RunStatus::Cancelled, Some(CANCELLED_LOG))
                    .await?;
            }
        }

        tracing::info!(job_id = %job_id, "Cancelled job");
        Ok(changed)
    }

    /// Copy a job into a fresh SUBMITTED job with `parent_job` set.
    pub async fn resubmit(&self, job_id: &JobId) -> SchedResult<JobId> {
        let job = self.job(job_id).await?;
        let again = job.resubmission();
        self.store.insert_job(&again).await?;
        tracing::info!(job_id = %again.id, parent_job = %job_id, "Resubmitted job");
        Ok(again.id)
    }

    /// Close out state orphaned by a previous process.
    ///
    /// Queues are not persisted, so every PENDING or PROCESSING run lost its
    /// tasks in the crash and is cancelled; every PROCESSING job is marked
    /// PROCESSED.
    pub async fn reconcile_on_startup(&self) -> SchedResult<ReconcileReport> {
        let mut report = ReconcileReport::default();

        for run in self.store.list_runs(&RunFilter::open()).await? {
            if self
                .set_run_status(&run.id, RunStatus::Cancelled, Some(RESTARTED_LOG))
                .await?
            {
                report.runs_cancelled += 1;
            }
        }

        let filter = JobFilter::default().with_status([JobStatus::Processing]);
        for job in self.store.list_jobs(&filter).await? {
            if self.store.update_job_status(&job.id, JobStatus::Processed).await? {
                report.jobs_processed += 1;
            }
        }

        if report != ReconcileReport::default() {
            tracing::warn!(
                runs_cancelled = report.runs_cancelled,
                jobs_processed = report.jobs_processed,
                "Reconciled state left by previous process"
            );
        }
        Ok(report)
    }

    /// Atomically move a SUBMITTED job to PROCESSING and create its run.
    pub async fn promote(
        &self,
        job_id: &JobId,
        scheduled_time: DateTime<Utc>,
    ) -> SchedResult<Option<JobRun>> {
        let run = self.store.promote_job(job_id, scheduled_time).await?;
        if let Some(ref run) = run {
            self.events.publish(RunEvent::RunCreated { run: run.clone() });
        }
        Ok(run)
    }

    /// Move a run to `status` if the state machine allows it.
    ///
    /// Returns whether the run changed. Runs already in a terminal state are
    /// left untouched.
    pub async fn set_run_status(
        &self,
        run_id: &RunId,
        status: RunStatus,
        log: Option<&str>,
    ) -> SchedResult<bool> {
        match self.store.update_run(run_id, status, log).await? {
            Some(run) => {
                tracing::debug!(run_id = %run_id, status = %status, "Run status changed");
                self.events.publish(RunEvent::RunUpdated {
                    run_id: run.id,
                    status: run.status,
                    log: run.log,
                });
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Mark a job PROCESSED. No-op if it already is.
    pub async fn finish_job(&self, job_id: &JobId) -> SchedResult<()> {
        self.store.update_job_status(job_id, JobStatus::Processed).await?;
        Ok(())
    }

    /// Load a job.
    pub async fn job(&self, job_id: &JobId) -> SchedResult<Job> {
        self.store
            .load_job(job_id)
            .await?
            .ok_or_else(|| SchedError::JobNotFound(job_id.to_string()))
    }

    /// Load a run.
    pub async fn run(&self, run_id: &RunId) -> SchedResult<JobRun> {
        self.store
            .load_run(run_id)
            .await?
            .ok_or_else(|| SchedError::RunNotFound(run_id.to_string()))
    }

    /// Latest run of a job, if one was created.
    pub async fn run_for_job(&self, job_id: &JobId) -> SchedResult<Option<JobRun>> {
        self.store.run_for_job(job_id).await
    }

    /// Whether workers must stop producing data for a run.
    pub async fn is_aborted(&self, run_id: &RunId) -> SchedResult<bool> {
        Ok(self.run(run_id).await?.status.is_aborted())
    }

    /// List jobs matching a filter.
    pub async fn list_jobs(&self, filter: &JobFilter) -> SchedResult<Vec<Job>> {
        self.store.list_jobs(filter).await
    }

    /// List runs matching a filter.
    pub async fn list_runs(&self, filter: &RunFilter) -> SchedResult<Vec<JobRun>> {
        self.store.list_runs(filter).await
    }
}
