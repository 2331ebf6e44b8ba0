//! Persistence layer for job and run state.

mod sqlite_store;

pub use sqlite_store::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::SchedResult;
use crate::job::{Job, JobFilter, JobId, JobStatus};
use crate::run::{JobRun, RunFilter, RunId, RunStatus};

/// Trait for persistent state storage.
///
/// Status updates are conditional: a store only applies a transition the
/// state machine allows, so concurrent writers can never move a job or run
/// backwards or out of a terminal state.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Insert a newly submitted job.
    async fn insert_job(&self, job: &Job) -> SchedResult<()>;

    /// Load a job from the store.
    async fn load_job(&self, job_id: &JobId) -> SchedResult<Option<Job>>;

    /// List jobs matching a filter, most urgent and oldest first.
    async fn list_jobs(&self, filter: &JobFilter) -> SchedResult<Vec<Job>>;

    /// Move a job to `status`.
    ///
    /// Returns `false` when the job is already at or past `status`.
    async fn update_job_status(&self, job_id: &JobId, status: JobStatus) -> SchedResult<bool>;

    /// Atomically move a SUBMITTED job to PROCESSING and create its run.
    ///
    /// Returns `None` when the job is no longer SUBMITTED.
    async fn promote_job(
        &self,
        job_id: &JobId,
        scheduled_time: DateTime<Utc>,
    ) -> SchedResult<Option<JobRun>>;

    /// Insert a run. Fails if its scheduled time is already taken.
    async fn insert_run(&self, run: &JobRun) -> SchedResult<()>;

    /// Load a run from the store.
    async fn load_run(&self, run_id: &RunId) -> SchedResult<Option<JobRun>>;

    /// Latest run of a job.
    async fn run_for_job(&self, job_id: &JobId) -> SchedResult<Option<JobRun>>;

    /// List runs matching a filter, in scheduled-time order.
    async fn list_runs(&self, filter: &RunFilter) -> SchedResult<Vec<JobRun>>;

    /// Move a run to `status`, optionally replacing its log.
    ///
    /// Returns the updated run, or `None` when the transition is not allowed
    /// from the run's current status.
    async fn update_run(
        &self,
        run_id: &RunId,
        status: RunStatus,
        log: Option<&str>,
    ) -> SchedResult<Option<JobRun>>;

    /// Most recent scheduled time handed out so far.
    async fn latest_scheduled_time(&self) -> SchedResult<Option<DateTime<Utc>>>;
}
