//! Job runs: one execution attempt of a job.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::job::JobId;

/// Unique identifier for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub Uuid);

impl RunId {
    /// Create a new random run ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse a run ID from a string.
    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    /// Created, waiting in the pre-processing queue.
    Pending,
    /// Accepted by a pre-processing worker.
    Processing,
    /// All data points completed.
    Done,
    /// Stopped by an error.
    Failed,
    /// Stopped by a user or by crash recovery.
    Cancelled,
}

impl RunStatus {
    /// Check if the run is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Done | RunStatus::Failed | RunStatus::Cancelled)
    }

    /// Whether workers must stop producing data for the run.
    pub fn is_aborted(&self) -> bool {
        matches!(self, RunStatus::Failed | RunStatus::Cancelled)
    }

    /// Check if the run has not finished yet.
    pub fn is_open(&self) -> bool {
        !self.is_terminal()
    }

    /// Whether moving to `next` follows PENDING -> PROCESSING -> terminal.
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        match self {
            RunStatus::Pending => next != RunStatus::Pending,
            RunStatus::Processing => next.is_terminal(),
            _ => false,
        }
    }

    /// Status name as stored and displayed.
    pub fn name(&self) -> &'static str {
        match self {
            RunStatus::Pending => "PENDING",
            RunStatus::Processing => "PROCESSING",
            RunStatus::Done => "DONE",
            RunStatus::Failed => "FAILED",
            RunStatus::Cancelled => "CANCELLED",
        }
    }

    /// Parse a stored status name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "PENDING" => Some(RunStatus::Pending),
            "PROCESSING" => Some(RunStatus::Processing),
            "DONE" => Some(RunStatus::Done),
            "FAILED" => Some(RunStatus::Failed),
            "CANCELLED" => Some(RunStatus::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// One execution attempt of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRun {
    /// Unique run identifier.
    pub id: RunId,

    /// Owning job.
    pub job_id: JobId,

    /// Globally unique execution ordering and archival key.
    pub scheduled_time: DateTime<Utc>,

    /// Current status.
    pub status: RunStatus,

    /// Free-text log message.
    pub log: Option<String>,
}

impl JobRun {
    /// Create a pending run for `job_id`.
    pub fn new(job_id: JobId, scheduled_time: DateTime<Utc>) -> Self {
        Self {
            id: RunId::new(),
            job_id,
            scheduled_time,
            status: RunStatus::Pending,
            log: None,
        }
    }

    /// Archival key derived from the scheduled time.
    pub fn result_key(&self) -> String {
        result_key(self.scheduled_time)
    }
}

/// Archival key for a run scheduled at `scheduled_time`.
///
/// Sorts lexicographically in scheduling order.
pub fn result_key(scheduled_time: DateTime<Utc>) -> String {
    scheduled_time.format("%Y%m%dT%H%M%S%.6fZ").to_string()
}

/// Produces strictly increasing scheduled times.
///
/// Two runs created within the same clock tick get distinct times one
/// microsecond apart. Storage precision is microseconds.
#[derive(Debug, Default)]
pub struct ScheduleClock {
    last: Option<DateTime<Utc>>,
}

impl ScheduleClock {
    /// Create a clock that has issued nothing yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Resume after the latest time already persisted.
    pub fn resume_after(last: Option<DateTime<Utc>>) -> Self {
        Self { last }
    }

    /// Next scheduled time, never equal to or before a previous one.
    pub fn next(&mut self) -> DateTime<Utc> {
        let now = truncate_micros(Utc::now());
        let next = match self.last {
            Some(last) if now <= last => last + Duration::microseconds(1),
            _ => now,
        };
        self.last = Some(next);
        next
    }
}

fn truncate_micros(ts: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(ts.timestamp_micros()).unwrap_or(ts)
}

/// Filter for listing runs.
#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    /// Filter by status.
    pub status: Option<Vec<RunStatus>>,

    /// Filter by owning job.
    pub job_id: Option<JobId>,

    /// Maximum number of results.
    pub limit: Option<usize>,
}

impl RunFilter {
    /// Runs that have not reached a terminal state.
    pub fn open() -> Self {
        Self::default().with_status([RunStatus::Pending, RunStatus::Processing])
    }

    /// Filter by status.
    pub fn with_status(mut self, status: impl IntoIterator<Item = RunStatus>) -> Self {
        self.status = Some(status.into_iter().collect());
        self
    }

    /// Filter by owning job.
    pub fn for_job(mut self, job_id: JobId) -> Self {
        self.job_id = Some(job_id);
        self
    }

    /// Check if a run matches this filter.
    pub fn matches(&self, run: &JobRun) -> bool {
        if let Some(ref statuses) = self.status {
            if !statuses.contains(&run.status) {
                return false;
            }
        }
        if let Some(job_id) = self.job_id {
            if run.job_id != job_id {
                return false;
            }
        }
        true
    }
}
