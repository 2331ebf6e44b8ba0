//! Job types: submitted units of experiment work.

use chrono::{DateTime, Utc};
use ionflow_hal::{ExperimentRef, ParameterId, ParameterValue};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{SchedError, SchedResult};
use crate::scan::ScanSpec;

/// Unique identifier for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    /// Create a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse a job ID from a string.
    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Job priority. Lower values are more urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub struct Priority(u8);

impl Priority {
    /// Most urgent priority.
    pub const HIGHEST: Priority = Priority(0);

    /// Least urgent priority, also the default.
    pub const LOWEST: Priority = Priority(20);

    /// Create a priority, rejecting values outside `0..=20`.
    pub fn new(value: i64) -> SchedResult<Self> {
        if (i64::from(Self::HIGHEST.0)..=i64::from(Self::LOWEST.0)).contains(&value) {
            Ok(Self(value as u8))
        } else {
            Err(SchedError::Validation(format!(
                "priority {value} outside {}..={}",
                Self::HIGHEST.0,
                Self::LOWEST.0
            )))
        }
    }

    /// Get the numeric value.
    pub fn value(&self) -> u8 {
        self.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::LOWEST
    }
}

impl TryFrom<i64> for Priority {
    type Error = SchedError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Priority> for i64 {
    fn from(p: Priority) -> Self {
        i64::from(p.0)
    }
}

/// Status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Waiting for the scheduler.
    Submitted,
    /// A run exists and is being worked on.
    Processing,
    /// Finished, failed, cancelled or reconciled.
    Processed,
}

impl JobStatus {
    /// Status name as stored and displayed.
    pub fn name(&self) -> &'static str {
        match self {
            JobStatus::Submitted => "SUBMITTED",
            JobStatus::Processing => "PROCESSING",
            JobStatus::Processed => "PROCESSED",
        }
    }

    /// Parse a stored status name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "SUBMITTED" => Some(JobStatus::Submitted),
            "PROCESSING" => Some(JobStatus::Processing),
            "PROCESSED" => Some(JobStatus::Processed),
            _ => None,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            JobStatus::Submitted => 0,
            JobStatus::Processing => 1,
            JobStatus::Processed => 2,
        }
    }

    /// Whether moving to `next` keeps the status monotonic.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        next.rank() > self.rank()
    }

    /// Check if the job is finished.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Processed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// One axis of a job's parameter sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanParameter {
    /// Target parameter.
    pub parameter: ParameterId,

    /// Ordered scan values, all of one scalar kind.
    pub values: Vec<ParameterValue>,
}

impl ScanParameter {
    /// Create a scan parameter.
    pub fn new(parameter: ParameterId, values: Vec<ParameterValue>) -> Self {
        Self { parameter, values }
    }

    /// Check that the value list is non-empty and homogeneous.
    pub fn validate(&self) -> SchedResult<()> {
        let Some(first) = self.values.first() else {
            return Err(SchedError::Validation(format!(
                "scan parameter '{}' has no values",
                self.parameter
            )));
        };
        if let Some(other) = self.values.iter().find(|v| v.kind() != first.kind()) {
            return Err(SchedError::Validation(format!(
                "scan parameter '{}' mixes {} and {} values",
                self.parameter,
                first.kind(),
                other.kind()
            )));
        }
        Ok(())
    }
}

/// A unit of experiment work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique job identifier.
    pub id: JobId,

    /// Job creation timestamp. Never changes after insert.
    pub created_at: DateTime<Utc>,

    /// Experiment the job runs.
    pub experiment: ExperimentRef,

    /// Current job status.
    pub status: JobStatus,

    /// Job priority.
    pub priority: Priority,

    /// Timestamp local parameters are resolved against.
    pub local_parameters_timestamp: DateTime<Utc>,

    /// How often the full combination set is repeated.
    pub repetitions: u32,

    /// Shots per data point.
    pub shots: u32,

    /// Job this one was resubmitted from.
    pub parent_job: Option<JobId>,

    /// Dry-run flag.
    pub debug_mode: bool,

    /// Whether calibration runs may refresh parameters automatically.
    pub auto_calibration: bool,

    /// Scan axes. Empty means continuous scan.
    pub scan_parameters: Vec<ScanParameter>,
}

impl Job {
    /// Create a job with default settings and no scan axes.
    pub fn new(experiment: ExperimentRef) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            created_at: now,
            experiment,
            status: JobStatus::Submitted,
            priority: Priority::default(),
            local_parameters_timestamp: now,
            repetitions: 1,
            shots: 50,
            parent_job: None,
            debug_mode: false,
            auto_calibration: false,
            scan_parameters: Vec::new(),
        }
    }

    /// Set the job priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the number of repetitions.
    pub fn with_repetitions(mut self, repetitions: u32) -> Self {
        self.repetitions = repetitions;
        self
    }

    /// Set the number of shots.
    pub fn with_shots(mut self, shots: u32) -> Self {
        self.shots = shots;
        self
    }

    /// Add a scan axis.
    pub fn with_scan_parameter(mut self, scan: ScanParameter) -> Self {
        self.scan_parameters.push(scan);
        self
    }

    /// Set the local-parameters timestamp.
    pub fn with_local_parameters_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.local_parameters_timestamp = timestamp;
        self
    }

    /// Mark as dry run.
    pub fn debug(mut self) -> Self {
        self.debug_mode = true;
        self
    }

    /// Check the submission invariants.
    pub fn validate(&self) -> SchedResult<()> {
        if self.repetitions == 0 {
            return Err(SchedError::Validation(
                "repetitions must be at least 1".to_string(),
            ));
        }
        if self.shots == 0 {
            return Err(SchedError::Validation("shots must be at least 1".to_string()));
        }
        if self.experiment.id.trim().is_empty() {
            return Err(SchedError::Validation(
                "experiment identifier must not be empty".to_string(),
            ));
        }
        for scan in &self.scan_parameters {
            scan.validate()?;
        }
        Ok(())
    }

    /// Whether the job has no scan axes and runs until cancelled.
    pub fn is_continuous(&self) -> bool {
        self.scan_parameters.is_empty()
    }

    /// Copy this job into a fresh submission that records its lineage.
    pub fn resubmission(&self) -> Job {
        let now = Utc::now();
        Job {
            id: JobId::new(),
            created_at: now,
            status: JobStatus::Submitted,
            parent_job: Some(self.id),
            ..self.clone()
        }
    }
}

fn default_priority() -> i64 {
    i64::from(Priority::LOWEST.value())
}

fn default_repetitions() -> u32 {
    1
}

fn default_shots() -> u32 {
    50
}

/// Client-facing job request, before validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSubmission {
    /// Experiment identifier.
    pub experiment_id: String,

    /// Scan axes.
    #[serde(default)]
    pub scan_parameters: Vec<ScanSpec>,

    /// Raw priority, validated into [`Priority`].
    #[serde(default = "default_priority")]
    pub priority: i64,

    /// Repetitions of the full combination set.
    #[serde(default = "default_repetitions")]
    pub repetitions: u32,

    /// Shots per data point.
    #[serde(default = "default_shots")]
    pub shots: u32,

    /// Local-parameters timestamp (defaults to submission time).
    #[serde(default)]
    pub local_parameters_timestamp: Option<DateTime<Utc>>,

    /// Source revision identifier.
    #[serde(default)]
    pub revision: Option<String>,

    /// Auto-calibration flag.
    #[serde(default)]
    pub auto_calibration: bool,

    /// Dry-run flag.
    #[serde(default)]
    pub debug_mode: bool,
}

impl JobSubmission {
    /// Create a request with defaults for `experiment_id`.
    pub fn new(experiment_id: impl Into<String>) -> Self {
        Self {
            experiment_id: experiment_id.into(),
            scan_parameters: Vec::new(),
            priority: default_priority(),
            repetitions: default_repetitions(),
            shots: default_shots(),
            local_parameters_timestamp: None,
            revision: None,
            auto_calibration: false,
            debug_mode: false,
        }
    }

    /// Add a scan axis.
    pub fn scan(mut self, spec: ScanSpec) -> Self {
        self.scan_parameters.push(spec);
        self
    }

    /// Set the raw priority.
    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    /// Set the number of repetitions.
    pub fn with_repetitions(mut self, repetitions: u32) -> Self {
        self.repetitions = repetitions;
        self
    }

    /// Set the number of shots.
    pub fn with_shots(mut self, shots: u32) -> Self {
        self.shots = shots;
        self
    }

    /// Pin local parameters to their values at `timestamp`.
    pub fn with_local_parameters_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.local_parameters_timestamp = Some(timestamp);
        self
    }

    /// Run as a dry run: results are logged, not archived.
    pub fn debug(mut self) -> Self {
        self.debug_mode = true;
        self
    }

    /// Validate the request and build the job.
    pub fn into_job(self) -> SchedResult<Job> {
        let priority = Priority::new(self.priority)?;
        let mut experiment = ExperimentRef::new(self.experiment_id);
        experiment.revision = self.revision;

        let mut job = Job::new(experiment)
            .with_priority(priority)
            .with_repetitions(self.repetitions)
            .with_shots(self.shots);
        if let Some(ts) = self.local_parameters_timestamp {
            job.local_parameters_timestamp = ts;
        }
        job.auto_calibration = self.auto_calibration;
        job.debug_mode = self.debug_mode;
        for spec in &self.scan_parameters {
            job.scan_parameters.push(spec.resolve()?);
        }
        job.validate()?;
        Ok(job)
    }
}

/// Filter for listing jobs.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    /// Filter by status.
    pub status: Option<Vec<JobStatus>>,

    /// Only jobs at least this urgent.
    pub max_priority: Option<Priority>,

    /// Maximum number of results.
    pub limit: Option<usize>,
}

impl JobFilter {
    /// Jobs waiting for the scheduler.
    pub fn submitted() -> Self {
        Self::default().with_status([JobStatus::Submitted])
    }

    /// Filter by status.
    pub fn with_status(mut self, status: impl IntoIterator<Item = JobStatus>) -> Self {
        self.status = Some(status.into_iter().collect());
        self
    }

    /// Limit results.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Check if a job matches this filter.
    pub fn matches(&self, job: &Job) -> bool {
        if let Some(ref statuses) = self.status {
            if !statuses.contains(&job.status) {
                return false;
            }
        }
        if let Some(max) = self.max_priority {
            if job.priority > max {
                return false;
            }
        }
        true
    }
}
