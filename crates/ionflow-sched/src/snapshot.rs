//! Parameter snapshots used to generate programs.
//!
//! A snapshot is the merged view of global and experiment-local parameters
//! at some point in time. Later sources override earlier ones:
//!
//! | precedence | source                    |
//! |------------|---------------------------|
//! | lowest     | previous snapshot         |
//! |            | global parameters         |
//! | highest    | local parameters          |
//!
//! Calibration results are merged on top without querying the store.

use chrono::{DateTime, Utc};
use ionflow_hal::{ParameterMap, ParameterSource};

use crate::error::SchedResult;
use crate::job::{Job, JobId};

/// Which parameter versions a refresh pulls.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum RefreshMode {
    /// Latest globals and latest locals.
    AllLatest,
    /// Globals and locals as of the job's local-parameters timestamp.
    AllAtJobTimestamp,
    /// Locals as of the job's timestamp, latest globals.
    #[default]
    LocalsAtJobTimestamp,
    /// Merge explicit values without querying.
    Merge(ParameterMap),
}

/// Notification delivered to pre-processing workers mid-run.
#[derive(Debug, Clone, PartialEq)]
pub enum ParameterUpdate {
    /// Parameters changed in the store; re-query everything at latest.
    UpdateParameters {
        /// Only the run of this job refreshes; `None` means every run.
        job_id: Option<JobId>,
    },
    /// Calibration produced new values; merge them as-is.
    Calibration {
        /// Calibrated values keyed by parameter key.
        values: ParameterMap,
    },
}

impl ParameterUpdate {
    /// Refresh to apply for a run of `job_id`, or `None` if not addressed to it.
    pub fn refresh_for(&self, job_id: JobId) -> Option<RefreshMode> {
        match self {
            ParameterUpdate::UpdateParameters { job_id: Some(target) } if *target != job_id => {
                None
            }
            ParameterUpdate::UpdateParameters { .. } => Some(RefreshMode::AllLatest),
            ParameterUpdate::Calibration { values } => Some(RefreshMode::Merge(values.clone())),
        }
    }
}

/// Resolved parameter values plus a change counter.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    values: ParameterMap,
    generation: u64,
    resolved_at: DateTime<Utc>,
}

impl Snapshot {
    /// An empty snapshot at generation 0.
    pub fn empty() -> Self {
        Self {
            values: ParameterMap::new(),
            generation: 0,
            resolved_at: Utc::now(),
        }
    }

    /// Resolved values.
    pub fn values(&self) -> &ParameterMap {
        &self.values
    }

    /// Incremented every time the values change.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// When the snapshot was last refreshed.
    pub fn resolved_at(&self) -> DateTime<Utc> {
        self.resolved_at
    }

    /// Snapshot values with `overrides` applied on top.
    pub fn with_overrides(&self, overrides: &ParameterMap) -> ParameterMap {
        let mut merged = self.values.clone();
        merged.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
        merged
    }

    /// Refresh the snapshot for `job`.
    ///
    /// Returns whether any value changed.
    pub async fn refresh(
        &mut self,
        source: &dyn ParameterSource,
        job: &Job,
        mode: RefreshMode,
    ) -> SchedResult<bool> {
        let timestamp = Some(job.local_parameters_timestamp);
        let namespace = job.experiment.namespace();

        let layers = match mode {
            RefreshMode::Merge(values) => vec![values],
            RefreshMode::AllLatest => vec![
                source.global_parameters(None).await?,
                source.local_parameters(namespace, None).await?,
            ],
            RefreshMode::AllAtJobTimestamp => vec![
                source.global_parameters(timestamp).await?,
                source.local_parameters(namespace, timestamp).await?,
            ],
            RefreshMode::LocalsAtJobTimestamp => vec![
                source.global_parameters(None).await?,
                source.local_parameters(namespace, timestamp).await?,
            ],
        };

        let mut merged = self.values.clone();
        for layer in layers {
            merged.extend(layer);
        }

        self.resolved_at = Utc::now();
        if merged == self.values {
            return Ok(false);
        }
        self.values = merged;
        self.generation += 1;
        Ok(true)
    }
}

impl Default for Snapshot {
    fn default() -> Self {
        Self::empty()
    }
}
