//! Transient tasks passed between pipeline stages.
//!
//! Tasks live only in queues and in the worker that dequeued them; they are
//! never persisted.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use ionflow_hal::{ChannelData, ParameterMap};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::job::{Job, JobId, Priority};
use crate::run::{JobRun, RunId};
use crate::scan::Combination;

/// Anything that can be ordered in a [`crate::queue::TaskQueue`].
pub trait Prioritized {
    /// Priority of the originating job.
    fn priority(&self) -> Priority;
}

/// Work item for the pre-processing stage: one run to expand.
#[derive(Debug, Clone)]
pub struct PreProcessingTask {
    /// Job being run.
    pub job: Job,
    /// Run created by the scheduler.
    pub run: JobRun,
}

impl Prioritized for PreProcessingTask {
    fn priority(&self) -> Priority {
        self.job.priority
    }
}

/// Signal sent back to the pre-processing worker when a hardware task ends.
#[derive(Debug, Clone)]
pub struct DataPointDone {
    /// Data-point index.
    pub index: usize,
    /// Snapshot generation the task was issued with.
    pub snapshot_generation: u64,
    /// Program the task carried.
    pub program: Arc<str>,
    /// Whether the data point produced a result.
    pub succeeded: bool,
}

/// Signal sent back to the pre-processing worker once post-processing is
/// finished with a data point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataPointArchived {
    /// Data-point index.
    pub index: usize,
    /// Whether the payload reached the result store (or was logged in a dry run).
    pub archived: bool,
}

/// Work item for the hardware stage: one data point.
#[derive(Debug, Clone)]
pub struct HardwareTask {
    /// Job being run.
    pub job: Arc<Job>,
    /// Run this data point belongs to.
    pub run_id: RunId,
    /// Archival key of the run.
    pub scheduled_time: DateTime<Utc>,
    /// Data-point index within the run.
    pub index: usize,
    /// Scan values for this point. Empty in continuous mode.
    pub combination: Combination,
    /// Generation of the snapshot the program was built from.
    pub snapshot_generation: u64,
    /// When that snapshot was resolved.
    pub snapshot_timestamp: DateTime<Utc>,
    /// Generated program.
    pub program: Arc<str>,
    /// Completion channel of the issuing pre-processing worker.
    pub completion: mpsc::UnboundedSender<DataPointDone>,
    /// Where post-processing reports the archived point. Set in regular mode.
    pub archive_receipt: Option<mpsc::UnboundedSender<DataPointArchived>>,
}

impl HardwareTask {
    /// Job the data point belongs to.
    pub fn job_id(&self) -> JobId {
        self.job.id
    }

    /// Report completion to the issuing worker.
    ///
    /// The receiver may be gone if the worker already finished the run.
    pub fn signal_done(&self, succeeded: bool) {
        let _ = self.completion.send(DataPointDone {
            index: self.index,
            snapshot_generation: self.snapshot_generation,
            program: Arc::clone(&self.program),
            succeeded,
        });
    }
}

impl Prioritized for HardwareTask {
    fn priority(&self) -> Priority {
        self.job.priority
    }
}

/// Captured result of one data point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    /// Data-point index within the run.
    pub index: usize,
    /// Scan values used, keyed by parameter key.
    pub scan_values: ParameterMap,
    /// Capture time.
    pub timestamp: DateTime<Utc>,
    /// Channel data from the hardware.
    #[serde(flatten)]
    pub channels: ChannelData,
}

/// Work item for the post-processing stage: one result to persist.
#[derive(Debug, Clone)]
pub struct PostProcessingTask {
    /// Priority of the originating job.
    pub priority: Priority,
    /// Run the result belongs to.
    pub run_id: RunId,
    /// Owning job.
    pub job_id: JobId,
    /// Archival key of the run.
    pub scheduled_time: DateTime<Utc>,
    /// Dry run: log the payload instead of archiving it.
    pub dry_run: bool,
    /// Captured payload.
    pub data_point: DataPoint,
    /// Receipt channel of the issuing pre-processing worker, if it waits.
    pub archive_receipt: Option<mpsc::UnboundedSender<DataPointArchived>>,
}

impl PostProcessingTask {
    /// Report the outcome to the issuing worker, if it asked for one.
    pub fn acknowledge(&self, archived: bool) {
        if let Some(receipt) = &self.archive_receipt {
            let _ = receipt.send(DataPointArchived {
                index: self.data_point.index,
                archived,
            });
        }
    }
}

impl Prioritized for PostProcessingTask {
    fn priority(&self) -> Priority {
        self.priority
    }
}
