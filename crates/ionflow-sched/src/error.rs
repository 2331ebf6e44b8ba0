//! Error handling for the scheduler and pipeline stages.

use thiserror::Error;

/// Result type for scheduler operations.
pub type SchedResult<T> = Result<T, SchedError>;

/// Errors that can occur during scheduling and execution.
#[derive(Error, Debug)]
pub enum SchedError {
    /// Submission rejected before entering the pipeline.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Job not found in the store.
    #[error("Job not found: {0}")]
    JobNotFound(String),

    /// Run not found in the store.
    #[error("Run not found: {0}")]
    RunNotFound(String),

    /// Requested status change violates the state machine.
    #[error("Invalid transition for {entity}: {from} -> {to}")]
    InvalidTransition {
        entity: String,
        from: String,
        to: String,
    },

    /// A single write/read-back mismatch. Retried by the hardware stage.
    #[error("Device {device} readback mismatch on '{path}': wrote {written}, read {read}")]
    DeviceMismatch {
        device: String,
        path: String,
        written: String,
        read: String,
    },

    /// Device is administratively disabled.
    #[error("Device {0} is disabled")]
    DeviceDisabled(String),

    /// Write verification failed on every attempt.
    #[error("Failed to set '{path}' on device {device} after {attempts} attempts")]
    DeviceVerificationFailed {
        device: String,
        path: String,
        attempts: u32,
    },

    /// Collaborator error during execution.
    #[error("Backend error: {0}")]
    Backend(#[from] ionflow_hal::HalError),

    /// Persistence error.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// SQLite database error.
    #[error("Database error: {0}")]
    Database(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Run was cancelled while work was in progress.
    #[error("Run cancelled: {0}")]
    Cancelled(String),

    /// A queue or channel closed underneath a worker.
    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    /// A data point ended without a result and without failing its run.
    #[error("Data point {index} of run {run} produced no result")]
    DataPointLost { run: String, index: usize },
}

impl SchedError {
    /// Whether the error rejects a submission.
    pub fn is_validation(&self) -> bool {
        matches!(self, SchedError::Validation(_))
    }

    /// Whether the error ends a run without automatic retry.
    pub fn is_unrecoverable_device(&self) -> bool {
        matches!(
            self,
            SchedError::DeviceDisabled(_) | SchedError::DeviceVerificationFailed { .. }
        )
    }

    /// Whether the error is worth another local attempt.
    pub fn is_recoverable_device(&self) -> bool {
        matches!(
            self,
            SchedError::DeviceMismatch { .. }
                | SchedError::Backend(
                    ionflow_hal::HalError::DeviceAccess { .. }
                        | ionflow_hal::HalError::DeviceUnavailable { .. }
                )
        )
    }
}

impl From<rusqlite::Error> for SchedError {
    fn from(e: rusqlite::Error) -> Self {
        SchedError::Database(e.to_string())
    }
}

impl From<serde_yaml_ng::Error> for SchedError {
    fn from(e: serde_yaml_ng::Error) -> Self {
        SchedError::Config(e.to_string())
    }
}
