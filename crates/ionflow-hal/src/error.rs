//! Error types for the HAL crate.

use thiserror::Error;

/// Errors that can occur while talking to an external collaborator.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum HalError {
    /// Device is not known to the registry.
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Device could not be reached.
    #[error("Device {device} unavailable: {message}")]
    DeviceUnavailable { device: String, message: String },

    /// Device rejected a read or write.
    #[error("Device {device} access to '{path}' failed: {message}")]
    DeviceAccess {
        device: String,
        path: String,
        message: String,
    },

    /// Parameter store query failed.
    #[error("Parameter store error: {0}")]
    ParameterStore(String),

    /// Invalid parameter identifier or value.
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Sequence generation failed.
    #[error("Sequence generation failed: {0}")]
    SequenceGeneration(String),

    /// Hardware execution failed.
    #[error("Hardware execution failed: {0}")]
    Execution(String),

    /// Invalid number of shots.
    #[error("Invalid shots: {0}")]
    InvalidShots(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic backend error.
    #[error("Backend error: {0}")]
    Backend(String),
}

/// Result type for HAL operations.
pub type HalResult<T> = Result<T, HalError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = HalError::DeviceAccess {
            device: "rf_source".to_string(),
            path: "channel_1.frequency".to_string(),
            message: "timeout".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Device rf_source access to 'channel_1.frequency' failed: timeout"
        );

        let err = HalError::DeviceNotFound("awg".to_string());
        assert_eq!(err.to_string(), "Device not found: awg");
    }
}
