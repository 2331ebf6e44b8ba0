//! External devices and their registry.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::HalResult;
use crate::parameter::ParameterValue;

/// Administrative status of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    /// Device accepts writes.
    #[default]
    Enabled,
    /// Device is switched off by an operator; any write is refused.
    Disabled,
}

/// Registry record for a controllable device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Unique device name.
    pub name: String,
    /// Network address of the device controller.
    pub url: String,
    /// Administrative status.
    #[serde(default)]
    pub status: DeviceStatus,
    /// Number of write/verify attempts before giving up.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    /// Delay between two write/verify attempts.
    #[serde(default = "default_retry_delay")]
    pub retry_delay: Duration,
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_delay() -> Duration {
    Duration::from_millis(100)
}

impl DeviceInfo {
    /// Create an enabled device with the default retry policy.
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            status: DeviceStatus::Enabled,
            retry_attempts: default_retry_attempts(),
            retry_delay: default_retry_delay(),
        }
    }

    /// Set the retry policy.
    pub fn with_retry(mut self, attempts: u32, delay: Duration) -> Self {
        self.retry_attempts = attempts;
        self.retry_delay = delay;
        self
    }

    /// Mark the device disabled.
    pub fn disabled(mut self) -> Self {
        self.status = DeviceStatus::Disabled;
        self
    }

    /// Whether the device accepts writes.
    pub fn is_enabled(&self) -> bool {
        self.status == DeviceStatus::Enabled
    }
}

/// Lookup of device records by name.
#[async_trait]
pub trait DeviceRegistry: Send + Sync {
    /// Resolve a device by name. Returns `None` for unknown devices.
    async fn device(&self, name: &str) -> HalResult<Option<DeviceInfo>>;
}

/// Read/write access to device parameters.
///
/// Implementations perform a single attempt; retry and verification are
/// handled by the caller.
#[async_trait]
pub trait DeviceClient: Send + Sync {
    /// Write `value` to the parameter at `path` on `device`.
    async fn write(&self, device: &DeviceInfo, path: &str, value: &ParameterValue)
        -> HalResult<()>;

    /// Read the parameter at `path` on `device`.
    async fn read(&self, device: &DeviceInfo, path: &str) -> HalResult<ParameterValue>;
}
