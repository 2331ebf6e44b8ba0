//! Simulated device bank.

use std::sync::Mutex;

use async_trait::async_trait;
use ionflow_hal::{
    DeviceClient, DeviceInfo, DeviceRegistry, HalError, HalResult, ParameterValue,
};
use rustc_hash::FxHashMap;
use tracing::{debug, instrument};

/// How a device path misbehaves on read-back.
#[derive(Debug, Clone, Copy)]
enum Fault {
    /// Every read returns a value different from the last write.
    Mismatch,
    /// The next `n` reads mismatch, then reads are correct.
    Flaky(u32),
}

#[derive(Debug, Default)]
struct BankState {
    values: FxHashMap<(String, String), ParameterValue>,
    writes: Vec<(String, String, ParameterValue)>,
    reads: usize,
    faults: FxHashMap<(String, String), Fault>,
}

/// A set of simulated devices that remember written values.
///
/// Serves both as the device registry and as the device client.
#[derive(Debug, Default)]
pub struct SimDeviceBank {
    devices: FxHashMap<String, DeviceInfo>,
    state: Mutex<BankState>,
}

impl SimDeviceBank {
    /// Create a bank with no devices.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a device.
    pub fn with_device(mut self, info: DeviceInfo) -> Self {
        self.devices.insert(info.name.clone(), info);
        self
    }

    /// Make every read-back of `device`/`path` disagree with the write.
    pub fn with_mismatch(self, device: impl Into<String>, path: impl Into<String>) -> Self {
        self.with_fault(device.into(), path.into(), Fault::Mismatch)
    }

    /// Make the next `failures` read-backs of `device`/`path` disagree.
    pub fn with_flaky(
        self,
        device: impl Into<String>,
        path: impl Into<String>,
        failures: u32,
    ) -> Self {
        self.with_fault(device.into(), path.into(), Fault::Flaky(failures))
    }

    fn with_fault(self, device: String, path: String, fault: Fault) -> Self {
        self.lock().faults.insert((device, path), fault);
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BankState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Current value at `device`/`path`.
    pub fn value(&self, device: &str, path: &str) -> Option<ParameterValue> {
        self.lock()
            .values
            .get(&(device.to_string(), path.to_string()))
            .cloned()
    }

    /// Every write in order, as `(device, path, value)`.
    pub fn writes(&self) -> Vec<(String, String, ParameterValue)> {
        self.lock().writes.clone()
    }

    /// Number of writes.
    pub fn write_count(&self) -> usize {
        self.lock().writes.len()
    }

    /// Number of read-backs.
    pub fn read_count(&self) -> usize {
        self.lock().reads
    }
}

/// A value guaranteed not to match `value`.
fn corrupted(value: &ParameterValue) -> ParameterValue {
    match value {
        ParameterValue::Bool(b) => ParameterValue::Bool(!b),
        ParameterValue::Int(i) => ParameterValue::Int(i.wrapping_add(1)),
        ParameterValue::Float(f) => ParameterValue::Float(f + 1.0 + f.abs()),
        ParameterValue::Text(s) => ParameterValue::Text(format!("{s}~")),
    }
}

#[async_trait]
impl DeviceRegistry for SimDeviceBank {
    async fn device(&self, name: &str) -> HalResult<Option<DeviceInfo>> {
        Ok(self.devices.get(name).cloned())
    }
}

#[async_trait]
impl DeviceClient for SimDeviceBank {
    #[instrument(skip(self, device), fields(device = %device.name))]
    async fn write(&self, device: &DeviceInfo, path: &str, value: &ParameterValue) -> HalResult<()> {
        if !self.devices.contains_key(&device.name) {
            return Err(HalError::DeviceNotFound(device.name.clone()));
        }
        let mut state = self.lock();
        state
            .values
            .insert((device.name.clone(), path.to_string()), value.clone());
        state
            .writes
            .push((device.name.clone(), path.to_string(), value.clone()));
        debug!("Wrote {}", value);
        Ok(())
    }

    async fn read(&self, device: &DeviceInfo, path: &str) -> HalResult<ParameterValue> {
        let key = (device.name.clone(), path.to_string());
        let mut state = self.lock();
        state.reads += 1;

        let value = state.values.get(&key).cloned().ok_or_else(|| HalError::DeviceAccess {
            device: device.name.clone(),
            path: path.to_string(),
            message: "no value written".to_string(),
        })?;

        match state.faults.get(&key).copied() {
            Some(Fault::Mismatch) => Ok(corrupted(&value)),
            Some(Fault::Flaky(n)) if n > 0 => {
                state.faults.insert(key, Fault::Flaky(n - 1));
                Ok(corrupted(&value))
            }
            _ => Ok(value),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rf() -> DeviceInfo {
        DeviceInfo::new("rf", "tcp://rf")
    }

    #[tokio::test]
    async fn test_write_read_back() {
        let bank = SimDeviceBank::new().with_device(rf());
        let info = bank.device("rf").await.unwrap().unwrap();
        bank.write(&info, "freq", &ParameterValue::Float(1.5)).await.unwrap();
        assert_eq!(bank.read(&info, "freq").await.unwrap(), ParameterValue::Float(1.5));
        assert_eq!(bank.value("rf", "freq"), Some(ParameterValue::Float(1.5)));
        assert_eq!(bank.write_count(), 1);
        assert!(bank.device("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_mismatch_and_flaky() {
        let bank = SimDeviceBank::new()
            .with_device(rf())
            .with_mismatch("rf", "freq")
            .with_flaky("rf", "amp", 1);
        let info = rf();
        let value = ParameterValue::Float(2.0);

        bank.write(&info, "freq", &value).await.unwrap();
        for _ in 0..3 {
            assert!(!value.matches(&bank.read(&info, "freq").await.unwrap()));
        }

        bank.write(&info, "amp", &value).await.unwrap();
        assert!(!value.matches(&bank.read(&info, "amp").await.unwrap()));
        assert!(value.matches(&bank.read(&info, "amp").await.unwrap()));
    }

    #[tokio::test]
    async fn test_unknown_device_rejected() {
        let bank = SimDeviceBank::new();
        let err = bank
            .write(&rf(), "freq", &ParameterValue::Int(1))
            .await
            .unwrap_err();
        assert!(matches!(err, HalError::DeviceNotFound(_)));
    }

    #[test]
    fn test_corrupted_never_matches() {
        for value in [
            ParameterValue::Bool(true),
            ParameterValue::Int(i64::MAX),
            ParameterValue::Float(-3.0),
            ParameterValue::Float(0.0),
            ParameterValue::Text(String::new()),
        ] {
            assert!(!value.matches(&corrupted(&value)));
        }
    }
}
