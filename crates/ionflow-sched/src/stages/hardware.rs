//! Hardware processing: applies scan values and executes programs.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use ionflow_hal::{
    DeviceClient, DeviceInfo, DeviceRegistry, HalError, HardwareBackend, ParameterId,
    ParameterSource, ParameterValue,
};
use tokio::sync::OwnedMutexGuard;
use tokio_util::sync::CancellationToken;

use crate::control::JobController;
use crate::error::{SchedError, SchedResult};
use crate::queue::TaskQueue;
use crate::run::{RunId, RunStatus};
use crate::scan::combination_map;
use crate::stages::next_task;
use crate::task::{DataPoint, HardwareTask, PostProcessingTask};

/// One async lock per device name.
///
/// Held across a whole write/verify sequence so two hardware workers never
/// interleave writes on the same device.
#[derive(Debug, Default)]
pub struct DeviceLocks {
    locks: Mutex<rustc_hash::FxHashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl DeviceLocks {
    /// Create an empty lock table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `device`.
    pub async fn acquire(&self, device: &str) -> SchedResult<OwnedMutexGuard<()>> {
        let lock = {
            let mut locks = self
                .locks
                .lock()
                .map_err(|e| SchedError::Persistence(e.to_string()))?;
            Arc::clone(locks.entry(device.to_string()).or_default())
        };
        Ok(lock.lock_owned().await)
    }
}

/// Worker of the hardware stage.
pub struct HardwareWorker {
    id: usize,
    controller: JobController,
    registry: Arc<dyn DeviceRegistry>,
    devices: Arc<dyn DeviceClient>,
    parameters: Arc<dyn ParameterSource>,
    backend: Arc<dyn HardwareBackend>,
    input: Arc<TaskQueue<HardwareTask>>,
    output: Arc<TaskQueue<PostProcessingTask>>,
    device_locks: Option<Arc<DeviceLocks>>,
    poll_timeout: Duration,
}

impl HardwareWorker {
    /// Create a worker.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: usize,
        controller: JobController,
        registry: Arc<dyn DeviceRegistry>,
        devices: Arc<dyn DeviceClient>,
        parameters: Arc<dyn ParameterSource>,
        backend: Arc<dyn HardwareBackend>,
        input: Arc<TaskQueue<HardwareTask>>,
        output: Arc<TaskQueue<PostProcessingTask>>,
    ) -> Self {
        Self {
            id,
            controller,
            registry,
            devices,
            parameters,
            backend,
            input,
            output,
            device_locks: None,
            poll_timeout: Duration::from_millis(200),
        }
    }

    /// Serialize device writes through a shared lock table.
    pub fn with_device_locks(mut self, locks: Arc<DeviceLocks>) -> Self {
        self.device_locks = Some(locks);
        self
    }

    /// Set how long an idle worker waits before checking for shutdown.
    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    /// Consume tasks until shutdown.
    pub async fn run(self, shutdown: CancellationToken) {
        tracing::debug!(worker = self.id, backend = self.backend.name(), "Hardware worker started");
        while let Some(task) = next_task(&self.input, self.poll_timeout, &shutdown).await {
            self.process(task).await;
        }
        tracing::debug!(worker = self.id, "Hardware worker stopped");
    }

    /// Process one data point. Always signals completion.
    async fn process(&self, task: HardwareTask) {
        let succeeded = match self.controller.is_aborted(&task.run_id).await {
            Ok(true) => {
                tracing::debug!(
                    worker = self.id,
                    run_id = %task.run_id,
                    index = task.index,
                    "Skipping data point of aborted run"
                );
                false
            }
            Ok(false) => self.execute_and_forward(&task).await,
            Err(e) => {
                self.fail_run(&task.run_id, &e).await;
                false
            }
        };
        task.signal_done(succeeded);
    }

    async fn execute_and_forward(&self, task: &HardwareTask) -> bool {
        let data_point = match self.execute(task).await {
            Ok(data_point) => data_point,
            Err(e) => {
                self.fail_run(&task.run_id, &e).await;
                return false;
            }
        };

        let forwarded = self.output.put(PostProcessingTask {
            priority: task.job.priority,
            run_id: task.run_id,
            job_id: task.job_id(),
            scheduled_time: task.scheduled_time,
            dry_run: task.job.debug_mode,
            data_point,
            archive_receipt: task.archive_receipt.clone(),
        });
        match forwarded {
            Ok(()) => true,
            Err(e) => {
                self.fail_run(&task.run_id, &e).await;
                false
            }
        }
    }

    async fn execute(&self, task: &HardwareTask) -> SchedResult<DataPoint> {
        for (parameter, value) in &task.combination {
            match parameter {
                ParameterId::DeviceScoped { device, path } => {
                    self.apply_device_value(&task.run_id, device, path, value)
                        .await?;
                }
                ParameterId::Shared { id } => {
                    self.parameters.set_shared(id, value).await?;
                }
            }
        }

        let channels = self.backend.execute(&task.program, task.job.shots).await?;
        tracing::debug!(
            worker = self.id,
            run_id = %task.run_id,
            index = task.index,
            "Executed data point"
        );

        Ok(DataPoint {
            index: task.index,
            scan_values: combination_map(&task.combination),
            timestamp: Utc::now(),
            channels,
        })
    }

    /// Write `value` and read it back until it sticks or the budget runs out.
    async fn apply_device_value(
        &self,
        run_id: &RunId,
        device: &str,
        path: &str,
        value: &ParameterValue,
    ) -> SchedResult<()> {
        let info = self
            .registry
            .device(device)
            .await?
            .ok_or_else(|| HalError::DeviceNotFound(device.to_string()))?;
        if !info.is_enabled() {
            return Err(SchedError::DeviceDisabled(device.to_string()));
        }

        let _guard = match self.device_locks {
            Some(ref locks) => Some(locks.acquire(device).await?),
            None => None,
        };

        let attempts = info.retry_attempts.max(1);
        for attempt in 1..=attempts {
            if self.controller.is_aborted(run_id).await? {
                return Err(SchedError::Cancelled(run_id.to_string()));
            }

            match self.write_verified(&info, path, value).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_recoverable_device() => {
                    tracing::warn!(
                        worker = self.id,
                        run_id = %run_id,
                        device,
                        path,
                        attempt,
                        "Device write not verified: {}",
                        e
                    );
                    if attempt < attempts {
                        tokio::time::sleep(info.retry_delay).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }

        Err(SchedError::DeviceVerificationFailed {
            device: device.to_string(),
            path: path.to_string(),
            attempts,
        })
    }

    async fn write_verified(
        &self,
        info: &DeviceInfo,
        path: &str,
        value: &ParameterValue,
    ) -> SchedResult<()> {
        self.devices.write(info, path, value).await?;
        let read = self.devices.read(info, path).await?;
        if value.matches(&read) {
            Ok(())
        } else {
            Err(SchedError::DeviceMismatch {
                device: info.name.clone(),
                path: path.to_string(),
                written: value.to_string(),
                read: read.to_string(),
            })
        }
    }

    async fn fail_run(&self, run_id: &RunId, error: &SchedError) {
        tracing::warn!(worker = self.id, run_id = %run_id, "Data point failed: {}", error);
        let log = error.to_string();
        if let Err(e) = self
            .controller
            .set_run_status(run_id, RunStatus::Failed, Some(log.as_str()))
            .await
        {
            tracing::error!(run_id = %run_id, "Failed to mark run failed: {}", e);
        }
    }
}
