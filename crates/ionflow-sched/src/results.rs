//! Result archival.
//!
//! Each run owns one result file named after its scheduled time. Data points
//! are appended as they come out of the hardware stage, one JSON object per
//! line.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::error::{SchedError, SchedResult};
use crate::run::result_key;
use crate::task::DataPoint;

/// Durable storage for captured data points.
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Append a data point to the run scheduled at `scheduled_time`.
    async fn append(&self, scheduled_time: DateTime<Utc>, data_point: &DataPoint)
        -> SchedResult<()>;

    /// Load every data point of a run in append order.
    async fn load(&self, scheduled_time: DateTime<Utc>) -> SchedResult<Vec<DataPoint>>;
}

type RunLock = Arc<tokio::sync::Mutex<()>>;

/// JSON-lines result store.
///
/// Appends to the same run are serialized; appends to different runs run
/// concurrently.
pub struct JsonlResultStore {
    /// Base directory for result files.
    base_dir: PathBuf,

    /// One lock per result file.
    locks: Mutex<rustc_hash::FxHashMap<String, RunLock>>,
}

impl JsonlResultStore {
    /// Create a store writing below `base_dir`.
    pub async fn new(base_dir: impl AsRef<Path>) -> SchedResult<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        fs::create_dir_all(&base_dir).await?;
        Ok(Self {
            base_dir,
            locks: Mutex::new(rustc_hash::FxHashMap::default()),
        })
    }

    /// Create a store in a fresh temporary directory.
    pub async fn temp() -> SchedResult<Self> {
        let dir = std::env::temp_dir().join(format!("ionflow-results-{}", uuid::Uuid::new_v4()));
        Self::new(dir).await
    }

    /// Base directory of this store.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Path of the result file for a run.
    pub fn path_for(&self, scheduled_time: DateTime<Utc>) -> PathBuf {
        self.base_dir.join(format!("{}.jsonl", result_key(scheduled_time)))
    }

    fn lock_for(&self, key: &str) -> SchedResult<RunLock> {
        let mut locks = self
            .locks
            .lock()
            .map_err(|e| SchedError::Persistence(e.to_string()))?;
        Ok(Arc::clone(locks.entry(key.to_string()).or_default()))
    }

    /// Drop the table entry for `key` unless another append holds it.
    fn release(&self, key: &str, lock: RunLock) -> SchedResult<()> {
        let mut locks = self
            .locks
            .lock()
            .map_err(|e| SchedError::Persistence(e.to_string()))?;
        // One reference in the table, one here.
        if Arc::strong_count(&lock) == 2 {
            locks.remove(key);
        }
        Ok(())
    }
}

impl JsonlResultStore {
    async fn write_line(&self, scheduled_time: DateTime<Utc>, line: &[u8]) -> SchedResult<()> {
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path_for(scheduled_time))
            .await?;
        file.write_all(line).await?;
        file.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl ResultStore for JsonlResultStore {
    async fn append(
        &self,
        scheduled_time: DateTime<Utc>,
        data_point: &DataPoint,
    ) -> SchedResult<()> {
        let mut line = serde_json::to_vec(data_point)?;
        line.push(b'\n');

        let key = result_key(scheduled_time);
        let lock = self.lock_for(&key)?;
        let written = {
            let _guard = lock.lock().await;
            self.write_line(scheduled_time, &line).await
        };
        self.release(&key, lock)?;
        written
    }

    async fn load(&self, scheduled_time: DateTime<Utc>) -> SchedResult<Vec<DataPoint>> {
        let path = self.path_for(scheduled_time);
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(SchedError::from))
            .collect()
    }
}
