//! Pipeline configuration.
//!
//! Loaded from YAML with every field optional; environment variables with
//! the `IONFLOW_` prefix override file values.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{SchedError, SchedResult};

/// Configuration of the scheduler and the three stage pools.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Scheduler polling interval in milliseconds.
    pub poll_interval_ms: u64,

    /// Number of pre-processing workers.
    pub pre_processing_workers: usize,

    /// Number of hardware workers.
    pub hardware_workers: usize,

    /// Number of post-processing workers.
    pub post_processing_workers: usize,

    /// Data points kept in flight per continuous run.
    pub pipeline_depth: usize,

    /// How long an idle worker waits on its queue before checking for shutdown.
    pub queue_poll_timeout_ms: u64,

    /// Hold a per-device lock across each write/verify sequence.
    pub serialize_device_writes: bool,

    /// Directory for the state database and result files.
    pub state_dir: PathBuf,
}

fn default_state_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("IONFLOW_STATE_DIR") {
        return PathBuf::from(dir);
    }
    dirs::runtime_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("ionflow")
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            pre_processing_workers: 2,
            hardware_workers: 1,
            post_processing_workers: 2,
            pipeline_depth: 2,
            queue_poll_timeout_ms: 200,
            serialize_device_writes: false,
            state_dir: default_state_dir(),
        }
    }
}

impl PipelineConfig {
    /// Parse and validate a YAML document.
    pub fn from_yaml(contents: &str) -> SchedResult<Self> {
        let config: PipelineConfig = serde_yaml_ng::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> SchedResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            SchedError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_yaml(&contents)
    }

    /// Load from an optional file, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> SchedResult<Self> {
        let config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        let config = config.merge_env();
        config.validate()?;
        Ok(config)
    }

    /// Apply `IONFLOW_*` environment overrides.
    ///
    /// Unset or unparsable variables leave the field unchanged.
    pub fn merge_env(mut self) -> Self {
        fn parsed<T: std::str::FromStr>(name: &str) -> Option<T> {
            std::env::var(name).ok().and_then(|v| v.parse().ok())
        }

        if let Some(v) = parsed("IONFLOW_POLL_INTERVAL_MS") {
            self.poll_interval_ms = v;
        }
        if let Some(v) = parsed("IONFLOW_PRE_WORKERS") {
            self.pre_processing_workers = v;
        }
        if let Some(v) = parsed("IONFLOW_HARDWARE_WORKERS") {
            self.hardware_workers = v;
        }
        if let Some(v) = parsed("IONFLOW_POST_WORKERS") {
            self.post_processing_workers = v;
        }
        if let Some(v) = parsed("IONFLOW_PIPELINE_DEPTH") {
            self.pipeline_depth = v;
        }
        if let Some(v) = parsed("IONFLOW_SERIALIZE_DEVICE_WRITES") {
            self.serialize_device_writes = v;
        }
        if let Ok(v) = std::env::var("IONFLOW_STATE_DIR") {
            self.state_dir = PathBuf::from(v);
        }
        self
    }

    /// Validate configuration values.
    pub fn validate(&self) -> SchedResult<()> {
        let counts = [
            ("pre_processing_workers", self.pre_processing_workers),
            ("hardware_workers", self.hardware_workers),
            ("post_processing_workers", self.post_processing_workers),
            ("pipeline_depth", self.pipeline_depth),
        ];
        for (name, value) in counts {
            if value == 0 {
                return Err(SchedError::Config(format!("{name} must be at least 1")));
            }
        }
        if self.poll_interval_ms == 0 {
            return Err(SchedError::Config(
                "poll_interval_ms must be at least 1".to_string(),
            ));
        }
        if self.queue_poll_timeout_ms == 0 {
            return Err(SchedError::Config(
                "queue_poll_timeout_ms must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Scheduler polling interval.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Queue wait before a worker re-checks for shutdown.
    pub fn queue_poll_timeout(&self) -> Duration {
        Duration::from_millis(self.queue_poll_timeout_ms)
    }

    /// Path of the SQLite state database.
    pub fn database_path(&self) -> PathBuf {
        self.state_dir.join("ionflow.db")
    }

    /// Directory holding per-run result files.
    pub fn results_dir(&self) -> PathBuf {
        self.state_dir.join("results")
    }

    /// Set worker counts for all three stages.
    pub fn with_workers(mut self, pre: usize, hardware: usize, post: usize) -> Self {
        self.pre_processing_workers = pre;
        self.hardware_workers = hardware;
        self.post_processing_workers = post;
        self
    }

    /// Set the scheduler polling interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = interval.as_millis().max(1) as u64;
        self
    }

    /// Set the continuous pipeline depth.
    pub fn with_pipeline_depth(mut self, depth: usize) -> Self {
        self.pipeline_depth = depth;
        self
    }

    /// Set the state directory.
    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = dir.into();
        self
    }
}
