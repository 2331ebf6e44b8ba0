//! Shared helpers for CLI commands.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use console::{StyledObject, style};
use serde::Deserialize;

use ionflow_hal::{DeviceInfo, ParameterMap};
use ionflow_sched::{
    EventBus, JobController, JobId, JobSubmission, PipelineConfig, RunStatus, SqliteStore,
};

/// Load the pipeline configuration and make sure the state directory exists.
pub fn load_config(path: Option<&Path>) -> Result<PipelineConfig> {
    let config = PipelineConfig::load(path)
        .map_err(|e| anyhow::anyhow!("Failed to load configuration: {e}"))?;
    fs::create_dir_all(&config.state_dir).with_context(|| {
        format!(
            "Failed to create state directory: {}",
            config.state_dir.display()
        )
    })?;
    Ok(config)
}

/// Open the state database named by the configuration.
pub fn open_store(config: &PipelineConfig) -> Result<Arc<SqliteStore>> {
    let db_path = config.database_path();
    let store = SqliteStore::new(&db_path).map_err(|e| {
        anyhow::anyhow!("Failed to open state store at {}: {}", db_path.display(), e)
    })?;
    Ok(Arc::new(store))
}

/// Controller over the configured state database.
///
/// Used by the commands that do not run the pipeline; its events go nowhere.
pub fn create_controller(path: Option<&Path>) -> Result<JobController> {
    let config = load_config(path)?;
    let store = open_store(&config)?;
    Ok(JobController::new(store, EventBus::new()))
}

/// Parse a job ID argument.
pub fn parse_job_id(job_id: &str) -> Result<JobId> {
    JobId::parse(job_id).map_err(|e| anyhow::anyhow!("Invalid job ID '{job_id}': {e}"))
}

/// Load a job submission from a YAML or JSON file.
pub fn load_submission(path: &Path) -> Result<JobSubmission> {
    let source = fs::read_to_string(path)
        .with_context(|| format!("Failed to read file: {}", path.display()))?;
    parse_submission(&source, path.extension().and_then(|e| e.to_str()).unwrap_or(""))
}

/// Parse a job submission; `json` extension selects JSON, anything else YAML.
pub fn parse_submission(source: &str, extension: &str) -> Result<JobSubmission> {
    match extension.to_lowercase().as_str() {
        "json" => serde_json::from_str(source).map_err(|e| anyhow::anyhow!("Parse error: {e}")),
        _ => serde_yaml_ng::from_str(source).map_err(|e| anyhow::anyhow!("Parse error: {e}")),
    }
}

/// Simulated lab served by `ionflow serve`.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct LabFile {
    /// Registered devices.
    pub devices: Vec<DeviceInfo>,
    /// Initial global parameters.
    pub globals: ParameterMap,
    /// Initial local parameters by namespace.
    pub locals: std::collections::BTreeMap<String, ParameterMap>,
    /// Sampled hardware channels. Defaults to a single `pmt` channel.
    pub channels: Vec<String>,
    /// Simulated execution time per data point, in milliseconds.
    pub execution_ms: u64,
}

impl LabFile {
    /// Load a lab description from YAML.
    pub fn load(path: &Path) -> Result<Self> {
        let source = fs::read_to_string(path)
            .with_context(|| format!("Failed to read lab file: {}", path.display()))?;
        serde_yaml_ng::from_str(&source).map_err(|e| anyhow::anyhow!("Invalid lab file: {e}"))
    }
}

/// Status name coloured by outcome.
pub fn styled_run_status(status: RunStatus) -> StyledObject<&'static str> {
    let name = status.name();
    match status {
        RunStatus::Done => style(name).green(),
        RunStatus::Failed | RunStatus::Cancelled => style(name).red(),
        RunStatus::Pending => style(name).yellow(),
        RunStatus::Processing => style(name).cyan(),
    }
}
