//! Collaborator traits used by the execution pipeline.
//!
//! ```text
//!   ParameterSource ──→ SequenceGenerator ──→ DeviceClient ──→ HardwareBackend
//!   (snapshot query)     (sync, program)       (write/verify)    (execute, async)
//! ```
//!
//! | Trait | Kind | Used by |
//! |-------|------|---------|
//! | [`ParameterSource`] | async | pre-processing, hardware (shared writes) |
//! | [`SequenceGenerator`] | sync | pre-processing |
//! | [`crate::DeviceRegistry`] | async | hardware |
//! | [`crate::DeviceClient`] | async | hardware |
//! | [`HardwareBackend`] | async | hardware |

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::HalResult;
use crate::parameter::{ParameterMap, ParameterValue};

/// Reference to the experiment source a job runs.
///
/// The identifier is a dotted path whose last segment names the experiment
/// and whose prefix names the module providing it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExperimentRef {
    /// Full dotted identifier, e.g. `experiments.rabi.RabiFlop`.
    pub id: String,
    /// Source revision the experiment was taken from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
}

impl ExperimentRef {
    /// Create an experiment reference.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            revision: None,
        }
    }

    /// Pin the source revision.
    pub fn with_revision(mut self, revision: impl Into<String>) -> Self {
        self.revision = Some(revision.into());
        self
    }

    /// Module part of the identifier (empty for bare names).
    pub fn module(&self) -> &str {
        self.id.rsplit_once('.').map_or("", |(module, _)| module)
    }

    /// Experiment name part of the identifier.
    pub fn name(&self) -> &str {
        self.id.rsplit_once('.').map_or(self.id.as_str(), |(_, name)| name)
    }

    /// Namespace used for run-scoped ("local") parameters.
    pub fn namespace(&self) -> &str {
        &self.id
    }
}

impl fmt::Display for ExperimentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

/// Source of current and historical parameter values.
#[async_trait]
pub trait ParameterSource: Send + Sync {
    /// Global parameters, as of `until` or latest when `None`.
    async fn global_parameters(&self, until: Option<DateTime<Utc>>) -> HalResult<ParameterMap>;

    /// Parameters scoped to `namespace`, as of `until` or latest when `None`.
    async fn local_parameters(
        &self,
        namespace: &str,
        until: Option<DateTime<Utc>>,
    ) -> HalResult<ParameterMap>;

    /// Write a shared parameter directly.
    async fn set_shared(&self, id: &str, value: &ParameterValue) -> HalResult<()>;
}

/// Turns a parameter snapshot into a hardware program.
///
/// Synchronous: the pipeline does not care how or where generation runs.
pub trait SequenceGenerator: Send + Sync {
    /// Generate the program for `experiment` with `parameters` applied.
    fn generate(&self, experiment: &ExperimentRef, parameters: &ParameterMap)
        -> HalResult<String>;
}

/// Channel data returned by one hardware execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelData {
    /// Scalar result per channel.
    #[serde(default)]
    pub result_channels: BTreeMap<String, f64>,
    /// Per-shot samples per channel.
    #[serde(default)]
    pub shot_channels: BTreeMap<String, Vec<i64>>,
    /// Optional vector data per channel.
    #[serde(default)]
    pub vector_channels: BTreeMap<String, Vec<f64>>,
}

impl ChannelData {
    /// Whether no channel carried data.
    pub fn is_empty(&self) -> bool {
        self.result_channels.is_empty()
            && self.shot_channels.is_empty()
            && self.vector_channels.is_empty()
    }
}

/// Hardware that runs generated programs.
#[async_trait]
pub trait HardwareBackend: Send + Sync {
    /// Name of this backend.
    fn name(&self) -> &str;

    /// Execute `program` for `shots` shots and return the sampled channels.
    async fn execute(&self, program: &str, shots: u32) -> HalResult<ChannelData>;
}
