//! Experiment job scheduling and execution pipeline.
//!
//! Jobs are submitted with a priority and an optional parameter scan. The
//! [`Scheduler`] promotes each submitted job into a run, which then flows
//! through three worker pools connected by priority queues:
//!
//! 1. **Pre-processing** resolves the parameter snapshot, expands the scan
//!    into data points and generates one program per point.
//! 2. **Hardware** applies scanned values to devices with write/read-back
//!    verification and executes the program.
//! 3. **Post-processing** appends the captured channel data to the run's
//!    result file.
//!
//! Job and run status live in a [`StateStore`]; it is the single source of
//! truth for outcomes and is reconciled on startup because queues are not
//! persisted.
//!
//! # Example
//!
//! ```ignore
//! use ionflow_sched::{JobSubmission, Pipeline, PipelineConfig, ScanSpec, ScanValues};
//!
//! let pipeline = Pipeline::start(config, store, collaborators, EventBus::new()).await?;
//! let job_id = pipeline
//!     .submit(
//!         JobSubmission::new("experiments.Rabi")
//!             .scan(ScanSpec::on_device("rf", "freq", ScanValues::linspace(1.0, 2.0, 11)))
//!             .with_priority(5),
//!     )
//!     .await?;
//! ```

pub mod config;
pub mod control;
pub mod error;
pub mod events;
pub mod job;
pub mod persistence;
pub mod pipeline;
pub mod queue;
pub mod results;
pub mod run;
pub mod scan;
pub mod scheduler;
pub mod snapshot;
pub mod stages;
pub mod task;

pub use config::PipelineConfig;
pub use control::{JobController, ReconcileReport};
pub use error::{SchedError, SchedResult};
pub use events::{EventBus, RunEvent};
pub use job::{Job, JobFilter, JobId, JobStatus, JobSubmission, Priority, ScanParameter};
pub use persistence::{SqliteStore, StateStore};
pub use pipeline::{Collaborators, Pipeline};
pub use queue::TaskQueue;
pub use results::{JsonlResultStore, ResultStore};
pub use run::{JobRun, RunFilter, RunId, RunStatus, ScheduleClock};
pub use scan::{ScanSpec, ScanValues};
pub use scheduler::Scheduler;
pub use snapshot::{ParameterUpdate, RefreshMode, Snapshot};
pub use task::DataPoint;
