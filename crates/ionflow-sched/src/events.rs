//! Run notifications.
//!
//! Every run creation and every run status/log change is published on an
//! [`EventBus`]. Subscribers (dashboards, push gateways, tests) receive
//! [`RunEvent`] values through a `tokio::sync::broadcast` channel; a slow
//! subscriber lags and loses the oldest events, it never blocks the pipeline.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::run::{JobRun, RunId, RunStatus};

/// Default number of events buffered per subscriber.
const DEFAULT_CAPACITY: usize = 1024;

/// A change to a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    /// A run was created by the scheduler.
    RunCreated {
        /// The new run.
        run: JobRun,
    },
    /// A run's status or log changed.
    RunUpdated {
        /// Updated run.
        run_id: RunId,
        /// New status.
        status: RunStatus,
        /// New log message, if any.
        log: Option<String>,
    },
}

impl RunEvent {
    /// Run the event refers to.
    pub fn run_id(&self) -> RunId {
        match self {
            RunEvent::RunCreated { run } => run.id,
            RunEvent::RunUpdated { run_id, .. } => *run_id,
        }
    }
}

/// Fan-out channel for [`RunEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<RunEvent>,
}

impl EventBus {
    /// Create a bus with the default capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a bus buffering up to `capacity` events per subscriber.
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event. Dropped silently when nobody listens.
    pub fn publish(&self, event: RunEvent) {
        let _ = self.sender.send(event);
    }

    /// Subscribe to future events.
    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.sender.subscribe()
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
