//! The three pipeline stages.
//!
//! | stage            | input queue            | output                    |
//! |------------------|------------------------|---------------------------|
//! | pre-processing   | [`PreProcessingTask`]  | [`HardwareTask`] per point |
//! | hardware         | [`HardwareTask`]       | [`PostProcessingTask`]    |
//! | post-processing  | [`PostProcessingTask`] | result store              |
//!
//! Every worker owns its collaborators and talks to the others only through
//! the queues, completion channels and the state store.
//!
//! [`PreProcessingTask`]: crate::task::PreProcessingTask
//! [`HardwareTask`]: crate::task::HardwareTask
//! [`PostProcessingTask`]: crate::task::PostProcessingTask

mod hardware;
mod post;
mod pre;

pub use hardware::{DeviceLocks, HardwareWorker};
pub use post::PostProcessingWorker;
pub use pre::PreProcessingWorker;

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::queue::TaskQueue;
use crate::task::Prioritized;

/// Log written on runs interrupted by a pipeline shutdown.
pub const SHUTDOWN_LOG: &str = "Server shutting down";

/// Wait for the next task.
///
/// Returns `None` once `shutdown` fired or the queue is closed and drained.
pub(crate) async fn next_task<T: Prioritized>(
    queue: &TaskQueue<T>,
    poll_timeout: Duration,
    shutdown: &CancellationToken,
) -> Option<T> {
    loop {
        if shutdown.is_cancelled() {
            return None;
        }
        if let Some(task) = queue.get_timeout(poll_timeout).await {
            return Some(task);
        }
        if queue.is_closed() && queue.is_empty() {
            return None;
        }
    }
}
