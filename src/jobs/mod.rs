//! Built-in job handlers.

pub mod log_message;
pub mod purge_finished;

pub use log_message::{LogMessageHandler, LOG_MESSAGE_JOB_TYPE};
pub use purge_finished::{
    PurgeFinishedJobsHandler, DEFAULT_PURGE_INTERVAL, PURGE_FINISHED_JOB_TYPE,
};

use crate::queue::JobQueue;
use crate::worker::JobRegistry;
use std::sync::Arc;
use std::time::Duration;

/// Registers the built-in handlers. The purge job is only registered when a
/// retention period is configured.
pub fn register_builtin(
    registry: &mut JobRegistry,
    queue: &Arc<JobQueue>,
    finished_retention: Option<Duration>,
) {
    registry.register(Arc::new(LogMessageHandler));
    if let Some(retention) = finished_retention {
        registry.register(Arc::new(PurgeFinishedJobsHandler::new(
            Arc::clone(queue),
            retention,
            DEFAULT_PURGE_INTERVAL,
        )));
    }
}
