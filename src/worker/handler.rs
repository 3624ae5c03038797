use super::context::JobContext;
use serde_json::Value as JsonValue;
use thiserror::Error;

/// Errors a handler can report back to the worker.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerError {
    /// Transient failure; the job is retried while attempts remain.
    #[error("{0}")]
    Failed(String),

    /// The job can never succeed (bad payload, missing entity).
    #[error("Permanent failure: {0}")]
    Permanent(String),

    #[error("Job was cancelled")]
    Cancelled,

    #[error("No handler registered for job type {0}")]
    UnknownJobType(String),

    #[error("Handler panicked: {0}")]
    Panicked(String),
}

impl HandlerError {
    pub fn is_retryable(&self) -> bool {
        match self {
            HandlerError::Failed(_) | HandlerError::Cancelled | HandlerError::Panicked(_) => true,
            HandlerError::Permanent(_) | HandlerError::UnknownJobType(_) => false,
        }
    }
}

/// Trait for job handlers.
///
/// Handlers are executed synchronously on the blocking pool. Long-running
/// work should check `ctx.is_cancelled()` and return
/// `HandlerError::Cancelled` when it is set.
pub trait JobHandler: Send + Sync {
    /// Job type this handler serves, matched against `JobRecord::job_type`.
    fn job_type(&self) -> &'static str;

    fn description(&self) -> &'static str;

    fn execute(&self, ctx: &JobContext, payload: &JsonValue) -> Result<(), HandlerError>;
}
