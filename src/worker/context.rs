use tokio_util::sync::CancellationToken;

/// Context provided to handlers during execution.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: String,
    pub queue: String,
    /// 1-based attempt number of this execution.
    pub attempt: u32,
    pub max_attempts: u32,
    /// Cancelled when the worker loses the lease. Server shutdown lets the
    /// handler finish.
    pub cancellation_token: CancellationToken,
}

impl JobContext {
    pub fn new(
        job_id: impl Into<String>,
        queue: impl Into<String>,
        attempt: u32,
        max_attempts: u32,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            queue: queue.into(),
            attempt,
            max_attempts,
            cancellation_token,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }
}
