//! Worker server.
//!
//! Runs a pool of workers per configured queue. Each worker polls the queue,
//! leases jobs one at a time, executes the registered handler on the
//! blocking pool while renewing the lease, and reports the outcome. Store
//! calls also run on the blocking pool.

mod context;
mod handler;
mod registry;
mod sweeper;

pub use context::JobContext;
pub use handler::{HandlerError, JobHandler};
pub use registry::JobRegistry;
pub use sweeper::LeaseSweeper;

use crate::metrics;
use crate::queue::{FailureOutcome, JobQueue, LeaseToken, QueueError};
use futures::future::join_all;
use rand::Rng;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

pub const DEFAULT_SERVER_NAME: &str = "job-scheduler";
pub const DEFAULT_QUEUE: &str = "default";
pub const DEFAULT_WORKERS_PER_QUEUE: usize = 2;
pub const DEFAULT_BATCH_SIZE: usize = 10;
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_JITTER: Duration = Duration::from_millis(100);
pub const DEFAULT_RENEW_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSettings {
    /// Prefix of every lease owner id handed out by this server.
    pub server_name: String,
    pub queues: Vec<String>,
    pub workers_per_queue: usize,
    /// Candidates fetched per poll.
    pub batch_size: usize,
    pub poll_interval: Duration,
    /// Upper bound of the random delay added to each idle poll.
    pub jitter: Duration,
    /// Must be shorter than the queue's lease duration.
    pub renew_interval: Duration,
    /// `None` disables the lease sweeper.
    pub sweep_interval: Option<Duration>,
    /// Stop each worker as soon as its queue has nothing leasable.
    pub shutdown_when_queue_empty: bool,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            server_name: DEFAULT_SERVER_NAME.to_string(),
            queues: vec![DEFAULT_QUEUE.to_string()],
            workers_per_queue: DEFAULT_WORKERS_PER_QUEUE,
            batch_size: DEFAULT_BATCH_SIZE,
            poll_interval: DEFAULT_POLL_INTERVAL,
            jitter: DEFAULT_JITTER,
            renew_interval: DEFAULT_RENEW_INTERVAL,
            sweep_interval: Some(DEFAULT_SWEEP_INTERVAL),
            shutdown_when_queue_empty: false,
        }
    }
}

/// Failure of a store call made by a worker.
#[derive(Debug, Error)]
enum StoreCallError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("Store call did not complete: {0}")]
    Join(#[from] JoinError),
}

/// Runs `call` against the queue on the blocking pool.
async fn store_call<T, F>(queue: &Arc<JobQueue>, call: F) -> Result<T, StoreCallError>
where
    T: Send + 'static,
    F: FnOnce(&JobQueue) -> Result<T, QueueError> + Send + 'static,
{
    let queue = Arc::clone(queue);
    Ok(tokio::task::spawn_blocking(move || call(&queue)).await??)
}

pub struct WorkerServer {
    queue: Arc<JobQueue>,
    registry: Arc<JobRegistry>,
    settings: WorkerSettings,
}

impl WorkerServer {
    pub fn new(queue: Arc<JobQueue>, registry: JobRegistry, settings: WorkerSettings) -> Self {
        Self {
            queue,
            registry: Arc::new(registry),
            settings,
        }
    }

    /// Spawns the workers (and the sweeper, if enabled). Cancelling
    /// `shutdown` stops them after their in-flight jobs.
    pub fn start(&self, shutdown: CancellationToken) -> WorkerHandle {
        if self.registry.is_empty() {
            warn!(
                "Worker server {} has no handlers, every leased job will fail",
                self.settings.server_name
            );
        } else {
            info!(
                "Starting worker server {} with handlers {:?}",
                self.settings.server_name,
                self.registry.job_types()
            );
        }

        let mut workers = Vec::new();
        for queue_name in &self.settings.queues {
            for n in 1..=self.settings.workers_per_queue {
                let owner = format!("{}:{}:{}", self.settings.server_name, queue_name, n);
                info!(worker.name = %owner, "Starting worker…");

                let worker = Worker {
                    owner: owner.clone(),
                    queue_name: queue_name.clone(),
                    queue: Arc::clone(&self.queue),
                    registry: Arc::clone(&self.registry),
                    batch_size: self.settings.batch_size.max(1),
                    poll_interval: self.settings.poll_interval,
                    jitter: self.settings.jitter,
                    renew_interval: self.settings.renew_interval,
                    shutdown_when_queue_empty: self.settings.shutdown_when_queue_empty,
                    shutdown: shutdown.clone(),
                };

                let span = info_span!("worker", worker.name = %owner);
                workers.push(tokio::spawn(async move { worker.run().instrument(span).await }));
            }
        }

        let sweeper = self.settings.sweep_interval.map(|interval| {
            let token = shutdown.child_token();
            let sweeper =
                LeaseSweeper::new(Arc::clone(&self.queue), &self.settings.server_name, interval);
            let span = info_span!("sweeper", server = %self.settings.server_name);
            let handle = tokio::spawn(Arc::new(sweeper).run(token.clone()).instrument(span));
            (handle, token)
        });

        WorkerHandle { workers, sweeper }
    }
}

/// Handle to a running worker server.
#[derive(Debug)]
pub struct WorkerHandle {
    workers: Vec<JoinHandle<()>>,
    sweeper: Option<(JoinHandle<()>, CancellationToken)>,
}

impl WorkerHandle {
    /// Waits for every worker to stop, then stops the sweeper.
    pub async fn wait_for_shutdown(self) {
        join_all(self.workers)
            .await
            .into_iter()
            .for_each(|result| {
                if let Err(error) = result {
                    warn!(%error, "Worker task panicked");
                }
            });

        if let Some((handle, token)) = self.sweeper {
            token.cancel();
            if let Err(error) = handle.await {
                warn!(%error, "Lease sweeper task panicked");
            }
        }
        info!("Worker server stopped");
    }
}

struct Worker {
    owner: String,
    queue_name: String,
    queue: Arc<JobQueue>,
    registry: Arc<JobRegistry>,
    batch_size: usize,
    poll_interval: Duration,
    jitter: Duration,
    renew_interval: Duration,
    shutdown_when_queue_empty: bool,
    shutdown: CancellationToken,
}

impl Worker {
    fn sleep_duration_with_jitter(&self) -> Duration {
        if self.jitter.is_zero() {
            return self.poll_interval;
        }

        let jitter_millis = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        let random_jitter = rand::rng().random_range(0..=jitter_millis);
        self.poll_interval + Duration::from_millis(random_jitter)
    }

    /// Returns false when shutdown was requested while sleeping.
    async fn idle(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = self.shutdown.cancelled() => false,
        }
    }

    async fn run(&self) {
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            match self.run_batch().await {
                Ok(fetched) if fetched > 0 => {}
                Ok(_) if self.shutdown_when_queue_empty => {
                    debug!("Nothing leasable on queue {}, shutting down worker", self.queue_name);
                    break;
                }
                Ok(_) => {
                    let sleep_duration = self.sleep_duration_with_jitter();
                    trace!("Queue {} idle, polling again in {:?}", self.queue_name, sleep_duration);
                    if !self.idle(sleep_duration).await {
                        break;
                    }
                }
                Err(e) => {
                    error!("Failed to poll queue {}: {}", self.queue_name, e);
                    if !self.idle(self.sleep_duration_with_jitter()).await {
                        break;
                    }
                }
            }
        }

        info!("Worker {} stopped", self.owner);
    }

    /// Fetches a batch and runs whatever this worker manages to lease.
    /// Returns the number of candidates fetched.
    async fn run_batch(&self) -> Result<usize, StoreCallError> {
        let (queue_name, limit) = (self.queue_name.clone(), self.batch_size);
        let candidates =
            store_call(&self.queue, move |queue| queue.fetch_leasable(&queue_name, limit)).await?;
        trace!("Fetched {} candidate(s)", candidates.len());
        let fetched = candidates.len();

        for record in candidates {
            if self.shutdown.is_cancelled() {
                break;
            }
            // Leasing right before execution keeps the rest of the batch
            // available to other workers.
            let payload = record.payload.clone();
            let owner = self.owner.clone();
            let leased =
                store_call(&self.queue, move |queue| queue.try_lease(&record, &owner)).await?;
            if let Some(token) = leased {
                let span = info_span!(
                    "job",
                    job.id = %token.job_id,
                    job.type = %token.job_type,
                    attempt = token.attempt
                );
                self.execute(token, payload).instrument(span).await;
            }
        }

        Ok(fetched)
    }

    async fn execute(&self, token: LeaseToken, payload: JsonValue) {
        let Some(handler) = self.registry.get(&token.job_type) else {
            warn!("No handler for job type {}", token.job_type);
            let error = HandlerError::UnknownJobType(token.job_type.clone());
            self.report(&token, Err(error), Duration::ZERO).await;
            return;
        };

        debug!(
            "Running job (attempt {}/{})",
            token.attempt, token.max_attempts
        );
        metrics::set_job_running(&self.queue_name, true);

        // Independent of shutdown: a stopping server lets running jobs finish
        let job_token = CancellationToken::new();
        let ctx = JobContext::new(
            token.job_id.clone(),
            token.queue.clone(),
            token.attempt,
            token.max_attempts,
            job_token.clone(),
        );

        let start_time = Instant::now();
        let mut task = tokio::task::spawn_blocking(move || handler.execute(&ctx, &payload));
        let mut renew = tokio::time::interval_at(
            tokio::time::Instant::now() + self.renew_interval,
            self.renew_interval,
        );
        let mut lease = token;
        let mut lease_lost = false;

        let result = loop {
            tokio::select! {
                joined = &mut task => {
                    break joined.unwrap_or_else(|e| Err(HandlerError::Panicked(panic_message(e))));
                }
                _ = renew.tick(), if !lease_lost => {
                    let current = lease.clone();
                    match store_call(&self.queue, move |queue| queue.renew(&current)).await {
                        Ok(Some(renewed)) => {
                            trace!("Lease renewed until {}", renewed.expires_at);
                            lease = renewed;
                        }
                        Ok(None) => {
                            warn!("Lost lease on job {}, cancelling handler", lease.job_id);
                            lease_lost = true;
                            job_token.cancel();
                        }
                        Err(e) => error!("Failed to renew lease on job {}: {}", lease.job_id, e),
                    }
                }
            }
        };

        metrics::set_job_running(&self.queue_name, false);
        self.report(&lease, result, start_time.elapsed()).await;
    }

    async fn report(
        &self,
        lease: &LeaseToken,
        result: Result<(), HandlerError>,
        elapsed: Duration,
    ) {
        let token = lease.clone();
        let outcome = match result {
            Ok(()) => match store_call(&self.queue, move |queue| queue.complete(&token)).await {
                Ok(true) => {
                    info!("Job {} completed successfully in {:?}", lease.job_id, elapsed);
                    "success"
                }
                Ok(false) => "lease_lost",
                Err(e) => {
                    error!("Failed to record success of job {}: {}", lease.job_id, e);
                    "error"
                }
            },
            Err(error) => {
                warn!(
                    "Job {} failed on attempt {}/{} after {:?}: {}",
                    lease.job_id, lease.attempt, lease.max_attempts, elapsed, error
                );
                match store_call(&self.queue, move |queue| queue.fail(&token, &error)).await {
                    Ok(FailureOutcome::Retrying { next_attempt_at }) => {
                        info!("Job {} will be retried at {}", lease.job_id, next_attempt_at);
                        "retry"
                    }
                    Ok(FailureOutcome::Terminal) => "failed",
                    Ok(FailureOutcome::LeaseLost) => "lease_lost",
                    Err(e) => {
                        error!("Failed to record failure of job {}: {}", lease.job_id, e);
                        "error"
                    }
                }
            }
        };

        metrics::record_job_execution(&self.queue_name, &lease.job_type, outcome, elapsed);
    }
}

fn panic_message(error: JoinError) -> String {
    if !error.is_panic() {
        return error.to_string();
    }
    let payload = error.into_panic();
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
