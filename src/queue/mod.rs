//! Job queue engine.
//!
//! The public face of the scheduler: calling services schedule jobs and read
//! their status; workers fetch, lease and report through the same type. All
//! state lives in the [`JobStore`], so any number of `JobQueue`s (in one or
//! many processes) can share a backend.

mod lease;
mod retry_policy;

pub use lease::LeaseToken;
pub use retry_policy::{RetryPolicy, DEFAULT_RETRY_BASE_DELAY, DEFAULT_RETRY_MAX_DELAY};

use crate::clock::{checked_after, checked_before, Clock};
use crate::context::SchedulerContext;
use crate::metrics;
use crate::storage::{
    FailureDisposition, JobRecord, JobState, JobStore, LeaseRequest, QueueStats, StorageError,
};
use crate::worker::HandlerError;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Invalid job request: {0}")]
    InvalidRequest(String),
}

/// Queue-wide defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSettings {
    pub lease_duration: Duration,
    pub default_max_attempts: u32,
    pub retry_policy: RetryPolicy,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            lease_duration: DEFAULT_LEASE_DURATION,
            default_max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_policy: RetryPolicy::default(),
        }
    }
}

/// A job to schedule.
#[derive(Debug, Clone)]
pub struct ScheduleRequest {
    pub queue: String,
    pub job_type: String,
    pub payload: JsonValue,
    /// Earliest execution time; `None` runs as soon as a worker is free.
    pub run_at: Option<DateTime<Utc>>,
    /// Overrides the queue default.
    pub max_attempts: Option<u32>,
}

impl ScheduleRequest {
    pub fn new(queue: impl Into<String>, job_type: impl Into<String>, payload: JsonValue) -> Self {
        Self {
            queue: queue.into(),
            job_type: job_type.into(),
            payload,
            run_at: None,
            max_attempts: None,
        }
    }

    pub fn run_at(mut self, run_at: DateTime<Utc>) -> Self {
        self.run_at = Some(run_at);
        self
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

/// What callers see of a job.
#[derive(Debug, Clone, PartialEq)]
pub struct JobStatus {
    pub id: String,
    pub queue: String,
    pub job_type: String,
    pub state: JobState,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
    /// Next eligible time for scheduled jobs.
    pub next_run_at: Option<DateTime<Utc>>,
}

/// Result of reporting a failed execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    Retrying { next_attempt_at: DateTime<Utc> },
    Terminal,
    /// The lease expired or was taken over before the report arrived.
    LeaseLost,
}

pub struct JobQueue {
    store: Arc<dyn JobStore>,
    settings: QueueSettings,
    clock: Arc<dyn Clock>,
}

impl JobQueue {
    pub fn new(ctx: &SchedulerContext) -> Self {
        Self::from_parts(
            Arc::clone(&ctx.connection.jobs),
            ctx.queue_settings.clone(),
            Arc::clone(&ctx.clock),
        )
    }

    pub fn from_parts(
        store: Arc<dyn JobStore>,
        settings: QueueSettings,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            settings,
            clock,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Persists a new job and returns its id.
    ///
    /// A `run_at` in the past makes the job immediately eligible.
    pub fn schedule(&self, request: ScheduleRequest) -> Result<String, QueueError> {
        if request.queue.trim().is_empty() {
            return Err(QueueError::InvalidRequest(
                "queue name must not be empty".to_string(),
            ));
        }
        if request.job_type.trim().is_empty() {
            return Err(QueueError::InvalidRequest(
                "job type must not be empty".to_string(),
            ));
        }
        let max_attempts = request
            .max_attempts
            .unwrap_or(self.settings.default_max_attempts);
        if max_attempts == 0 {
            return Err(QueueError::InvalidRequest(
                "max attempts must be at least 1".to_string(),
            ));
        }

        let now = self.clock.now();
        let state = match request.run_at {
            Some(run_at) if run_at > now => JobState::Scheduled,
            _ => JobState::Ready,
        };
        let record = JobRecord {
            id: Uuid::new_v4().to_string(),
            job_type: request.job_type,
            payload: request.payload,
            queue: request.queue,
            state,
            enqueued_at: now,
            scheduled_for: request.run_at,
            lease_owner: None,
            lease_expires_at: None,
            attempt_count: 0,
            max_attempts,
            last_error: None,
            created_at: now,
            updated_at: now,
            version: 0,
            seq: 0,
        };

        let id = self.store.enqueue(&record)?;
        metrics::record_job_enqueued(&record.queue, &record.job_type);
        debug!(
            "Scheduled job {} ({}) on queue {} as {}",
            id, record.job_type, record.queue, record.state
        );
        Ok(id)
    }

    /// Schedules the job unless a non-terminal job of the same type is
    /// already in the queue. Meant for singleton maintenance jobs; two
    /// callers racing may still both enqueue.
    pub fn schedule_if_absent(&self, request: ScheduleRequest) -> Result<Option<String>, QueueError> {
        if self
            .store
            .has_active_job(&request.queue, &request.job_type)?
        {
            debug!(
                "Job type {} already pending on queue {}",
                request.job_type, request.queue
            );
            return Ok(None);
        }
        self.schedule(request).map(Some)
    }

    pub fn get_status(&self, id: &str) -> Result<Option<JobStatus>, QueueError> {
        let now = self.clock.now();
        Ok(self.store.get_job(id)?.map(|record| {
            // Scheduled records are promoted lazily at fetch time
            let state = match record.state {
                JobState::Scheduled if record.due_at() <= now => JobState::Ready,
                state => state,
            };
            JobStatus {
                next_run_at: match state {
                    JobState::Scheduled => record.scheduled_for,
                    _ => None,
                },
                id: record.id,
                queue: record.queue,
                job_type: record.job_type,
                state,
                attempt_count: record.attempt_count,
                max_attempts: record.max_attempts,
                last_error: record.last_error,
            }
        }))
    }

    pub fn fetch_leasable(&self, queue: &str, limit: usize) -> Result<Vec<JobRecord>, QueueError> {
        Ok(self.store.fetch_leasable(queue, self.clock.now(), limit)?)
    }

    /// Tries to lease a fetched record for `owner`.
    ///
    /// `None` means another worker got there first (or the record changed
    /// since it was fetched); that is not an error.
    pub fn try_lease(
        &self,
        record: &JobRecord,
        owner: &str,
    ) -> Result<Option<LeaseToken>, QueueError> {
        let now = self.clock.now();
        let expires_at = self.lease_expiry(now)?;
        let won = self.store.try_lease(&LeaseRequest {
            id: &record.id,
            owner,
            expected_state: record.state,
            expected_version: record.version,
            now,
            expires_at,
        })?;
        if !won {
            metrics::record_lease_conflict(&record.queue);
            debug!("Lease conflict on job {} for {}", record.id, owner);
            return Ok(None);
        }
        Ok(Some(LeaseToken {
            job_id: record.id.clone(),
            queue: record.queue.clone(),
            job_type: record.job_type.clone(),
            owner: owner.to_string(),
            attempt: record.attempt_count + 1,
            max_attempts: record.max_attempts,
            expires_at,
        }))
    }

    /// Reports success. `false` when the lease was lost in the meantime.
    pub fn complete(&self, token: &LeaseToken) -> Result<bool, QueueError> {
        let done = self
            .store
            .mark_succeeded(&token.job_id, &token.owner, self.clock.now())?;
        if !done {
            warn!(
                "Job {} finished but {} no longer holds its lease",
                token.job_id, token.owner
            );
        }
        Ok(done)
    }

    /// Reports a failed execution and decides between retry and terminal
    /// failure.
    pub fn fail(
        &self,
        token: &LeaseToken,
        error: &HandlerError,
    ) -> Result<FailureOutcome, QueueError> {
        let now = self.clock.now();
        let message = error.to_string();
        let disposition = if error.is_retryable() && token.attempt < token.max_attempts {
            let next_attempt_at = self
                .settings
                .retry_policy
                .next_attempt_at(now, token.attempt)
                .ok_or_else(|| {
                    QueueError::InvalidRequest(format!(
                        "retry delay for attempt {} is out of range",
                        token.attempt
                    ))
                })?;
            FailureDisposition::Retry { next_attempt_at }
        } else {
            FailureDisposition::Terminal
        };

        if !self
            .store
            .mark_failed(&token.job_id, &token.owner, &message, disposition, now)?
        {
            warn!(
                "Job {} failed but {} no longer holds its lease",
                token.job_id, token.owner
            );
            return Ok(FailureOutcome::LeaseLost);
        }

        Ok(match disposition {
            FailureDisposition::Retry { next_attempt_at } => {
                FailureOutcome::Retrying { next_attempt_at }
            }
            FailureDisposition::Terminal => {
                info!(
                    "Job {} failed terminally after {} attempt(s): {}",
                    token.job_id, token.attempt, message
                );
                FailureOutcome::Terminal
            }
        })
    }

    /// Extends the lease by a full lease duration from now.
    pub fn renew(&self, token: &LeaseToken) -> Result<Option<LeaseToken>, QueueError> {
        let now = self.clock.now();
        let expires_at = self.lease_expiry(now)?;
        if self
            .store
            .renew_lease(&token.job_id, &token.owner, expires_at, now)?
        {
            Ok(Some(LeaseToken {
                expires_at,
                ..token.clone()
            }))
        } else {
            Ok(None)
        }
    }

    /// Gives the job back without consuming the attempt.
    pub fn release(&self, token: &LeaseToken) -> Result<bool, QueueError> {
        Ok(self
            .store
            .release_lease(&token.job_id, &token.owner, self.clock.now())?)
    }

    pub fn reclaim_expired_leases(&self) -> Result<usize, QueueError> {
        Ok(self.store.reclaim_expired_leases(self.clock.now())?)
    }

    pub fn queue_stats(&self, queue: &str) -> Result<QueueStats, QueueError> {
        Ok(self.store.queue_stats(queue)?)
    }

    /// Deletes succeeded and terminally failed jobs untouched for `older_than`.
    pub fn purge_finished(&self, older_than: Duration) -> Result<usize, QueueError> {
        let before = checked_before(self.clock.now(), older_than).ok_or_else(|| {
            QueueError::InvalidRequest(format!("purge age {:?} is out of range", older_than))
        })?;
        Ok(self.store.purge_finished(before)?)
    }

    fn lease_expiry(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>, QueueError> {
        checked_after(now, self.settings.lease_duration).ok_or_else(|| {
            QueueError::InvalidRequest(format!(
                "lease duration {:?} is out of range",
                self.settings.lease_duration
            ))
        })
    }
}
