//! Data types shared by every storage backend.

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

/// Lifecycle state of a persisted job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobState {
    /// Waiting for its `scheduled_for` time.
    Scheduled,
    /// Eligible for leasing.
    Ready,
    /// Held by a worker until the lease expires.
    Leased,
    Succeeded,
    /// Attempt budget exhausted or permanently failed.
    FailedTerminal,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Scheduled => "scheduled",
            JobState::Ready => "ready",
            JobState::Leased => "leased",
            JobState::Succeeded => "succeeded",
            JobState::FailedTerminal => "failed_terminal",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "scheduled" => Some(JobState::Scheduled),
            "ready" => Some(JobState::Ready),
            "leased" => Some(JobState::Leased),
            "succeeded" => Some(JobState::Succeeded),
            "failed_terminal" => Some(JobState::FailedTerminal),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Succeeded | JobState::FailedTerminal)
    }

    pub const ALL: [JobState; 5] = [
        JobState::Scheduled,
        JobState::Ready,
        JobState::Leased,
        JobState::Succeeded,
        JobState::FailedTerminal,
    ];
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A job as it is persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRecord {
    pub id: String,
    pub job_type: String,
    pub payload: JsonValue,
    pub queue: String,
    pub state: JobState,
    pub enqueued_at: DateTime<Utc>,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Bumped by every mutation; leasing compares against it.
    pub version: i64,
    /// Insertion order, assigned by the store.
    pub seq: i64,
}

impl JobRecord {
    /// The instant the record becomes eligible, used as the primary fetch
    /// ordering key.
    pub fn due_at(&self) -> DateTime<Utc> {
        self.scheduled_for.unwrap_or(self.enqueued_at)
    }
}

/// Compare-and-set lease acquisition.
#[derive(Debug, Clone)]
pub struct LeaseRequest<'a> {
    pub id: &'a str,
    pub owner: &'a str,
    pub expected_state: JobState,
    pub expected_version: i64,
    pub now: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// What to do with a job whose execution failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    Retry { next_attempt_at: DateTime<Utc> },
    Terminal,
}

/// Record count per state for one queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub scheduled: u64,
    pub ready: u64,
    pub leased: u64,
    pub succeeded: u64,
    pub failed_terminal: u64,
}

impl QueueStats {
    pub(crate) fn add(&mut self, state: JobState, count: u64) {
        match state {
            JobState::Scheduled => self.scheduled += count,
            JobState::Ready => self.ready += count,
            JobState::Leased => self.leased += count,
            JobState::Succeeded => self.succeeded += count,
            JobState::FailedTerminal => self.failed_terminal += count,
        }
    }

    pub fn total(&self) -> u64 {
        self.scheduled + self.ready + self.leased + self.succeeded + self.failed_terminal
    }
}

/// Error recorded when a lease runs out before the owner reports back.
pub(crate) fn lease_expired_message(owner: &str) -> String {
    format!("Lease expired (owner {})", owner)
}

pub(crate) fn to_millis(dt: &DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
}
