use chrono::{DateTime, Utc};

/// Proof of a granted lease, handed to the worker that won it.
///
/// Not persisted. Every report back to the queue is checked against the
/// stored owner, so a token whose lease expired is harmless.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseToken {
    pub job_id: String,
    pub queue: String,
    pub job_type: String,
    pub owner: String,
    /// 1-based number of the attempt this lease covers.
    pub attempt: u32,
    pub max_attempts: u32,
    pub expires_at: DateTime<Utc>,
}
