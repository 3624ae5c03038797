//! Finished jobs purge.
//!
//! Recurring maintenance job: deletes succeeded and terminally failed jobs
//! older than the retention period, then schedules its own next run on the
//! queue it ran on.

use crate::clock::checked_after;
use crate::queue::{JobQueue, QueueError, ScheduleRequest};
use crate::worker::{HandlerError, JobContext, JobHandler};
use serde_json::{json, Value as JsonValue};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub const PURGE_FINISHED_JOB_TYPE: &str = "purge_finished_jobs";
pub const DEFAULT_PURGE_INTERVAL: Duration = Duration::from_secs(60 * 60);

pub struct PurgeFinishedJobsHandler {
    queue: Arc<JobQueue>,
    retention: Duration,
    interval: Duration,
}

impl PurgeFinishedJobsHandler {
    pub fn new(queue: Arc<JobQueue>, retention: Duration, interval: Duration) -> Self {
        Self {
            queue,
            retention,
            interval,
        }
    }

    /// Puts the first run on `queue_name` unless one is already pending.
    pub fn seed(queue: &JobQueue, queue_name: &str) -> Result<Option<String>, QueueError> {
        queue.schedule_if_absent(ScheduleRequest::new(
            queue_name,
            PURGE_FINISHED_JOB_TYPE,
            json!({}),
        ))
    }

    fn retention_for(&self, payload: &JsonValue) -> Result<Duration, HandlerError> {
        match payload.get("retention_hours") {
            None | Some(JsonValue::Null) => Ok(self.retention),
            Some(value) => value
                .as_u64()
                .and_then(|hours| hours.checked_mul(3600))
                .map(Duration::from_secs)
                .ok_or_else(|| {
                    HandlerError::Permanent(format!("invalid retention_hours: {}", value))
                }),
        }
    }
}

impl JobHandler for PurgeFinishedJobsHandler {
    fn job_type(&self) -> &'static str {
        PURGE_FINISHED_JOB_TYPE
    }

    fn description(&self) -> &'static str {
        "Delete finished jobs older than the retention period"
    }

    fn execute(&self, ctx: &JobContext, payload: &JsonValue) -> Result<(), HandlerError> {
        if ctx.is_cancelled() {
            return Err(HandlerError::Cancelled);
        }

        let retention = self.retention_for(payload)?;
        let deleted = self
            .queue
            .purge_finished(retention)
            .map_err(|e| match e {
                QueueError::InvalidRequest(reason) => HandlerError::Permanent(reason),
                other => HandlerError::Failed(other.to_string()),
            })?;
        if deleted > 0 {
            info!("Purged {} finished job(s) older than {:?}", deleted, retention);
        } else {
            info!("No finished jobs to purge");
        }

        let next_run = checked_after(self.queue.now(), self.interval).ok_or_else(|| {
            HandlerError::Permanent(format!("purge interval {:?} is out of range", self.interval))
        })?;
        self.queue
            .schedule(
                ScheduleRequest::new(ctx.queue.clone(), PURGE_FINISHED_JOB_TYPE, payload.clone())
                    .run_at(next_run),
            )
            .map_err(|e| HandlerError::Failed(e.to_string()))?;

        Ok(())
    }
}
