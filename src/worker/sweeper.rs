use crate::metrics;
use crate::queue::{JobQueue, QueueError};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Periodically hands expired leases back to their queues.
///
/// Workers already normalize their own queue on every fetch; the sweeper
/// covers queues nobody is polling and keeps the stats honest.
pub struct LeaseSweeper {
    queue: Arc<JobQueue>,
    server_name: String,
    interval: Duration,
}

impl LeaseSweeper {
    pub fn new(queue: Arc<JobQueue>, server_name: impl Into<String>, interval: Duration) -> Self {
        Self {
            queue,
            server_name: server_name.into(),
            interval,
        }
    }

    pub fn sweep_once(&self) -> Result<usize, QueueError> {
        let reclaimed = self.queue.reclaim_expired_leases()?;
        if reclaimed > 0 {
            info!("Reclaimed {} expired lease(s)", reclaimed);
            metrics::record_leases_reclaimed(&self.server_name, reclaimed);
        } else {
            debug!("No expired leases");
        }
        Ok(reclaimed)
    }

    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let sweeper = Arc::clone(&self);
                    match tokio::task::spawn_blocking(move || sweeper.sweep_once()).await {
                        Ok(Ok(_)) => {}
                        Ok(Err(e)) => error!("Lease sweep failed: {}", e),
                        Err(e) => error!("Lease sweep did not complete: {}", e),
                    }
                }
                _ = shutdown.cancelled() => {
                    debug!("Lease sweeper stopping");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::queue::{QueueSettings, ScheduleRequest};
    use crate::storage::{JobState, SchemaStore, SqliteJobStore, CURRENT_SCHEMA_VERSION};
    use chrono::DateTime;
    use serde_json::json;

    #[test]
    fn test_sweep_reclaims_expired_leases() {
        let store = Arc::new(SqliteJobStore::in_memory().unwrap());
        store.initialize(CURRENT_SCHEMA_VERSION).unwrap();
        let clock = Arc::new(ManualClock::new(
            DateTime::from_timestamp_millis(1_700_000_000_000).unwrap(),
        ));
        let queue = Arc::new(JobQueue::from_parts(
            store,
            QueueSettings::default(),
            clock.clone(),
        ));

        let id = queue
            .schedule(ScheduleRequest::new("other", "noop", json!({})))
            .unwrap();
        let record = queue.fetch_leasable("other", 1).unwrap().remove(0);
        queue.try_lease(&record, "gone").unwrap().unwrap();

        let sweeper = LeaseSweeper::new(queue.clone(), "test", Duration::from_secs(1));
        assert_eq!(sweeper.sweep_once().unwrap(), 0);

        clock.advance(Duration::from_secs(31));
        assert_eq!(sweeper.sweep_once().unwrap(), 1);
        assert_eq!(
            queue.get_status(&id).unwrap().unwrap().state,
            JobState::Ready
        );
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let store = Arc::new(SqliteJobStore::in_memory().unwrap());
        store.initialize(CURRENT_SCHEMA_VERSION).unwrap();
        let queue = Arc::new(JobQueue::from_parts(
            store,
            QueueSettings::default(),
            Arc::new(crate::clock::SystemClock),
        ));
        let token = CancellationToken::new();
        let handle = tokio::spawn(
            Arc::new(LeaseSweeper::new(queue, "test", Duration::from_millis(10)))
                .run(token.clone()),
        );

        tokio::time::sleep(Duration::from_millis(30)).await;
        token.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("sweeper did not stop")
            .unwrap();
    }
}
