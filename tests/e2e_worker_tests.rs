//! End-to-end tests of the worker server: real tokio runtime, real storage
//! files, manual clock for queue time.

mod common;

use common::{Script, ScriptedHandler, TestStores, LEASE_SECS};
use job_scheduler::jobs::{register_builtin, LogMessageHandler, PurgeFinishedJobsHandler};
use job_scheduler::{
    Clock, HandlerError, JobContext, JobHandler, JobQueue, JobRegistry, JobState,
    ScheduleRequest, WorkerServer, WorkerSettings,
};
use serde_json::{json, Value as JsonValue};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn drain_settings() -> WorkerSettings {
    WorkerSettings {
        server_name: "e2e".to_string(),
        queues: vec!["default".to_string()],
        workers_per_queue: 3,
        batch_size: 4,
        poll_interval: Duration::from_millis(10),
        jitter: Duration::from_millis(5),
        renew_interval: Duration::from_millis(50),
        sweep_interval: None,
        shutdown_when_queue_empty: true,
    }
}

async fn drain(queue: &Arc<JobQueue>, registry: JobRegistry) {
    let server = WorkerServer::new(queue.clone(), registry, drain_settings());
    tokio::time::timeout(
        Duration::from_secs(30),
        server.start(CancellationToken::new()).wait_for_shutdown(),
    )
    .await
    .expect("drain did not finish");
}

async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

#[tokio::test]
async fn test_drain_runs_every_job_exactly_once() {
    let stores = TestStores::new();
    for store in stores.all() {
        let queue = store.queue();
        for n in 0..12 {
            queue
                .schedule(ScheduleRequest::new("default", "work", json!({ "n": n })))
                .unwrap();
        }
        let handler = ScriptedHandler::new("work", Script::Succeed);

        drain(&queue, JobRegistry::new().with(handler.clone())).await;

        assert_eq!(handler.calls(), 12, "backend {}", store.backend());
        let mut seen: Vec<i64> = handler
            .seen
            .lock()
            .unwrap()
            .iter()
            .map(|p| p["n"].as_i64().unwrap())
            .collect();
        seen.sort();
        assert_eq!(seen, (0..12).collect::<Vec<_>>());
        assert_eq!(queue.queue_stats("default").unwrap().succeeded, 12);
    }
}

#[tokio::test]
async fn test_failed_job_is_retried_after_backoff() {
    let stores = TestStores::new();
    for store in stores.all() {
        let queue = store.queue();
        let id = queue
            .schedule(ScheduleRequest::new("default", "flaky", json!({})))
            .unwrap();
        let handler = ScriptedHandler::new("flaky", Script::FailTimes(1));
        let registry = JobRegistry::new().with(handler.clone());

        drain(&queue, registry.clone()).await;
        let status = queue.get_status(&id).unwrap().unwrap();
        assert_eq!(status.state, JobState::Scheduled);
        assert_eq!(status.last_error.as_deref(), Some("failure #1"));
        let next_run = status.next_run_at.unwrap();

        store.clock.set(next_run);
        drain(&queue, registry).await;
        let status = queue.get_status(&id).unwrap().unwrap();
        assert_eq!(status.state, JobState::Succeeded);
        assert_eq!(status.attempt_count, 2);
        assert_eq!(handler.calls(), 2);
    }
}

#[tokio::test]
async fn test_permanent_and_unknown_failures_are_terminal() {
    let stores = TestStores::new();
    for store in stores.all() {
        let queue = store.queue();
        let permanent = queue
            .schedule(ScheduleRequest::new("default", "doomed", json!({})))
            .unwrap();
        let unknown = queue
            .schedule(ScheduleRequest::new("default", "unregistered", json!({})))
            .unwrap();
        let registry = JobRegistry::new().with(ScriptedHandler::new("doomed", Script::Permanent));

        drain(&queue, registry).await;

        for id in [&permanent, &unknown] {
            let status = queue.get_status(id).unwrap().unwrap();
            assert_eq!(status.state, JobState::FailedTerminal);
            assert_eq!(status.attempt_count, 1);
        }
        assert_eq!(
            queue
                .get_status(&unknown)
                .unwrap()
                .unwrap()
                .last_error
                .as_deref(),
            Some("No handler registered for job type unregistered")
        );
    }
}

#[tokio::test]
async fn test_builtin_handlers_run() {
    let stores = TestStores::new();
    for store in stores.all() {
        let queue = store.queue();
        let log = queue
            .schedule(ScheduleRequest::new(
                "default",
                "log_message",
                json!({ "message": "hello from the queue" }),
            ))
            .unwrap();
        PurgeFinishedJobsHandler::seed(&queue, "default").unwrap();

        let mut registry = JobRegistry::new();
        register_builtin(&mut registry, &queue, Some(Duration::from_secs(3600)));
        assert_eq!(registry.job_types(), vec!["log_message", "purge_finished_jobs"]);
        drain(&queue, registry).await;

        assert_eq!(
            queue.get_status(&log).unwrap().unwrap().state,
            JobState::Succeeded
        );
        // The purge rescheduled itself for later
        let stats = queue.queue_stats("default").unwrap();
        assert_eq!(stats.scheduled, 1);
        assert!(PurgeFinishedJobsHandler::seed(&queue, "default")
            .unwrap()
            .is_none());
        assert!(LogMessageHandler.description().contains("message"));
    }
}

/// Blocks until its cancellation token fires.
struct WaitForCancel {
    started: AtomicBool,
    saw_cancel: AtomicBool,
}

impl JobHandler for WaitForCancel {
    fn job_type(&self) -> &'static str {
        "long"
    }

    fn description(&self) -> &'static str {
        "Runs until cancelled"
    }

    fn execute(&self, ctx: &JobContext, _payload: &JsonValue) -> Result<(), HandlerError> {
        self.started.store(true, Ordering::SeqCst);
        for _ in 0..1000 {
            if ctx.is_cancelled() {
                self.saw_cancel.store(true, Ordering::SeqCst);
                return Err(HandlerError::Cancelled);
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        Err(HandlerError::Failed("never cancelled".to_string()))
    }
}

fn wait_for_cancel() -> Arc<WaitForCancel> {
    Arc::new(WaitForCancel {
        started: AtomicBool::new(false),
        saw_cancel: AtomicBool::new(false),
    })
}

/// Holds its job until the test lets it finish.
struct HoldUntilReleased {
    started: AtomicBool,
    release: AtomicBool,
    saw_cancel: AtomicBool,
    runs: AtomicUsize,
}

impl HoldUntilReleased {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            started: AtomicBool::new(false),
            release: AtomicBool::new(false),
            saw_cancel: AtomicBool::new(false),
            runs: AtomicUsize::new(0),
        })
    }
}

impl JobHandler for HoldUntilReleased {
    fn job_type(&self) -> &'static str {
        "held"
    }

    fn description(&self) -> &'static str {
        "Runs until released"
    }

    fn execute(&self, ctx: &JobContext, _payload: &JsonValue) -> Result<(), HandlerError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        self.started.store(true, Ordering::SeqCst);
        for _ in 0..2000 {
            if ctx.is_cancelled() {
                self.saw_cancel.store(true, Ordering::SeqCst);
                return Err(HandlerError::Cancelled);
            }
            if self.release.load(Ordering::SeqCst) {
                return Ok(());
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        Err(HandlerError::Failed("never released".to_string()))
    }
}

#[tokio::test]
async fn test_shutdown_waits_for_in_flight_job() {
    let stores = TestStores::new();
    for store in stores.all() {
        let queue = store.queue();
        let id = queue
            .schedule(ScheduleRequest::new("default", "held", json!({})))
            .unwrap();
        let handler = HoldUntilReleased::new();

        let settings = WorkerSettings {
            workers_per_queue: 1,
            shutdown_when_queue_empty: false,
            ..drain_settings()
        };
        let server = WorkerServer::new(
            queue.clone(),
            JobRegistry::new().with(handler.clone()),
            settings,
        );
        let shutdown = CancellationToken::new();
        let handle = server.start(shutdown.clone());

        wait_until("handler start", || handler.started.load(Ordering::SeqCst)).await;
        shutdown.cancel();
        let stopping = tokio::spawn(handle.wait_for_shutdown());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!stopping.is_finished(), "server stopped with a job in flight");
        assert_eq!(
            queue.get_status(&id).unwrap().unwrap().state,
            JobState::Leased
        );

        handler.release.store(true, Ordering::SeqCst);
        tokio::time::timeout(Duration::from_secs(10), stopping)
            .await
            .expect("workers did not stop")
            .unwrap();

        assert!(!handler.saw_cancel.load(Ordering::SeqCst));
        let status = queue.get_status(&id).unwrap().unwrap();
        assert_eq!(status.state, JobState::Succeeded);
        assert_eq!(status.attempt_count, 1);
    }
}

#[tokio::test]
async fn test_renewal_keeps_long_job_alive() {
    let stores = TestStores::new();
    for store in stores.all() {
        let queue = store.queue();
        let id = queue
            .schedule(ScheduleRequest::new("default", "held", json!({})))
            .unwrap();
        let handler = HoldUntilReleased::new();

        // A second worker is polling the same queue the whole time
        let settings = WorkerSettings {
            workers_per_queue: 2,
            renew_interval: Duration::from_millis(20),
            shutdown_when_queue_empty: false,
            ..drain_settings()
        };
        let server = WorkerServer::new(
            queue.clone(),
            JobRegistry::new().with(handler.clone()),
            settings,
        );
        let shutdown = CancellationToken::new();
        let handle = server.start(shutdown.clone());

        wait_until("handler start", || handler.started.load(Ordering::SeqCst)).await;
        let lease_expiry = || {
            store
                .ctx
                .connection
                .jobs
                .get_job(&id)
                .unwrap()
                .unwrap()
                .lease_expires_at
        };
        let lease = chrono::Duration::seconds(LEASE_SECS as i64);
        let step = Duration::from_secs(LEASE_SECS / 2 - 1);

        // Five steps add up to twice the lease; each stays inside it
        for _ in 0..5 {
            store.clock.advance(step);
            let now = store.clock.now();
            wait_until("lease renewal", || {
                lease_expiry().is_some_and(|at| at >= now + lease)
            })
            .await;
            assert!(queue.fetch_leasable("default", 10).unwrap().is_empty());
            assert_eq!(
                queue.get_status(&id).unwrap().unwrap().state,
                JobState::Leased
            );
        }

        handler.release.store(true, Ordering::SeqCst);
        wait_until("completion", || {
            queue.get_status(&id).unwrap().unwrap().state == JobState::Succeeded
        })
        .await;
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(10), handle.wait_for_shutdown())
            .await
            .expect("workers did not stop");

        let status = queue.get_status(&id).unwrap().unwrap();
        assert_eq!(status.attempt_count, 1);
        assert_eq!(status.last_error, None);
        assert_eq!(handler.runs.load(Ordering::SeqCst), 1);
        assert!(!handler.saw_cancel.load(Ordering::SeqCst));
    }
}

#[tokio::test]
async fn test_lost_lease_cancels_handler() {
    let stores = TestStores::new();
    for store in stores.all() {
        let queue = store.queue();
        let id = queue
            .schedule(ScheduleRequest::new("default", "long", json!({})))
            .unwrap();
        let handler = wait_for_cancel();

        let settings = WorkerSettings {
            workers_per_queue: 1,
            renew_interval: Duration::from_millis(20),
            shutdown_when_queue_empty: false,
            ..drain_settings()
        };
        let server = WorkerServer::new(
            queue.clone(),
            JobRegistry::new().with(handler.clone()),
            settings,
        );
        let shutdown = CancellationToken::new();
        let handle = server.start(shutdown.clone());

        wait_until("handler start", || handler.started.load(Ordering::SeqCst)).await;
        // Queue time jumps past the lease; the next renewal fails
        store.clock.advance(Duration::from_secs(LEASE_SECS + 1));
        wait_until("handler cancellation", || {
            handler.saw_cancel.load(Ordering::SeqCst)
        })
        .await;
        wait_until("failure report", || {
            queue.get_status(&id).unwrap().unwrap().state != JobState::Leased
        })
        .await;

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(10), handle.wait_for_shutdown())
            .await
            .expect("workers did not stop");

        let status = queue.get_status(&id).unwrap().unwrap();
        assert_eq!(status.state, JobState::Scheduled);
        assert_eq!(status.attempt_count, 1);
        assert_eq!(status.last_error.as_deref(), Some("Job was cancelled"));
    }
}

#[tokio::test]
async fn test_sweeper_reclaims_abandoned_lease() {
    let stores = TestStores::new();
    for store in stores.all() {
        let queue = store.queue();
        let id = queue
            .schedule(ScheduleRequest::new("orphans", "work", json!({})))
            .unwrap();
        let record = queue.fetch_leasable("orphans", 1).unwrap().remove(0);
        queue.try_lease(&record, "vanished").unwrap().unwrap();
        store.clock.advance(Duration::from_secs(LEASE_SECS));

        // No worker polls "orphans"; only the sweeper touches it
        let settings = WorkerSettings {
            sweep_interval: Some(Duration::from_millis(10)),
            shutdown_when_queue_empty: false,
            ..drain_settings()
        };
        let server = WorkerServer::new(queue.clone(), JobRegistry::new(), settings);
        let shutdown = CancellationToken::new();
        let handle = server.start(shutdown.clone());

        wait_until("sweep", || {
            queue.get_status(&id).unwrap().unwrap().state == JobState::Ready
        })
        .await;
        shutdown.cancel();
        handle.wait_for_shutdown().await;
    }
}
