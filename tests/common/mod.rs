//! Common test infrastructure
//!
//! Tests get a freshly migrated store per backend and a queue bound to a
//! manual clock, so lease expiry and backoff can be driven without sleeping.
//!
//! # Example
//!
//! ```no_run
//! mod common;
//! use common::TestStores;
//!
//! #[test]
//! fn test_something() {
//!     let stores = TestStores::new();
//!     for store in stores.all() {
//!         let queue = store.queue();
//!         // ...
//!     }
//! }
//! ```

#![allow(dead_code)]

use chrono::{DateTime, Utc};
use job_scheduler::migration::MigrationPlan;
use job_scheduler::queue::QueueSettings;
use job_scheduler::storage::StorageTarget;
use job_scheduler::{
    BackendKind, HandlerError, JobContext, JobHandler, JobQueue, ManualClock, RetryPolicy,
    SchedulerContext, StorageSettings,
};
use serde_json::Value as JsonValue;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

pub const LEASE_SECS: u64 = 10;
pub const MAX_ATTEMPTS: u32 = 3;
pub const RETRY_BASE_SECS: u64 = 2;
pub const RETRY_MAX_SECS: u64 = 60;

pub fn t0() -> DateTime<Utc> {
    DateTime::from_timestamp_millis(1_700_000_000_000).unwrap()
}

pub fn queue_settings() -> QueueSettings {
    QueueSettings {
        lease_duration: Duration::from_secs(LEASE_SECS),
        default_max_attempts: MAX_ATTEMPTS,
        retry_policy: RetryPolicy::new(
            Duration::from_secs(RETRY_BASE_SECS),
            Duration::from_secs(RETRY_MAX_SECS),
        ),
    }
}

/// One file-backed store per backend inside a temp directory.
pub struct TestStores {
    dir: TempDir,
}

impl TestStores {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().unwrap(),
        }
    }

    pub fn path(&self, file: &str) -> PathBuf {
        self.dir.path().join(file)
    }

    pub fn settings(&self, backend: BackendKind) -> StorageSettings {
        let file = match backend {
            BackendKind::Relational => "jobs.db",
            BackendKind::Document => "jobs.json",
        };
        StorageSettings {
            backend,
            target: StorageTarget::File(self.path(file)),
            collection_prefix: "SchedulerQueue".to_string(),
        }
    }

    pub fn open(&self, backend: BackendKind) -> TestStore {
        let clock = Arc::new(ManualClock::new(t0()));
        let (ctx, _) = SchedulerContext::open(
            &self.settings(backend),
            &MigrationPlan::default(),
            queue_settings(),
            clock.clone(),
        )
        .unwrap();
        TestStore { ctx, clock }
    }

    pub fn all(&self) -> Vec<TestStore> {
        [BackendKind::Relational, BackendKind::Document]
            .into_iter()
            .map(|backend| self.open(backend))
            .collect()
    }
}

pub struct TestStore {
    pub ctx: SchedulerContext,
    pub clock: Arc<ManualClock>,
}

impl TestStore {
    pub fn backend(&self) -> BackendKind {
        self.ctx.connection.backend
    }

    pub fn queue(&self) -> Arc<JobQueue> {
        Arc::new(JobQueue::new(&self.ctx))
    }
}

/// What a [`ScriptedHandler`] does on each call.
#[derive(Debug, Clone)]
pub enum Script {
    Succeed,
    /// Fail with a retryable error this many times, then succeed.
    FailTimes(usize),
    AlwaysFail,
    Permanent,
}

/// Handler driven by a script, recording the payloads it saw.
pub struct ScriptedHandler {
    job_type: &'static str,
    script: Script,
    calls: AtomicUsize,
    pub seen: Mutex<Vec<JsonValue>>,
}

impl ScriptedHandler {
    pub fn new(job_type: &'static str, script: Script) -> Arc<Self> {
        Arc::new(Self {
            job_type,
            script,
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl JobHandler for ScriptedHandler {
    fn job_type(&self) -> &'static str {
        self.job_type
    }

    fn description(&self) -> &'static str {
        "Scripted test handler"
    }

    fn execute(&self, _ctx: &JobContext, payload: &JsonValue) -> Result<(), HandlerError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(payload.clone());
        match self.script {
            Script::Succeed => Ok(()),
            Script::FailTimes(n) if call < n => {
                Err(HandlerError::Failed(format!("failure #{}", call + 1)))
            }
            Script::FailTimes(_) => Ok(()),
            Script::AlwaysFail => Err(HandlerError::Failed("always fails".to_string())),
            Script::Permanent => Err(HandlerError::Permanent("cannot succeed".to_string())),
        }
    }
}
