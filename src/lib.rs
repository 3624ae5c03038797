//! Durable background job scheduling.
//!
//! Jobs are persisted through a pluggable storage backend (embedded document
//! store or SQLite), leased by workers with an optimistic compare-and-set and
//! retried with exponential backoff until they succeed or exhaust their
//! attempt budget.

pub mod clock;
pub mod config;
pub mod context;
pub mod jobs;
pub mod metrics;
pub mod migration;
pub mod queue;
pub mod sqlite_persistence;
pub mod storage;
pub mod worker;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{AppConfig, CliConfig, ConfigError, FileConfig};
pub use context::{SchedulerContext, StartupError};
pub use migration::{MigrationError, MigrationPlan, MigrationReport, SchemaMigrator};
pub use queue::{
    FailureOutcome, JobQueue, JobStatus, LeaseToken, QueueError, QueueSettings, RetryPolicy,
    ScheduleRequest,
};
pub use storage::{
    BackendKind, JobRecord, JobState, JobStore, SchemaStore, StorageConnection, StorageError,
    StorageSettings,
};
pub use worker::{HandlerError, JobContext, JobHandler, JobRegistry, WorkerServer, WorkerSettings};
