//! Storage adapter: the persistence contract the queue engine and the schema
//! migrator program against, plus its two implementations.
//!
//! - [`SqliteJobStore`]: relational backend on SQLite.
//! - [`DocumentJobStore`]: embedded document store (JSON document
//!   collections, in memory or persisted to a file).
//!
//! Every transition is a guarded compare-and-set on the record, so several
//! workers (or processes sharing a database file) can race on the same job
//! and exactly one wins.

mod document_store;
mod error;
mod models;
mod sqlite_schema;
mod sqlite_store;

pub use document_store::DocumentJobStore;
pub use error::StorageError;
pub use models::{FailureDisposition, JobRecord, JobState, LeaseRequest, QueueStats};
pub(crate) use models::{from_millis, lease_expired_message, to_millis};
pub use sqlite_store::SqliteJobStore;

use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

pub type Result<T> = std::result::Result<T, StorageError>;

/// Schema version this build reads and writes.
pub const CURRENT_SCHEMA_VERSION: u32 = 2;

/// Default prefix for document collection names.
pub const DEFAULT_COLLECTION_PREFIX: &str = "SchedulerQueue";

/// Job persistence operations.
///
/// Implementations serialize access internally; callers share them behind an
/// `Arc`. Operations that hand back a `bool` return `false` when the guard on
/// the record did not match (lost race or lost lease).
pub trait JobStore: Send + Sync {
    /// Cheap round trip proving the backend is reachable.
    fn ping(&self) -> Result<()>;

    /// Persists a new record and returns its id. The store assigns `seq`.
    fn enqueue(&self, record: &JobRecord) -> Result<String>;

    fn get_job(&self, id: &str) -> Result<Option<JobRecord>>;

    /// Returns up to `limit` leasable records of `queue`, oldest due first.
    ///
    /// Before selecting, expired leases in the queue are handed back (or
    /// failed when their attempt budget is spent) and scheduled records whose
    /// time has come are promoted to ready.
    fn fetch_leasable(&self, queue: &str, now: DateTime<Utc>, limit: usize)
        -> Result<Vec<JobRecord>>;

    /// Atomically moves a record from `expected_state` at `expected_version`
    /// to leased, consuming one attempt.
    fn try_lease(&self, request: &LeaseRequest<'_>) -> Result<bool>;

    fn mark_succeeded(&self, id: &str, owner: &str, now: DateTime<Utc>) -> Result<bool>;

    fn mark_failed(
        &self,
        id: &str,
        owner: &str,
        error: &str,
        disposition: FailureDisposition,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Extends a live lease. Fails (returns false) once the lease expired.
    fn renew_lease(
        &self,
        id: &str,
        owner: &str,
        new_expiry: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Gives a leased record back without consuming the attempt.
    fn release_lease(&self, id: &str, owner: &str, now: DateTime<Utc>) -> Result<bool>;

    /// Hands back every expired lease, across all queues.
    fn reclaim_expired_leases(&self, now: DateTime<Utc>) -> Result<usize>;

    fn queue_stats(&self, queue: &str) -> Result<QueueStats>;

    /// Deletes terminal records last updated before `before`.
    fn purge_finished(&self, before: DateTime<Utc>) -> Result<usize>;

    /// Whether a non-terminal record of `job_type` exists in `queue`.
    fn has_active_job(&self, queue: &str, job_type: &str) -> Result<bool>;
}

/// How a migration step reshapes existing data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MigrationStrategy {
    /// Alter the existing table or documents.
    #[default]
    InPlace,
    /// Build the new layout beside the old one, copy, then swap.
    RecreateAndCopy,
}

impl MigrationStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationStrategy::InPlace => "in_place",
            MigrationStrategy::RecreateAndCopy => "recreate_and_copy",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "in_place" | "inplace" | "migrate" => Some(MigrationStrategy::InPlace),
            "recreate_and_copy" | "recreate" | "copy" => Some(MigrationStrategy::RecreateAndCopy),
            _ => None,
        }
    }
}

/// Handle to a backup taken before a migration step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRef {
    pub name: String,
    /// Schema version of the data captured by the snapshot.
    pub version: u32,
}

/// Schema management view of a backend, driven by the migrator.
pub trait SchemaStore: Send + Sync {
    fn backend_name(&self) -> &'static str;

    /// `None` for an empty store that was never initialized.
    fn current_version(&self) -> Result<Option<u32>>;

    /// Creates the layout of `version` on an empty store.
    fn initialize(&self, version: u32) -> Result<()>;

    /// Copies the job data aside.
    fn snapshot(&self, version: u32) -> Result<SnapshotRef>;

    /// Replaces the job data with the snapshot content and version.
    fn restore_snapshot(&self, snapshot: &SnapshotRef) -> Result<()>;

    /// Upgrades from `to_version - 1` to `to_version` and records the new
    /// version.
    fn apply_step(&self, to_version: u32, strategy: MigrationStrategy) -> Result<()>;

    /// Read-only check that the stored layout matches `version`.
    fn validate(&self, version: u32) -> Result<()>;
}

/// Which persistence technology backs the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Document,
    Relational,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Document => "document",
            BackendKind::Relational => "relational",
        }
    }

    /// Case-insensitive; accepts the technology names as aliases.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "document" | "document-store" | "document_store" | "mongodb" => {
                Some(BackendKind::Document)
            }
            "relational" | "sqlite" => Some(BackendKind::Relational),
            _ => None,
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the backend keeps its data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageTarget {
    InMemory,
    File(PathBuf),
}

impl StorageTarget {
    /// Parses a backend connection string.
    ///
    /// Relational: `sqlite::memory:`, `:memory:`, `sqlite://<path>` or a bare
    /// path. Document: `memory://`, `memory`, `file://<path>` or a bare path.
    pub fn parse(backend: BackendKind, connection_string: &str) -> Option<Self> {
        let s = connection_string.trim();
        if s.is_empty() {
            return None;
        }
        let path = match backend {
            BackendKind::Relational => {
                if s == ":memory:" || s == "sqlite::memory:" {
                    return Some(StorageTarget::InMemory);
                }
                s.strip_prefix("sqlite://")
                    .or_else(|| s.strip_prefix("sqlite:"))
                    .unwrap_or(s)
            }
            BackendKind::Document => {
                if s == "memory" || s == "memory://" {
                    return Some(StorageTarget::InMemory);
                }
                s.strip_prefix("file://").unwrap_or(s)
            }
        };
        if path.is_empty() || path.contains("://") {
            return None;
        }
        Some(StorageTarget::File(PathBuf::from(path)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageSettings {
    pub backend: BackendKind,
    pub target: StorageTarget,
    pub collection_prefix: String,
}

/// The process-wide storage handle: one backend seen through both contracts.
///
/// Dropping the last clone closes the underlying connection.
#[derive(Clone)]
pub struct StorageConnection {
    pub backend: BackendKind,
    pub jobs: Arc<dyn JobStore>,
    pub schema: Arc<dyn SchemaStore>,
}

impl StorageConnection {
    pub fn open(settings: &StorageSettings) -> Result<Self> {
        info!(
            "Opening {} storage at {:?}",
            settings.backend, settings.target
        );
        match settings.backend {
            BackendKind::Relational => {
                let store = Arc::new(match &settings.target {
                    StorageTarget::InMemory => SqliteJobStore::in_memory()?,
                    StorageTarget::File(path) => SqliteJobStore::open(path)?,
                });
                Ok(Self {
                    backend: settings.backend,
                    jobs: store.clone(),
                    schema: store,
                })
            }
            BackendKind::Document => {
                let store = Arc::new(match &settings.target {
                    StorageTarget::InMemory => {
                        DocumentJobStore::in_memory(&settings.collection_prefix)
                    }
                    StorageTarget::File(path) => {
                        DocumentJobStore::open(path, &settings.collection_prefix)?
                    }
                });
                Ok(Self {
                    backend: settings.backend,
                    jobs: store.clone(),
                    schema: store,
                })
            }
        }
    }
}
