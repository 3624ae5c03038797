//! Embedded document store.
//!
//! Named collections of JSON documents keyed by `_id`, held in memory and,
//! when backed by a file, rewritten atomically (temp file + rename) before a
//! mutating call returns. Each call works on a copy of the database and swaps
//! it in only when it succeeds. The in-place migration step is the exception:
//! it rewrites live documents and relies on a snapshot for rollback.
//!
//! Several handles may share one file, in this process or another. Every
//! call holds an exclusive lock on `<file>.lock` and reloads the file first,
//! so a write made through one handle is never lost to another.

use super::models::{from_millis, lease_expired_message, to_millis};
use super::{
    FailureDisposition, JobRecord, JobState, JobStore, LeaseRequest, MigrationStrategy,
    QueueStats, Result, SchemaStore, SnapshotRef, StorageError, CURRENT_SCHEMA_VERSION,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

type Collection = BTreeMap<String, JsonValue>;

const SCHEMA_MARKER_ID: &str = "version";

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct DocumentDatabase {
    collections: BTreeMap<String, Collection>,
}

/// A job as stored at the current schema version.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct JobDocument {
    #[serde(rename = "_id")]
    id: String,
    seq: i64,
    queue: String,
    job_type: String,
    payload: JsonValue,
    state: String,
    enqueued_at: i64,
    scheduled_for: Option<i64>,
    attempt_count: u32,
    max_attempts: u32,
    last_error: Option<String>,
    created_at: i64,
    updated_at: i64,
    lease_owner: Option<String>,
    lease_expires_at: Option<i64>,
    version: i64,
}

impl JobDocument {
    fn from_record(record: &JobRecord, seq: i64) -> Self {
        Self {
            id: record.id.clone(),
            seq,
            queue: record.queue.clone(),
            job_type: record.job_type.clone(),
            payload: record.payload.clone(),
            state: record.state.as_str().to_string(),
            enqueued_at: to_millis(&record.enqueued_at),
            scheduled_for: record.scheduled_for.as_ref().map(to_millis),
            attempt_count: record.attempt_count,
            max_attempts: record.max_attempts,
            last_error: record.last_error.clone(),
            created_at: to_millis(&record.created_at),
            updated_at: to_millis(&record.updated_at),
            lease_owner: record.lease_owner.clone(),
            lease_expires_at: record.lease_expires_at.as_ref().map(to_millis),
            version: record.version,
        }
    }

    fn state(&self) -> Result<JobState> {
        JobState::parse(&self.state)
            .ok_or_else(|| self.corrupt(format!("unknown state '{}'", self.state)))
    }

    fn due_at(&self) -> i64 {
        self.scheduled_for.unwrap_or(self.enqueued_at)
    }

    fn corrupt(&self, reason: String) -> StorageError {
        StorageError::Corrupt {
            id: self.id.clone(),
            reason,
        }
    }

    fn timestamp(&self, ms: i64) -> Result<DateTime<Utc>> {
        from_millis(ms).ok_or_else(|| self.corrupt(format!("timestamp {} out of range", ms)))
    }

    fn to_record(&self) -> Result<JobRecord> {
        Ok(JobRecord {
            id: self.id.clone(),
            job_type: self.job_type.clone(),
            payload: self.payload.clone(),
            queue: self.queue.clone(),
            state: self.state()?,
            enqueued_at: self.timestamp(self.enqueued_at)?,
            scheduled_for: self.scheduled_for.map(|ms| self.timestamp(ms)).transpose()?,
            lease_owner: self.lease_owner.clone(),
            lease_expires_at: self
                .lease_expires_at
                .map(|ms| self.timestamp(ms))
                .transpose()?,
            attempt_count: self.attempt_count,
            max_attempts: self.max_attempts,
            last_error: self.last_error.clone(),
            created_at: self.timestamp(self.created_at)?,
            updated_at: self.timestamp(self.updated_at)?,
            version: self.version,
            seq: self.seq,
        })
    }

    fn is_leased_by(&self, owner: &str) -> bool {
        self.state == JobState::Leased.as_str() && self.lease_owner.as_deref() == Some(owner)
    }

    fn touch(&mut self, now_ms: i64) {
        self.version += 1;
        self.updated_at = now_ms;
    }

    fn clear_lease(&mut self) {
        self.lease_owner = None;
        self.lease_expires_at = None;
    }

    /// Hands back an expired lease. Returns whether anything changed.
    fn expire_lease(&mut self, now_ms: i64) -> bool {
        let expired = self.state == JobState::Leased.as_str()
            && self.lease_expires_at.is_some_and(|at| at <= now_ms);
        if !expired {
            return false;
        }
        let next = if self.attempt_count < self.max_attempts {
            JobState::Ready
        } else {
            JobState::FailedTerminal
        };
        self.last_error = Some(lease_expired_message(
            self.lease_owner.as_deref().unwrap_or_default(),
        ));
        self.state = next.as_str().to_string();
        self.clear_lease();
        self.touch(now_ms);
        true
    }
}

impl DocumentDatabase {
    fn collection(&self, name: &str) -> Option<&Collection> {
        self.collections.get(name)
    }

    fn collection_mut(&mut self, name: &str) -> &mut Collection {
        self.collections.entry(name.to_string()).or_default()
    }

    fn jobs(&self, name: &str) -> Result<Vec<JobDocument>> {
        self.collection(name)
            .map(|docs| {
                docs.values()
                    .map(|doc| Ok(serde_json::from_value(doc.clone())?))
                    .collect::<Result<Vec<JobDocument>>>()
            })
            .unwrap_or_else(|| Ok(Vec::new()))
    }

    fn job(&self, name: &str, id: &str) -> Result<Option<JobDocument>> {
        self.collection(name)
            .and_then(|docs| docs.get(id))
            .map(|doc| Ok::<JobDocument, StorageError>(serde_json::from_value(doc.clone())?))
            .transpose()
    }

    fn put_job(&mut self, name: &str, doc: &JobDocument) -> Result<()> {
        let value = serde_json::to_value(doc)?;
        self.collection_mut(name).insert(doc.id.clone(), value);
        Ok(())
    }

    fn marker_version(&self, name: &str) -> Option<u32> {
        self.collection(name)
            .and_then(|docs| docs.get(SCHEMA_MARKER_ID))
            .and_then(|doc| doc.get("version"))
            .and_then(JsonValue::as_u64)
            .map(|v| v as u32)
    }

    fn set_marker_version(&mut self, name: &str, version: u32) {
        self.collection_mut(name).insert(
            SCHEMA_MARKER_ID.to_string(),
            json!({
                "_id": SCHEMA_MARKER_ID,
                "version": version,
                "updated_at": Utc::now().timestamp_millis(),
            }),
        );
    }
}

/// Access to the database for the length of one call. File stores also hold
/// the cross-handle file lock and have just reloaded from disk.
struct Locked<'a> {
    db: MutexGuard<'a, DocumentDatabase>,
    _file_lock: Option<File>,
}

impl Deref for Locked<'_> {
    type Target = DocumentDatabase;

    fn deref(&self) -> &DocumentDatabase {
        &self.db
    }
}

impl DerefMut for Locked<'_> {
    fn deref_mut(&mut self) -> &mut DocumentDatabase {
        &mut self.db
    }
}

/// Document backend.
pub struct DocumentJobStore {
    db: Mutex<DocumentDatabase>,
    path: Option<PathBuf>,
    lock_path: Option<PathBuf>,
    jobs_collection: String,
    schema_collection: String,
    prefix: String,
}

impl DocumentJobStore {
    pub fn in_memory(prefix: &str) -> Self {
        Self::with_database(DocumentDatabase::default(), None, prefix)
    }

    /// Opens (or creates on first write) a file-backed store.
    pub fn open<P: AsRef<Path>>(path: P, prefix: &str) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let store = Self::with_database(DocumentDatabase::default(), Some(path), prefix);
        // Loads the file, so a corrupt one fails here
        store.lock()?;
        debug!("Opened document store at {:?}", store.path);
        Ok(store)
    }

    fn with_database(db: DocumentDatabase, path: Option<PathBuf>, prefix: &str) -> Self {
        let lock_path = path.as_ref().map(|path| {
            let mut lock_path = path.clone().into_os_string();
            lock_path.push(".lock");
            PathBuf::from(lock_path)
        });
        Self {
            db: Mutex::new(db),
            path,
            lock_path,
            jobs_collection: format!("{}.jobs", prefix),
            schema_collection: format!("{}.schema", prefix),
            prefix: prefix.to_string(),
        }
    }

    fn load(path: &Path) -> Result<DocumentDatabase> {
        if !path.exists() {
            return Ok(DocumentDatabase::default());
        }
        let content = std::fs::read_to_string(path)?;
        if content.trim().is_empty() {
            return Ok(DocumentDatabase::default());
        }
        Ok(serde_json::from_str(&content)?)
    }

    fn lock(&self) -> Result<Locked<'_>> {
        let mut db = self.db.lock().map_err(|_| StorageError::Poisoned)?;
        let (Some(path), Some(lock_path)) = (&self.path, &self.lock_path) else {
            return Ok(Locked {
                db,
                _file_lock: None,
            });
        };
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(lock_path)?;
        // Released when the file is closed
        fs2::FileExt::lock_exclusive(&file)?;
        *db = Self::load(path)?;
        Ok(Locked {
            db,
            _file_lock: Some(file),
        })
    }

    /// Runs `f` against the database without the option to write.
    fn read<T>(&self, f: impl FnOnce(&DocumentDatabase) -> Result<T>) -> Result<T> {
        let db = self.lock()?;
        f(&db)
    }

    /// Runs `f` on a working copy. When it reports a change, the copy is
    /// persisted and swapped in.
    fn mutate<T>(&self, f: impl FnOnce(&mut DocumentDatabase) -> Result<(T, bool)>) -> Result<T> {
        let mut db = self.lock()?;
        let mut working = db.clone();
        let (result, changed) = f(&mut working)?;
        if changed {
            self.persist(&working)?;
            *db = working;
        }
        Ok(result)
    }

    fn persist(&self, db: &DocumentDatabase) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let mut file = tempfile::NamedTempFile::new_in(dir)?;
        serde_json::to_writer(&mut file, db)?;
        file.as_file().sync_all()?;
        file.persist(path).map_err(|e| StorageError::Io(e.error))?;
        Ok(())
    }

    /// Mutates the job `id` when `guard` accepts it.
    fn update_job(
        &self,
        id: &str,
        guard: impl FnOnce(&JobDocument) -> bool,
        update: impl FnOnce(&mut JobDocument),
    ) -> Result<bool> {
        let collection = self.jobs_collection.clone();
        self.mutate(|db| {
            let Some(mut doc) = db.job(&collection, id)? else {
                return Ok((false, false));
            };
            if !guard(&doc) {
                return Ok((false, false));
            }
            update(&mut doc);
            db.put_job(&collection, &doc)?;
            Ok((true, true))
        })
    }

    fn backup_collection(snapshot: &str) -> String {
        format!("{}.jobs", snapshot)
    }

    /// Brings one v1 document to the v2 shape.
    fn upgrade_v1_document(id: &str, doc: &mut JsonValue) -> Result<()> {
        let corrupt = |reason: &str| StorageError::Corrupt {
            id: id.to_string(),
            reason: reason.to_string(),
        };
        let fields = doc
            .as_object_mut()
            .ok_or_else(|| corrupt("document is not an object"))?;
        fields.entry("lease_owner").or_insert(JsonValue::Null);
        fields.entry("lease_expires_at").or_insert(JsonValue::Null);
        fields.entry("version").or_insert(json!(0));
        if fields.get("state").and_then(JsonValue::as_str) == Some(JobState::Leased.as_str()) {
            fields.insert("state".to_string(), json!(JobState::Ready.as_str()));
        }
        // Must now read as a current document
        serde_json::from_value::<JobDocument>(doc.clone())
            .map_err(|e| corrupt(&format!("cannot upgrade: {}", e)))?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn insert_raw_document(&self, id: &str, doc: JsonValue) {
        let collection = self.jobs_collection.clone();
        self.mutate(|db| {
            db.collection_mut(&collection).insert(id.to_string(), doc);
            Ok(((), true))
        })
        .unwrap();
    }

    #[cfg(test)]
    pub(crate) fn raw_document(&self, id: &str) -> Option<JsonValue> {
        self.lock()
            .unwrap()
            .collection(&self.jobs_collection)
            .and_then(|docs| docs.get(id).cloned())
    }
}

impl JobStore for DocumentJobStore {
    fn ping(&self) -> Result<()> {
        self.lock().map(|_| ())
    }

    fn enqueue(&self, record: &JobRecord) -> Result<String> {
        let collection = self.jobs_collection.clone();
        self.mutate(|db| {
            let next_seq = db
                .jobs(&collection)?
                .iter()
                .map(|doc| doc.seq)
                .max()
                .unwrap_or(0)
                + 1;
            db.put_job(&collection, &JobDocument::from_record(record, next_seq))?;
            Ok((record.id.clone(), true))
        })
    }

    fn get_job(&self, id: &str) -> Result<Option<JobRecord>> {
        self.read(|db| {
            db.job(&self.jobs_collection, id)?
                .map(|doc| doc.to_record())
                .transpose()
        })
    }

    fn fetch_leasable(
        &self,
        queue: &str,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<JobRecord>> {
        let now_ms = to_millis(&now);
        let collection = self.jobs_collection.clone();
        self.mutate(|db| {
            let mut changed = false;
            let mut candidates = Vec::new();
            for mut doc in db.jobs(&collection)? {
                if doc.queue != queue {
                    continue;
                }
                let mut touched = doc.expire_lease(now_ms);
                if doc.state == JobState::Scheduled.as_str()
                    && doc.scheduled_for.is_some_and(|at| at <= now_ms)
                {
                    doc.state = JobState::Ready.as_str().to_string();
                    doc.touch(now_ms);
                    touched = true;
                }
                if touched {
                    db.put_job(&collection, &doc)?;
                    changed = true;
                }
                if doc.state == JobState::Ready.as_str() && doc.due_at() <= now_ms {
                    candidates.push(doc);
                }
            }
            candidates.sort_by_key(|doc| (doc.due_at(), doc.enqueued_at, doc.seq));
            let records = candidates
                .iter()
                .take(limit)
                .map(JobDocument::to_record)
                .collect::<Result<Vec<_>>>()?;
            Ok((records, changed))
        })
    }

    fn try_lease(&self, request: &LeaseRequest<'_>) -> Result<bool> {
        if !matches!(
            request.expected_state,
            JobState::Ready | JobState::Scheduled
        ) {
            return Ok(false);
        }
        let now_ms = to_millis(&request.now);
        self.update_job(
            request.id,
            |doc| {
                doc.state == request.expected_state.as_str()
                    && doc.version == request.expected_version
                    && doc.attempt_count < doc.max_attempts
                    && doc.due_at() <= now_ms
            },
            |doc| {
                doc.state = JobState::Leased.as_str().to_string();
                doc.lease_owner = Some(request.owner.to_string());
                doc.lease_expires_at = Some(to_millis(&request.expires_at));
                doc.attempt_count += 1;
                doc.touch(now_ms);
            },
        )
    }

    fn mark_succeeded(&self, id: &str, owner: &str, now: DateTime<Utc>) -> Result<bool> {
        self.update_job(
            id,
            |doc| doc.is_leased_by(owner),
            |doc| {
                doc.state = JobState::Succeeded.as_str().to_string();
                doc.clear_lease();
                doc.touch(to_millis(&now));
            },
        )
    }

    fn mark_failed(
        &self,
        id: &str,
        owner: &str,
        error: &str,
        disposition: FailureDisposition,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        self.update_job(
            id,
            |doc| doc.is_leased_by(owner),
            |doc| {
                match disposition {
                    FailureDisposition::Retry { next_attempt_at } => {
                        let state = if next_attempt_at <= now {
                            JobState::Ready
                        } else {
                            JobState::Scheduled
                        };
                        doc.state = state.as_str().to_string();
                        doc.scheduled_for = Some(to_millis(&next_attempt_at));
                    }
                    FailureDisposition::Terminal => {
                        doc.state = JobState::FailedTerminal.as_str().to_string();
                    }
                }
                doc.last_error = Some(error.to_string());
                doc.clear_lease();
                doc.touch(to_millis(&now));
            },
        )
    }

    fn renew_lease(
        &self,
        id: &str,
        owner: &str,
        new_expiry: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let now_ms = to_millis(&now);
        self.update_job(
            id,
            |doc| doc.is_leased_by(owner) && doc.lease_expires_at.is_some_and(|at| at > now_ms),
            |doc| {
                doc.lease_expires_at = Some(to_millis(&new_expiry));
                doc.touch(now_ms);
            },
        )
    }

    fn release_lease(&self, id: &str, owner: &str, now: DateTime<Utc>) -> Result<bool> {
        self.update_job(
            id,
            |doc| doc.is_leased_by(owner),
            |doc| {
                doc.state = JobState::Ready.as_str().to_string();
                doc.attempt_count = doc.attempt_count.saturating_sub(1);
                doc.clear_lease();
                doc.touch(to_millis(&now));
            },
        )
    }

    fn reclaim_expired_leases(&self, now: DateTime<Utc>) -> Result<usize> {
        let now_ms = to_millis(&now);
        let collection = self.jobs_collection.clone();
        self.mutate(|db| {
            let mut reclaimed = 0;
            for mut doc in db.jobs(&collection)? {
                if doc.expire_lease(now_ms) {
                    db.put_job(&collection, &doc)?;
                    reclaimed += 1;
                }
            }
            Ok((reclaimed, reclaimed > 0))
        })
    }

    fn queue_stats(&self, queue: &str) -> Result<QueueStats> {
        self.read(|db| {
            let mut stats = QueueStats::default();
            for doc in db.jobs(&self.jobs_collection)? {
                if doc.queue == queue {
                    stats.add(doc.state()?, 1);
                }
            }
            Ok(stats)
        })
    }

    fn purge_finished(&self, before: DateTime<Utc>) -> Result<usize> {
        let before_ms = to_millis(&before);
        let collection = self.jobs_collection.clone();
        self.mutate(|db| {
            let mut doomed = Vec::new();
            for doc in db.jobs(&collection)? {
                if doc.state()?.is_terminal() && doc.updated_at < before_ms {
                    doomed.push(doc.id);
                }
            }
            let docs = db.collection_mut(&collection);
            for id in &doomed {
                docs.remove(id);
            }
            Ok((doomed.len(), !doomed.is_empty()))
        })
    }

    fn has_active_job(&self, queue: &str, job_type: &str) -> Result<bool> {
        self.read(|db| {
            for doc in db.jobs(&self.jobs_collection)? {
                if doc.queue == queue && doc.job_type == job_type && !doc.state()?.is_terminal() {
                    return Ok(true);
                }
            }
            Ok(false)
        })
    }
}

impl SchemaStore for DocumentJobStore {
    fn backend_name(&self) -> &'static str {
        "document"
    }

    fn current_version(&self) -> Result<Option<u32>> {
        self.read(|db| {
            Ok(match db.marker_version(&self.schema_collection) {
                Some(version) => Some(version),
                // Job documents written before the marker existed
                None if db.collection(&self.jobs_collection).is_some() => Some(1),
                None => None,
            })
        })
    }

    fn initialize(&self, version: u32) -> Result<()> {
        if version == 0 || version > CURRENT_SCHEMA_VERSION {
            return Err(StorageError::UnsupportedVersion(version));
        }
        let (jobs, schema) = (self.jobs_collection.clone(), self.schema_collection.clone());
        self.mutate(|db| {
            db.collection_mut(&jobs);
            db.set_marker_version(&schema, version);
            Ok(((), true))
        })?;
        info!(
            "Created document collections with prefix {} at schema version {}",
            self.prefix, version
        );
        Ok(())
    }

    fn snapshot(&self, version: u32) -> Result<SnapshotRef> {
        let name = format!(
            "{}.backup.v{}.{}",
            self.prefix,
            version,
            Utc::now().timestamp_millis()
        );
        let jobs = self.jobs_collection.clone();
        let target = Self::backup_collection(&name);
        self.mutate(|db| {
            let copy = db.collection(&jobs).cloned().unwrap_or_default();
            db.collections.insert(target, copy);
            Ok(((), true))
        })?;
        Ok(SnapshotRef { name, version })
    }

    fn restore_snapshot(&self, snapshot: &SnapshotRef) -> Result<()> {
        let (jobs, schema) = (self.jobs_collection.clone(), self.schema_collection.clone());
        let source = Self::backup_collection(&snapshot.name);
        self.mutate(|db| {
            let copy = db
                .collection(&source)
                .cloned()
                .ok_or_else(|| StorageError::Corrupt {
                    id: source.clone(),
                    reason: "snapshot collection is missing".to_string(),
                })?;
            db.collections.insert(jobs, copy);
            db.set_marker_version(&schema, snapshot.version);
            Ok(((), true))
        })
    }

    fn apply_step(&self, to_version: u32, strategy: MigrationStrategy) -> Result<()> {
        if to_version != 2 {
            return Err(StorageError::UnsupportedVersion(to_version));
        }
        let (jobs, schema) = (self.jobs_collection.clone(), self.schema_collection.clone());
        match strategy {
            MigrationStrategy::InPlace => {
                // Documents are rewritten one by one on the live database; a
                // failure part way leaves the earlier ones upgraded.
                let mut db = self.lock()?;
                let docs = db.collection_mut(&jobs);
                for (id, doc) in docs.iter_mut() {
                    Self::upgrade_v1_document(id, doc)?;
                }
                db.set_marker_version(&schema, to_version);
                self.persist(&db)?;
                Ok(())
            }
            MigrationStrategy::RecreateAndCopy => self.mutate(|db| {
                let mut rebuilt = Collection::new();
                for (id, mut doc) in db.collection(&jobs).cloned().unwrap_or_default() {
                    Self::upgrade_v1_document(&id, &mut doc)?;
                    rebuilt.insert(id, doc);
                }
                db.collections.insert(jobs, rebuilt);
                db.set_marker_version(&schema, to_version);
                Ok(((), true))
            }),
        }
    }

    fn validate(&self, version: u32) -> Result<()> {
        self.read(|db| {
            let docs = db
                .collection(&self.jobs_collection)
                .ok_or_else(|| StorageError::Corrupt {
                    id: self.jobs_collection.clone(),
                    reason: "collection does not exist".to_string(),
                })?;
            if version >= 2 {
                for doc in db.jobs(&self.jobs_collection)? {
                    doc.state()?;
                }
            } else if let Some((id, _)) = docs.iter().find(|(_, doc)| !doc.is_object()) {
                return Err(StorageError::Corrupt {
                    id: id.clone(),
                    reason: "document is not an object".to_string(),
                });
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::DEFAULT_COLLECTION_PREFIX;
    use tempfile::TempDir;

    fn t0() -> DateTime<Utc> {
        DateTime::from_timestamp_millis(1_700_000_000_000).unwrap()
    }

    fn secs(n: i64) -> chrono::Duration {
        chrono::Duration::seconds(n)
    }

    fn ready_store() -> DocumentJobStore {
        let store = DocumentJobStore::in_memory(DEFAULT_COLLECTION_PREFIX);
        store.initialize(CURRENT_SCHEMA_VERSION).unwrap();
        store
    }

    fn record(id: &str, enqueued_at: DateTime<Utc>) -> JobRecord {
        JobRecord {
            id: id.to_string(),
            job_type: "resize_image".to_string(),
            payload: json!({"width": 640}),
            queue: "default".to_string(),
            state: JobState::Ready,
            enqueued_at,
            scheduled_for: None,
            lease_owner: None,
            lease_expires_at: None,
            attempt_count: 0,
            max_attempts: 2,
            last_error: None,
            created_at: enqueued_at,
            updated_at: enqueued_at,
            version: 0,
            seq: 0,
        }
    }

    fn lease(store: &DocumentJobStore, record: &JobRecord, owner: &str, now: DateTime<Utc>) -> bool {
        store
            .try_lease(&LeaseRequest {
                id: &record.id,
                owner,
                expected_state: record.state,
                expected_version: record.version,
                now,
                expires_at: now + secs(10),
            })
            .unwrap()
    }

    fn v1_document(id: &str, state: &str) -> JsonValue {
        json!({
            "_id": id,
            "seq": 1,
            "queue": "default",
            "job_type": "resize_image",
            "payload": {},
            "state": state,
            "enqueued_at": 1000,
            "scheduled_for": null,
            "attempt_count": 0,
            "max_attempts": 3,
            "last_error": null,
            "created_at": 1000,
            "updated_at": 1000
        })
    }

    #[test]
    fn test_collections_use_prefix() {
        let store = DocumentJobStore::in_memory("Billing");
        store.initialize(CURRENT_SCHEMA_VERSION).unwrap();
        let db = store.lock().unwrap();
        assert!(db.collection("Billing.jobs").is_some());
        assert_eq!(db.marker_version("Billing.schema"), Some(CURRENT_SCHEMA_VERSION));
    }

    #[test]
    fn test_lease_cycle() {
        let store = ready_store();
        store.enqueue(&record("a", t0())).unwrap();
        store.enqueue(&record("b", t0())).unwrap();

        let candidates = store.fetch_leasable("default", t0(), 10).unwrap();
        let ids: Vec<&str> = candidates.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);

        assert!(lease(&store, &candidates[0], "w1", t0()));
        assert!(!lease(&store, &candidates[0], "w2", t0()));
        assert!(store.mark_succeeded("a", "w1", t0()).unwrap());
        assert_eq!(store.get_job("a").unwrap().unwrap().state, JobState::Succeeded);
    }

    #[test]
    fn test_expired_lease_reappears() {
        let store = ready_store();
        store.enqueue(&record("a", t0())).unwrap();
        let candidate = store.fetch_leasable("default", t0(), 1).unwrap().remove(0);
        assert!(lease(&store, &candidate, "w1", t0()));

        assert!(store.fetch_leasable("default", t0() + secs(9), 10).unwrap().is_empty());
        let again = store.fetch_leasable("default", t0() + secs(10), 10).unwrap();
        assert_eq!(again.len(), 1);
        assert!(lease(&store, &again[0], "w2", t0() + secs(10)));
        assert_eq!(store.get_job("a").unwrap().unwrap().attempt_count, 2);
    }

    #[test]
    fn test_failed_retry_and_terminal() {
        let store = ready_store();
        store.enqueue(&record("a", t0())).unwrap();
        let candidate = store.fetch_leasable("default", t0(), 1).unwrap().remove(0);
        assert!(lease(&store, &candidate, "w1", t0()));
        assert!(store
            .mark_failed(
                "a",
                "w1",
                "timeout",
                FailureDisposition::Retry {
                    next_attempt_at: t0() + secs(5)
                },
                t0()
            )
            .unwrap());
        assert!(store.fetch_leasable("default", t0() + secs(4), 10).unwrap().is_empty());

        let candidate = store.fetch_leasable("default", t0() + secs(5), 1).unwrap().remove(0);
        assert!(lease(&store, &candidate, "w1", t0() + secs(5)));
        assert!(store
            .mark_failed("a", "w1", "timeout", FailureDisposition::Terminal, t0() + secs(5))
            .unwrap());

        let job = store.get_job("a").unwrap().unwrap();
        assert_eq!(job.state, JobState::FailedTerminal);
        assert_eq!(job.attempt_count, 2);
        assert_eq!(job.last_error.as_deref(), Some("timeout"));
    }

    #[test]
    fn test_conflicting_lease_does_not_write() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("jobs.json");
        let store = DocumentJobStore::open(&path, DEFAULT_COLLECTION_PREFIX).unwrap();
        store.initialize(CURRENT_SCHEMA_VERSION).unwrap();
        store.enqueue(&record("a", t0())).unwrap();
        let candidate = store.fetch_leasable("default", t0(), 1).unwrap().remove(0);
        assert!(lease(&store, &candidate, "w1", t0()));

        let before = std::fs::metadata(&path).unwrap().modified().unwrap();
        let content_before = std::fs::read_to_string(&path).unwrap();
        assert!(!lease(&store, &candidate, "w2", t0()));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), content_before);
        assert_eq!(std::fs::metadata(&path).unwrap().modified().unwrap(), before);
    }

    #[test]
    fn test_file_store_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("jobs.json");
        {
            let store = DocumentJobStore::open(&path, DEFAULT_COLLECTION_PREFIX).unwrap();
            store.initialize(CURRENT_SCHEMA_VERSION).unwrap();
            store.enqueue(&record("a", t0())).unwrap();
        }
        let store = DocumentJobStore::open(&path, DEFAULT_COLLECTION_PREFIX).unwrap();
        assert_eq!(store.current_version().unwrap(), Some(CURRENT_SCHEMA_VERSION));
        let job = store.get_job("a").unwrap().unwrap();
        assert_eq!(job.seq, 1);
        assert_eq!(job.enqueued_at, t0());
    }

    #[test]
    fn test_handles_sharing_a_file_see_each_others_writes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("jobs.json");
        let server = DocumentJobStore::open(&path, DEFAULT_COLLECTION_PREFIX).unwrap();
        server.initialize(CURRENT_SCHEMA_VERSION).unwrap();
        let cli = DocumentJobStore::open(&path, DEFAULT_COLLECTION_PREFIX).unwrap();

        cli.enqueue(&record("from-cli", t0())).unwrap();
        server.enqueue(&record("from-server", t0() + secs(1))).unwrap();

        for store in [&server, &cli] {
            let ids: Vec<String> = store
                .fetch_leasable("default", t0() + secs(1), 10)
                .unwrap()
                .into_iter()
                .map(|r| r.id)
                .collect();
            assert_eq!(ids, vec!["from-cli", "from-server"]);
        }
        assert_eq!(server.get_job("from-cli").unwrap().unwrap().seq, 1);
        assert_eq!(cli.get_job("from-server").unwrap().unwrap().seq, 2);

        let reopened = DocumentJobStore::open(&path, DEFAULT_COLLECTION_PREFIX).unwrap();
        assert_eq!(reopened.queue_stats("default").unwrap().ready, 2);
    }

    #[test]
    fn test_handles_race_for_one_lease() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("jobs.json");
        let first = DocumentJobStore::open(&path, DEFAULT_COLLECTION_PREFIX).unwrap();
        first.initialize(CURRENT_SCHEMA_VERSION).unwrap();
        first.enqueue(&record("a", t0())).unwrap();
        let second = DocumentJobStore::open(&path, DEFAULT_COLLECTION_PREFIX).unwrap();

        // Both handles read the same candidate before either leases it
        let candidate = first.fetch_leasable("default", t0(), 1).unwrap().remove(0);
        let won: Vec<bool> = std::thread::scope(|scope| {
            let racers: Vec<_> = [(&first, "w1"), (&second, "w2")]
                .into_iter()
                .map(|(store, owner)| {
                    let candidate = &candidate;
                    scope.spawn(move || lease(store, candidate, owner, t0()))
                })
                .collect();
            racers.into_iter().map(|racer| racer.join().unwrap()).collect()
        });
        assert_eq!(won.iter().filter(|won| **won).count(), 1);

        let job = second.get_job("a").unwrap().unwrap();
        assert_eq!(job.state, JobState::Leased);
        assert_eq!(job.attempt_count, 1);
    }

    #[test]
    fn test_unmarked_jobs_collection_reads_as_v1() {
        let store = DocumentJobStore::in_memory(DEFAULT_COLLECTION_PREFIX);
        assert_eq!(store.current_version().unwrap(), None);
        store.insert_raw_document("old", v1_document("old", "ready"));
        assert_eq!(store.current_version().unwrap(), Some(1));
    }

    #[test]
    fn test_in_place_upgrade_from_v1() {
        let store = DocumentJobStore::in_memory(DEFAULT_COLLECTION_PREFIX);
        store.initialize(1).unwrap();
        store.insert_raw_document("old", v1_document("old", "leased"));

        store.apply_step(2, MigrationStrategy::InPlace).unwrap();
        store.validate(2).unwrap();
        assert_eq!(store.current_version().unwrap(), Some(2));

        let job = store.get_job("old").unwrap().unwrap();
        assert_eq!(job.state, JobState::Ready);
        assert_eq!(job.version, 0);
        assert_eq!(job.lease_owner, None);
    }

    #[test]
    fn test_recreate_and_copy_aborts_without_touching_original() {
        let store = DocumentJobStore::in_memory(DEFAULT_COLLECTION_PREFIX);
        store.initialize(1).unwrap();
        store.insert_raw_document("good", v1_document("good", "ready"));
        store.insert_raw_document("zz-bad", json!("not a document"));

        let err = store
            .apply_step(2, MigrationStrategy::RecreateAndCopy)
            .unwrap_err();
        assert!(matches!(err, StorageError::Corrupt { .. }));

        assert_eq!(store.current_version().unwrap(), Some(1));
        let good = store.raw_document("good").unwrap();
        assert!(good.get("version").is_none());
    }

    #[test]
    fn test_in_place_failure_is_repaired_by_snapshot() {
        let store = DocumentJobStore::in_memory(DEFAULT_COLLECTION_PREFIX);
        store.initialize(1).unwrap();
        store.insert_raw_document("a-good", v1_document("a-good", "ready"));
        store.insert_raw_document("z-bad", json!({"_id": "z-bad"}));

        let snapshot = store.snapshot(1).unwrap();
        assert!(store.apply_step(2, MigrationStrategy::InPlace).is_err());
        // Partially upgraded
        assert!(store.raw_document("a-good").unwrap().get("version").is_some());

        store.restore_snapshot(&snapshot).unwrap();
        assert_eq!(store.current_version().unwrap(), Some(1));
        assert!(store.raw_document("a-good").unwrap().get("version").is_none());
    }
}
