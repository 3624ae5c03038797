use super::models::{from_millis, to_millis};
use super::sqlite_schema::{normalize_after_step, schema_for, JOBS_TABLE_NAME};
use super::{
    FailureDisposition, JobRecord, JobState, JobStore, LeaseRequest, MigrationStrategy,
    QueueStats, Result, SchemaStore, SnapshotRef, StorageError,
};
use crate::sqlite_persistence::{read_db_version, SchemaError};
use chrono::{DateTime, Utc};
use rusqlite::{params, types::Type, Connection, OptionalExtension, Row, TransactionBehavior};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info};

const JOB_COLUMNS: &str = "id, seq, queue, job_type, payload, state, enqueued_at, scheduled_for, \
     attempt_count, max_attempts, last_error, created_at, updated_at, lease_owner, \
     lease_expires_at, version";

/// How long a connection waits on a database locked by another process.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Relational backend.
///
/// One connection guarded by a mutex serializes access within the process.
/// Across processes sharing the file, the `version` guard in every
/// transition keeps lease acquisition exclusive.
pub struct SqliteJobStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteJobStore {
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref())?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let journal_mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        debug!(
            "Opened SQLite job store at {:?} (journal mode {})",
            db_path.as_ref(),
            journal_mode
        );
        Ok(Self::from_connection(conn))
    }

    pub fn in_memory() -> Result<Self> {
        Ok(Self::from_connection(Connection::open_in_memory()?))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StorageError::Poisoned)
    }

    fn row_to_job(row: &Row) -> rusqlite::Result<JobRecord> {
        let state_str: String = row.get("state")?;
        let state = JobState::parse(&state_str).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                5,
                Type::Text,
                format!("Unknown job state '{}'", state_str).into(),
            )
        })?;
        let payload_str: String = row.get("payload")?;
        let payload = serde_json::from_str(&payload_str).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(4, Type::Text, Box::new(e))
        })?;

        Ok(JobRecord {
            id: row.get("id")?,
            job_type: row.get("job_type")?,
            payload,
            queue: row.get("queue")?,
            state,
            enqueued_at: Self::timestamp(row, "enqueued_at")?,
            scheduled_for: Self::optional_timestamp(row, "scheduled_for")?,
            lease_owner: row.get("lease_owner")?,
            lease_expires_at: Self::optional_timestamp(row, "lease_expires_at")?,
            attempt_count: row.get("attempt_count")?,
            max_attempts: row.get("max_attempts")?,
            last_error: row.get("last_error")?,
            created_at: Self::timestamp(row, "created_at")?,
            updated_at: Self::timestamp(row, "updated_at")?,
            version: row.get("version")?,
            seq: row.get("seq")?,
        })
    }

    fn timestamp(row: &Row, column: &str) -> rusqlite::Result<DateTime<Utc>> {
        let ms: i64 = row.get(column)?;
        from_millis(ms).ok_or(rusqlite::Error::IntegralValueOutOfRange(0, ms))
    }

    fn optional_timestamp(row: &Row, column: &str) -> rusqlite::Result<Option<DateTime<Utc>>> {
        match row.get::<_, Option<i64>>(column)? {
            Some(ms) => from_millis(ms)
                .map(Some)
                .ok_or(rusqlite::Error::IntegralValueOutOfRange(0, ms)),
            None => Ok(None),
        }
    }

    /// Hands expired leases back, or fails them when no attempt is left.
    fn expire_leases(conn: &Connection, queue: Option<&str>, now_ms: i64) -> Result<usize> {
        let sql = "UPDATE jobs SET \
                 state = CASE WHEN attempt_count < max_attempts THEN 'ready' ELSE 'failed_terminal' END, \
                 last_error = 'Lease expired (owner ' || lease_owner || ')', \
                 lease_owner = NULL, lease_expires_at = NULL, \
                 version = version + 1, updated_at = ?1 \
             WHERE state = 'leased' AND lease_expires_at <= ?1";
        let count = match queue {
            Some(queue) => conn.execute(&format!("{} AND queue = ?2", sql), params![now_ms, queue])?,
            None => conn.execute(sql, params![now_ms])?,
        };
        Ok(count)
    }

    fn has_jobs_table(conn: &Connection) -> Result<bool> {
        Ok(conn
            .prepare("SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1")?
            .exists(params![JOBS_TABLE_NAME])?)
    }

    fn schema(version: u32) -> Result<&'static crate::sqlite_persistence::VersionedSchema> {
        schema_for(version).ok_or(StorageError::UnsupportedVersion(version))
    }
}

impl JobStore for SqliteJobStore {
    fn ping(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
        Ok(())
    }

    fn enqueue(&self, record: &JobRecord) -> Result<String> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO jobs (id, seq, queue, job_type, payload, state, enqueued_at, \
                 scheduled_for, attempt_count, max_attempts, last_error, created_at, updated_at, \
                 lease_owner, lease_expires_at, version) \
             VALUES (?1, (SELECT COALESCE(MAX(seq), 0) + 1 FROM jobs), ?2, ?3, ?4, ?5, ?6, ?7, \
                 ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                record.id,
                record.queue,
                record.job_type,
                serde_json::to_string(&record.payload)?,
                record.state.as_str(),
                to_millis(&record.enqueued_at),
                record.scheduled_for.as_ref().map(to_millis),
                record.attempt_count,
                record.max_attempts,
                record.last_error,
                to_millis(&record.created_at),
                to_millis(&record.updated_at),
                record.lease_owner,
                record.lease_expires_at.as_ref().map(to_millis),
                record.version,
            ],
        )?;
        Ok(record.id.clone())
    }

    fn get_job(&self, id: &str) -> Result<Option<JobRecord>> {
        let conn = self.lock()?;
        let record = conn
            .query_row(
                &format!("SELECT {} FROM jobs WHERE id = ?1", JOB_COLUMNS),
                params![id],
                Self::row_to_job,
            )
            .optional()?;
        Ok(record)
    }

    fn fetch_leasable(
        &self,
        queue: &str,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<JobRecord>> {
        let now_ms = to_millis(&now);
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let expired = Self::expire_leases(&tx, Some(queue), now_ms)?;
        if expired > 0 {
            info!("Reclaimed {} expired leases in queue {}", expired, queue);
        }
        tx.execute(
            "UPDATE jobs SET state = 'ready', version = version + 1, updated_at = ?2 \
             WHERE queue = ?1 AND state = 'scheduled' AND scheduled_for <= ?2",
            params![queue, now_ms],
        )?;

        let records = {
            let mut stmt = tx.prepare(&format!(
                "SELECT {} FROM jobs \
                 WHERE queue = ?1 AND state = 'ready' AND COALESCE(scheduled_for, enqueued_at) <= ?2 \
                 ORDER BY COALESCE(scheduled_for, enqueued_at) ASC, enqueued_at ASC, seq ASC \
                 LIMIT ?3",
                JOB_COLUMNS
            ))?;
            let rows = stmt
                .query_map(params![queue, now_ms, limit as i64], Self::row_to_job)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };
        tx.commit()?;
        Ok(records)
    }

    fn try_lease(&self, request: &LeaseRequest<'_>) -> Result<bool> {
        if !matches!(
            request.expected_state,
            JobState::Ready | JobState::Scheduled
        ) {
            return Ok(false);
        }
        let now_ms = to_millis(&request.now);
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE jobs SET state = 'leased', lease_owner = ?1, lease_expires_at = ?2, \
                 attempt_count = attempt_count + 1, version = version + 1, updated_at = ?3 \
             WHERE id = ?4 AND state = ?5 AND version = ?6 \
                 AND attempt_count < max_attempts \
                 AND COALESCE(scheduled_for, enqueued_at) <= ?3",
            params![
                request.owner,
                to_millis(&request.expires_at),
                now_ms,
                request.id,
                request.expected_state.as_str(),
                request.expected_version,
            ],
        )?;
        Ok(changed == 1)
    }

    fn mark_succeeded(&self, id: &str, owner: &str, now: DateTime<Utc>) -> Result<bool> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE jobs SET state = 'succeeded', lease_owner = NULL, lease_expires_at = NULL, \
                 version = version + 1, updated_at = ?3 \
             WHERE id = ?1 AND state = 'leased' AND lease_owner = ?2",
            params![id, owner, to_millis(&now)],
        )?;
        Ok(changed == 1)
    }

    fn mark_failed(
        &self,
        id: &str,
        owner: &str,
        error: &str,
        disposition: FailureDisposition,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.lock()?;
        let changed = match disposition {
            FailureDisposition::Retry { next_attempt_at } => {
                let state = if next_attempt_at <= now {
                    JobState::Ready
                } else {
                    JobState::Scheduled
                };
                conn.execute(
                    "UPDATE jobs SET state = ?4, scheduled_for = ?5, last_error = ?3, \
                         lease_owner = NULL, lease_expires_at = NULL, \
                         version = version + 1, updated_at = ?6 \
                     WHERE id = ?1 AND state = 'leased' AND lease_owner = ?2",
                    params![
                        id,
                        owner,
                        error,
                        state.as_str(),
                        to_millis(&next_attempt_at),
                        to_millis(&now)
                    ],
                )?
            }
            FailureDisposition::Terminal => conn.execute(
                "UPDATE jobs SET state = 'failed_terminal', last_error = ?3, \
                     lease_owner = NULL, lease_expires_at = NULL, \
                     version = version + 1, updated_at = ?4 \
                 WHERE id = ?1 AND state = 'leased' AND lease_owner = ?2",
                params![id, owner, error, to_millis(&now)],
            )?,
        };
        Ok(changed == 1)
    }

    fn renew_lease(
        &self,
        id: &str,
        owner: &str,
        new_expiry: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE jobs SET lease_expires_at = ?3, version = version + 1, updated_at = ?4 \
             WHERE id = ?1 AND state = 'leased' AND lease_owner = ?2 AND lease_expires_at > ?4",
            params![id, owner, to_millis(&new_expiry), to_millis(&now)],
        )?;
        Ok(changed == 1)
    }

    fn release_lease(&self, id: &str, owner: &str, now: DateTime<Utc>) -> Result<bool> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE jobs SET state = 'ready', attempt_count = MAX(attempt_count - 1, 0), \
                 lease_owner = NULL, lease_expires_at = NULL, \
                 version = version + 1, updated_at = ?3 \
             WHERE id = ?1 AND state = 'leased' AND lease_owner = ?2",
            params![id, owner, to_millis(&now)],
        )?;
        Ok(changed == 1)
    }

    fn reclaim_expired_leases(&self, now: DateTime<Utc>) -> Result<usize> {
        let conn = self.lock()?;
        Self::expire_leases(&conn, None, to_millis(&now))
    }

    fn queue_stats(&self, queue: &str) -> Result<QueueStats> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT state, COUNT(*) FROM jobs WHERE queue = ?1 GROUP BY state")?;
        let rows = stmt
            .query_map(params![queue], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut stats = QueueStats::default();
        for (state, count) in rows {
            let state = JobState::parse(&state).ok_or_else(|| StorageError::Corrupt {
                id: format!("queue {}", queue),
                reason: format!("unknown state '{}'", state),
            })?;
            stats.add(state, count as u64);
        }
        Ok(stats)
    }

    fn purge_finished(&self, before: DateTime<Utc>) -> Result<usize> {
        let conn = self.lock()?;
        let deleted = conn.execute(
            "DELETE FROM jobs WHERE state IN ('succeeded', 'failed_terminal') AND updated_at < ?1",
            params![to_millis(&before)],
        )?;
        Ok(deleted)
    }

    fn has_active_job(&self, queue: &str, job_type: &str) -> Result<bool> {
        let conn = self.lock()?;
        let exists = conn
            .prepare(
                "SELECT 1 FROM jobs WHERE queue = ?1 AND job_type = ?2 \
                 AND state NOT IN ('succeeded', 'failed_terminal')",
            )?
            .exists(params![queue, job_type])?;
        Ok(exists)
    }
}

impl SchemaStore for SqliteJobStore {
    fn backend_name(&self) -> &'static str {
        "relational"
    }

    fn current_version(&self) -> Result<Option<u32>> {
        let conn = self.lock()?;
        match read_db_version(&conn)? {
            Some(version) => Ok(Some(version as u32)),
            None if Self::has_jobs_table(&conn)? => Err(SchemaError::Mismatch(
                "Table jobs exists but the database carries no schema version".to_string(),
            )
            .into()),
            None => Ok(None),
        }
    }

    fn initialize(&self, version: u32) -> Result<()> {
        let schema = Self::schema(version)?;
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        schema.create(&tx)?;
        tx.commit()?;
        info!("Created job tables at schema version {}", version);
        Ok(())
    }

    fn snapshot(&self, version: u32) -> Result<SnapshotRef> {
        let name = format!(
            "{}_backup_v{}_{}",
            JOBS_TABLE_NAME,
            version,
            Utc::now().timestamp_millis()
        );
        let conn = self.lock()?;
        conn.execute(
            &format!("CREATE TABLE {} AS SELECT * FROM {}", name, JOBS_TABLE_NAME),
            [],
        )?;
        Ok(SnapshotRef { name, version })
    }

    fn restore_snapshot(&self, snapshot: &SnapshotRef) -> Result<()> {
        let schema = Self::schema(snapshot.version)?;
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute(&format!("DROP TABLE IF EXISTS {}", JOBS_TABLE_NAME), [])?;
        for table in schema.tables {
            table.create(&tx)?;
        }
        tx.execute(
            &format!(
                "INSERT INTO {} SELECT * FROM {}",
                JOBS_TABLE_NAME, snapshot.name
            ),
            [],
        )?;
        schema.write_version(&tx)?;
        tx.commit()?;
        Ok(())
    }

    fn apply_step(&self, to_version: u32, strategy: MigrationStrategy) -> Result<()> {
        let target = Self::schema(to_version)?;
        let previous = Self::schema(to_version.saturating_sub(1))?;
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        match (strategy, target.migration) {
            (MigrationStrategy::InPlace, Some(migration_fn)) => migration_fn(&tx)?,
            _ => target.recreate_from(previous, &tx)?,
        }
        normalize_after_step(to_version, &tx)?;
        target.write_version(&tx)?;
        tx.commit()?;
        Ok(())
    }

    fn validate(&self, version: u32) -> Result<()> {
        let schema = Self::schema(version)?;
        let conn = self.lock()?;
        schema.validate(&conn)?;
        Ok(())
    }
}
