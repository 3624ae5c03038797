//! SQLite layout of the job table, one entry per schema version.

use crate::sqlite_column;
use crate::sqlite_persistence::{Column, SqlType, Table, VersionedSchema};
use rusqlite::Connection;

pub const JOBS_TABLE_NAME: &str = "jobs";

// =============================================================================
// Version 1 - Jobs without lease bookkeeping
// =============================================================================

const JOBS_TABLE_V1: Table = Table {
    name: JOBS_TABLE_NAME,
    columns: &[
        sqlite_column!("id", &SqlType::Text, is_primary_key = true),
        sqlite_column!("seq", &SqlType::Integer, non_null = true),
        sqlite_column!("queue", &SqlType::Text, non_null = true),
        sqlite_column!("job_type", &SqlType::Text, non_null = true),
        sqlite_column!("payload", &SqlType::Text, non_null = true),
        sqlite_column!("state", &SqlType::Text, non_null = true),
        sqlite_column!("enqueued_at", &SqlType::Integer, non_null = true),
        sqlite_column!("scheduled_for", &SqlType::Integer),
        sqlite_column!(
            "attempt_count",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
        sqlite_column!("max_attempts", &SqlType::Integer, non_null = true),
        sqlite_column!("last_error", &SqlType::Text),
        sqlite_column!("created_at", &SqlType::Integer, non_null = true),
        sqlite_column!("updated_at", &SqlType::Integer, non_null = true),
    ],
    indices: &[("idx_jobs_queue_state", "queue, state")],
};

// =============================================================================
// Version 2 - Lease owner/expiry and optimistic version counter
// =============================================================================

const JOBS_TABLE_V2: Table = Table {
    name: JOBS_TABLE_NAME,
    columns: &[
        sqlite_column!("id", &SqlType::Text, is_primary_key = true),
        sqlite_column!("seq", &SqlType::Integer, non_null = true),
        sqlite_column!("queue", &SqlType::Text, non_null = true),
        sqlite_column!("job_type", &SqlType::Text, non_null = true),
        sqlite_column!("payload", &SqlType::Text, non_null = true),
        sqlite_column!("state", &SqlType::Text, non_null = true),
        sqlite_column!("enqueued_at", &SqlType::Integer, non_null = true),
        sqlite_column!("scheduled_for", &SqlType::Integer),
        sqlite_column!(
            "attempt_count",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
        sqlite_column!("max_attempts", &SqlType::Integer, non_null = true),
        sqlite_column!("last_error", &SqlType::Text),
        sqlite_column!("created_at", &SqlType::Integer, non_null = true),
        sqlite_column!("updated_at", &SqlType::Integer, non_null = true),
        sqlite_column!("lease_owner", &SqlType::Text),
        sqlite_column!("lease_expires_at", &SqlType::Integer),
        sqlite_column!(
            "version",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
    ],
    indices: &[
        ("idx_jobs_queue_state", "queue, state"),
        (
            "idx_jobs_fetch",
            "queue, state, scheduled_for, enqueued_at",
        ),
        ("idx_jobs_lease_expiry", "state, lease_expires_at"),
    ],
};

fn migrate_v1_to_v2(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "ALTER TABLE jobs ADD COLUMN lease_owner TEXT;
         ALTER TABLE jobs ADD COLUMN lease_expires_at INTEGER;
         ALTER TABLE jobs ADD COLUMN version INTEGER NOT NULL DEFAULT 0;
         CREATE INDEX idx_jobs_fetch ON jobs(queue, state, scheduled_for, enqueued_at);
         CREATE INDEX idx_jobs_lease_expiry ON jobs(state, lease_expires_at);",
    )
}

/// Data fixups that run after the layout of `version` is in place,
/// whichever strategy produced it.
pub fn normalize_after_step(version: u32, conn: &Connection) -> rusqlite::Result<()> {
    if version == 2 {
        // v1 had no lease owner, so a leased row cannot be renewed or
        // completed by anyone: hand it back.
        conn.execute(
            "UPDATE jobs SET state = 'ready', version = version + 1 WHERE state = 'leased'",
            [],
        )?;
    }
    Ok(())
}

pub const JOB_VERSIONED_SCHEMAS: &[VersionedSchema] = &[
    VersionedSchema {
        version: 1,
        tables: &[JOBS_TABLE_V1],
        migration: None,
    },
    VersionedSchema {
        version: 2,
        tables: &[JOBS_TABLE_V2],
        migration: Some(migrate_v1_to_v2),
    },
];

pub fn schema_for(version: u32) -> Option<&'static VersionedSchema> {
    JOB_VERSIONED_SCHEMAS
        .iter()
        .find(|schema| schema.version == version as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::CURRENT_SCHEMA_VERSION;

    #[test]
    fn test_latest_schema_is_current_version() {
        let latest = JOB_VERSIONED_SCHEMAS.last().unwrap();
        assert_eq!(latest.version, CURRENT_SCHEMA_VERSION as usize);
        assert!(schema_for(CURRENT_SCHEMA_VERSION).is_some());
        assert!(schema_for(CURRENT_SCHEMA_VERSION + 1).is_none());
    }

    #[test]
    fn test_in_place_migration_matches_fresh_layout() {
        let conn = Connection::open_in_memory().unwrap();
        schema_for(1).unwrap().create(&conn).unwrap();
        migrate_v1_to_v2(&conn).unwrap();

        // Columns appended by ALTER TABLE land where the v2 declaration expects them
        schema_for(2).unwrap().validate(&conn).unwrap();
    }
}
