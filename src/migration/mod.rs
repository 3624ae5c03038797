//! Schema migrator.
//!
//! Runs once at startup, before any job traffic. Detects the stored schema
//! version and applies the missing steps in ascending order, optionally taking
//! a snapshot before each one. A store already at the target version is only
//! validated, never written to.

pub use crate::storage::{MigrationStrategy, SnapshotRef};

use crate::storage::{SchemaStore, StorageError, CURRENT_SCHEMA_VERSION};
use thiserror::Error;
use tracing::{error, info, warn};

/// Whether to back up job data before a migration step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackupPolicy {
    None,
    #[default]
    SnapshotBeforeMigrate,
}

impl BackupPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupPolicy::None => "none",
            BackupPolicy::SnapshotBeforeMigrate => "snapshot",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "none" | "off" => Some(BackupPolicy::None),
            "snapshot" | "snapshot_before_migrate" | "collection" => {
                Some(BackupPolicy::SnapshotBeforeMigrate)
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationPlan {
    pub target_version: u32,
    pub strategy: MigrationStrategy,
    pub backup: BackupPolicy,
}

impl MigrationPlan {
    /// Plan towards the schema version of this build.
    pub fn new(strategy: MigrationStrategy, backup: BackupPolicy) -> Self {
        Self {
            target_version: CURRENT_SCHEMA_VERSION,
            strategy,
            backup,
        }
    }

    /// Versions to apply, ascending, starting after `from`.
    pub fn steps(&self, from: u32) -> impl Iterator<Item = u32> {
        (from + 1)..=self.target_version
    }
}

impl Default for MigrationPlan {
    fn default() -> Self {
        Self::new(MigrationStrategy::default(), BackupPolicy::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationOutcome {
    /// Empty store, created at the target version.
    Initialized,
    /// Nothing to do.
    UpToDate,
    Migrated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationReport {
    pub from_version: Option<u32>,
    pub to_version: u32,
    pub steps_applied: Vec<u32>,
    pub snapshots: Vec<SnapshotRef>,
    pub outcome: MigrationOutcome,
}

fn rollback_note(restored: &bool) -> &'static str {
    if *restored {
        "restored from snapshot"
    } else {
        "no snapshot, store may be partially migrated"
    }
}

/// Migration failures. All of them are fatal for startup.
#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("Failed to read schema version from {backend} storage: {source}")]
    Inspect {
        backend: &'static str,
        source: StorageError,
    },

    #[error("Stored schema version {found} is newer than the supported version {supported}")]
    StoreTooNew { found: u32, supported: u32 },

    #[error("Failed to initialize schema version {version}: {source}")]
    Initialize { version: u32, source: StorageError },

    #[error("Failed to snapshot before migrating to version {version}: {source}")]
    Snapshot { version: u32, source: StorageError },

    #[error("Migration to schema version {version} failed ({}): {source}", rollback_note(.restored))]
    StepFailed {
        version: u32,
        restored: bool,
        source: StorageError,
    },

    #[error("Migration to schema version {version} failed ({source}) and restoring snapshot {snapshot} failed: {restore_error}")]
    RollbackFailed {
        version: u32,
        snapshot: String,
        source: StorageError,
        restore_error: StorageError,
    },

    #[error("Schema validation failed for version {version}: {source}")]
    Validation { version: u32, source: StorageError },
}

pub struct SchemaMigrator {
    plan: MigrationPlan,
}

impl SchemaMigrator {
    pub fn new(plan: MigrationPlan) -> Self {
        Self { plan }
    }

    pub fn run(&self, store: &dyn SchemaStore) -> Result<MigrationReport, MigrationError> {
        let backend = store.backend_name();
        let target = self.plan.target_version;
        let current = store
            .current_version()
            .map_err(|source| MigrationError::Inspect { backend, source })?;

        let Some(from) = current else {
            info!(
                "Initializing empty {} storage at schema version {}",
                backend, target
            );
            store
                .initialize(target)
                .map_err(|source| MigrationError::Initialize {
                    version: target,
                    source,
                })?;
            return Ok(MigrationReport {
                from_version: None,
                to_version: target,
                steps_applied: Vec::new(),
                snapshots: Vec::new(),
                outcome: MigrationOutcome::Initialized,
            });
        };

        if from > target {
            return Err(MigrationError::StoreTooNew {
                found: from,
                supported: target,
            });
        }

        if from == target {
            self.validate(store, target)?;
            info!(
                "{} storage is at schema version {}, no migration needed",
                backend, target
            );
            return Ok(MigrationReport {
                from_version: Some(from),
                to_version: target,
                steps_applied: Vec::new(),
                snapshots: Vec::new(),
                outcome: MigrationOutcome::UpToDate,
            });
        }

        // Refuse to build on a layout that is not what its version claims
        self.validate(store, from)?;

        info!(
            "Migrating {} storage from schema version {} to {} (strategy: {}, backup: {})",
            backend,
            from,
            target,
            self.plan.strategy.as_str(),
            self.plan.backup.as_str()
        );

        let mut steps_applied = Vec::new();
        let mut snapshots = Vec::new();
        for version in self.plan.steps(from) {
            let snapshot = match self.plan.backup {
                BackupPolicy::SnapshotBeforeMigrate => {
                    let snapshot = store.snapshot(version - 1).map_err(|source| {
                        MigrationError::Snapshot { version, source }
                    })?;
                    info!("Snapshot {} taken before step {}", snapshot.name, version);
                    Some(snapshot)
                }
                BackupPolicy::None => None,
            };

            info!("Applying schema step {}", version);
            if let Err(source) = store.apply_step(version, self.plan.strategy) {
                error!("Schema step {} failed: {}", version, source);
                return Err(match snapshot {
                    Some(snapshot) => match store.restore_snapshot(&snapshot) {
                        Ok(()) => {
                            warn!("Restored snapshot {} after failed step", snapshot.name);
                            MigrationError::StepFailed {
                                version,
                                restored: true,
                                source,
                            }
                        }
                        Err(restore_error) => MigrationError::RollbackFailed {
                            version,
                            snapshot: snapshot.name,
                            source,
                            restore_error,
                        },
                    },
                    None => MigrationError::StepFailed {
                        version,
                        restored: false,
                        source,
                    },
                });
            }
            steps_applied.push(version);
            snapshots.extend(snapshot);
        }

        self.validate(store, target)?;
        info!("{} storage migrated to schema version {}", backend, target);

        Ok(MigrationReport {
            from_version: Some(from),
            to_version: target,
            steps_applied,
            snapshots,
            outcome: MigrationOutcome::Migrated,
        })
    }

    fn validate(&self, store: &dyn SchemaStore, version: u32) -> Result<(), MigrationError> {
        store
            .validate(version)
            .map_err(|source| MigrationError::Validation { version, source })
    }
}
