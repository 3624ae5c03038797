use crate::clock::{Clock, SystemClock};
use crate::config::AppConfig;
use crate::migration::{MigrationError, MigrationPlan, MigrationReport, SchemaMigrator};
use crate::queue::QueueSettings;
use crate::storage::{BackendKind, StorageConnection, StorageError, StorageSettings};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("Failed to open {backend} storage: {source}")]
    Open {
        backend: BackendKind,
        source: StorageError,
    },

    #[error("Storage connection check failed for {backend} storage: {source}")]
    Ping {
        backend: BackendKind,
        source: StorageError,
    },

    #[error(transparent)]
    Migration(#[from] MigrationError),
}

/// Everything the queue engine and the workers share, built once at
/// startup and passed down explicitly.
#[derive(Clone)]
pub struct SchedulerContext {
    pub connection: StorageConnection,
    pub queue_settings: QueueSettings,
    pub clock: Arc<dyn Clock>,
}

impl SchedulerContext {
    pub fn new(
        connection: StorageConnection,
        queue_settings: QueueSettings,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            connection,
            queue_settings,
            clock,
        }
    }

    /// Opens the storage, checks it is reachable and brings its schema to
    /// the version this build expects. Any failure is fatal.
    pub fn open(
        storage: &StorageSettings,
        plan: &MigrationPlan,
        queue_settings: QueueSettings,
        clock: Arc<dyn Clock>,
    ) -> Result<(Self, MigrationReport), StartupError> {
        let connection =
            StorageConnection::open(storage).map_err(|source| StartupError::Open {
                backend: storage.backend,
                source,
            })?;

        connection
            .jobs
            .ping()
            .map_err(|source| StartupError::Ping {
                backend: storage.backend,
                source,
            })?;

        let report = SchemaMigrator::new(plan.clone()).run(connection.schema.as_ref())?;
        info!(
            "Storage ready: {} backend at schema version {} ({:?})",
            storage.backend, report.to_version, report.outcome
        );

        Ok((Self::new(connection, queue_settings, clock), report))
    }

    pub fn bootstrap(config: &AppConfig) -> Result<Self, StartupError> {
        let (ctx, _) = Self::open(
            &config.storage,
            &config.migration,
            config.queue.clone(),
            Arc::new(SystemClock),
        )?;
        Ok(ctx)
    }
}
