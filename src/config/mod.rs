mod file_config;

pub use file_config::{FileConfig, MigrationConfig, QueueConfig, StorageConfig, WorkerConfig};

use crate::migration::{BackupPolicy, MigrationPlan, MigrationStrategy};
use crate::queue::{
    QueueSettings, RetryPolicy, DEFAULT_LEASE_DURATION, DEFAULT_MAX_ATTEMPTS,
    DEFAULT_RETRY_BASE_DELAY, DEFAULT_RETRY_MAX_DELAY,
};
use crate::storage::{BackendKind, StorageSettings, StorageTarget, DEFAULT_COLLECTION_PREFIX};
use crate::worker::{
    WorkerSettings, DEFAULT_BATCH_SIZE, DEFAULT_JITTER, DEFAULT_POLL_INTERVAL, DEFAULT_QUEUE,
    DEFAULT_RENEW_INTERVAL, DEFAULT_SERVER_NAME, DEFAULT_SWEEP_INTERVAL,
    DEFAULT_WORKERS_PER_QUEUE,
};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_FINISHED_RETENTION_HOURS: u64 = 24 * 7;
pub const DEFAULT_METRICS_PORT: u16 = 9091;

/// Longest value any duration setting may take.
pub const MAX_SETTING_DURATION: Duration = Duration::from_secs(365 * 24 * 3600);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("{0} must be specified via the command line or in the config file")]
    Missing(&'static str),

    #[error("Invalid {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

fn invalid(key: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        key,
        reason: reason.into(),
    }
}

fn bounded(key: &'static str, duration: Duration) -> Result<Duration, ConfigError> {
    if duration > MAX_SETTING_DURATION {
        return Err(invalid(
            key,
            format!(
                "must not exceed {} days",
                MAX_SETTING_DURATION.as_secs() / 86_400
            ),
        ));
    }
    Ok(duration)
}

fn hours_setting(key: &'static str, hours: u64) -> Result<Duration, ConfigError> {
    let secs = hours
        .checked_mul(3600)
        .ok_or_else(|| invalid(key, format!("{} hours is out of range", hours)))?;
    bounded(key, Duration::from_secs(secs))
}

/// CLI arguments that can be used for config resolution.
/// Every field can be overridden by the TOML config.
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    pub backend: Option<String>,
    pub connection_string: Option<String>,
    pub collection_prefix: Option<String>,
    pub server_name: Option<String>,
    /// Empty means "not given".
    pub queues: Vec<String>,
    pub workers_per_queue: Option<usize>,
    pub metrics_port: Option<u16>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub server_name: String,
    /// `None` disables the metrics endpoint.
    pub metrics_port: Option<u16>,
    pub storage: StorageSettings,
    pub queue: QueueSettings,
    pub worker: WorkerSettings,
    pub migration: MigrationPlan,
    /// `None` disables the purge maintenance job.
    pub finished_retention: Option<Duration>,
}

impl AppConfig {
    /// Resolve configuration from CLI arguments and optional TOML file config.
    /// TOML values override CLI values where present.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self, ConfigError> {
        let file = file_config.unwrap_or_default();

        let server_name = file
            .server_name
            .or_else(|| cli.server_name.clone())
            .unwrap_or_else(|| DEFAULT_SERVER_NAME.to_string());
        if server_name.trim().is_empty() {
            return Err(invalid("server_name", "must not be empty"));
        }

        let metrics_port = match file
            .metrics_port
            .or(cli.metrics_port)
            .unwrap_or(DEFAULT_METRICS_PORT)
        {
            0 => None,
            port => Some(port),
        };

        let storage = Self::resolve_storage(cli, file.storage.unwrap_or_default())?;
        let queue = Self::resolve_queue(file.queue.unwrap_or_default())?;

        let worker_file = file.worker.unwrap_or_default();
        let finished_retention = match worker_file
            .finished_retention_hours
            .unwrap_or(DEFAULT_FINISHED_RETENTION_HOURS)
        {
            0 => None,
            hours => Some(hours_setting("worker.finished_retention_hours", hours)?),
        };
        let worker = Self::resolve_worker(cli, worker_file, &server_name, &queue)?;

        let migration_file = file.migration.unwrap_or_default();
        let strategy = match migration_file.strategy {
            Some(s) => MigrationStrategy::parse(&s)
                .ok_or_else(|| invalid("migration.strategy", format!("unknown strategy '{}'", s)))?,
            None => MigrationStrategy::default(),
        };
        let backup = match migration_file.backup {
            Some(s) => BackupPolicy::parse(&s)
                .ok_or_else(|| invalid("migration.backup", format!("unknown backup policy '{}'", s)))?,
            None => BackupPolicy::default(),
        };

        Ok(Self {
            server_name,
            metrics_port,
            storage,
            queue,
            worker,
            migration: MigrationPlan::new(strategy, backup),
            finished_retention,
        })
    }

    fn resolve_storage(
        cli: &CliConfig,
        file: StorageConfig,
    ) -> Result<StorageSettings, ConfigError> {
        let backend_name = file
            .backend
            .or_else(|| cli.backend.clone())
            .ok_or(ConfigError::Missing("storage.backend"))?;
        let backend = BackendKind::parse(&backend_name).ok_or_else(|| {
            invalid(
                "storage.backend",
                format!(
                    "unknown backend '{}', expected 'document' or 'relational'",
                    backend_name
                ),
            )
        })?;

        let connection_string = file
            .connection_string
            .or_else(|| cli.connection_string.clone())
            .filter(|s| !s.trim().is_empty())
            .ok_or(ConfigError::Missing("storage.connection_string"))?;
        let target = StorageTarget::parse(backend, &connection_string).ok_or_else(|| {
            invalid(
                "storage.connection_string",
                format!(
                    "'{}' is not a valid {} connection string",
                    connection_string, backend
                ),
            )
        })?;
        if let StorageTarget::File(path) = &target {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                if !parent.is_dir() {
                    return Err(invalid(
                        "storage.connection_string",
                        format!("directory {:?} does not exist", parent),
                    ));
                }
            }
        }

        let collection_prefix = file
            .collection_prefix
            .or_else(|| cli.collection_prefix.clone())
            .unwrap_or_else(|| DEFAULT_COLLECTION_PREFIX.to_string());
        if collection_prefix.trim().is_empty() {
            return Err(invalid("storage.collection_prefix", "must not be empty"));
        }

        Ok(StorageSettings {
            backend,
            target,
            collection_prefix,
        })
    }

    fn resolve_queue(file: QueueConfig) -> Result<QueueSettings, ConfigError> {
        let lease_duration = file
            .lease_duration_secs
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_LEASE_DURATION);
        if lease_duration.is_zero() {
            return Err(invalid("queue.lease_duration_secs", "must be positive"));
        }
        bounded("queue.lease_duration_secs", lease_duration)?;

        let max_attempts = file.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS);
        if max_attempts == 0 {
            return Err(invalid("queue.max_attempts", "must be at least 1"));
        }

        let base_delay = file
            .retry_base_delay_secs
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_RETRY_BASE_DELAY);
        let max_delay = file
            .retry_max_delay_secs
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_RETRY_MAX_DELAY);
        bounded("queue.retry_base_delay_secs", base_delay)?;
        bounded("queue.retry_max_delay_secs", max_delay)?;
        if max_delay < base_delay {
            return Err(invalid(
                "queue.retry_max_delay_secs",
                format!(
                    "{}s is shorter than the base delay {}s",
                    max_delay.as_secs(),
                    base_delay.as_secs()
                ),
            ));
        }

        Ok(QueueSettings {
            lease_duration,
            default_max_attempts: max_attempts,
            retry_policy: RetryPolicy::new(base_delay, max_delay),
        })
    }

    fn resolve_worker(
        cli: &CliConfig,
        file: WorkerConfig,
        server_name: &str,
        queue: &QueueSettings,
    ) -> Result<WorkerSettings, ConfigError> {
        let queues = file
            .queues
            .or_else(|| (!cli.queues.is_empty()).then(|| cli.queues.clone()))
            .unwrap_or_else(|| vec![DEFAULT_QUEUE.to_string()]);
        if queues.is_empty() || queues.iter().any(|q| q.trim().is_empty()) {
            return Err(invalid("worker.queues", "queue names must be non-empty"));
        }

        let workers_per_queue = file
            .workers_per_queue
            .or(cli.workers_per_queue)
            .unwrap_or(DEFAULT_WORKERS_PER_QUEUE);
        if workers_per_queue == 0 {
            return Err(invalid("worker.workers_per_queue", "must be at least 1"));
        }

        let batch_size = file.batch_size.unwrap_or(DEFAULT_BATCH_SIZE);
        if batch_size == 0 {
            return Err(invalid("worker.batch_size", "must be at least 1"));
        }

        let poll_interval = file
            .poll_interval_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_POLL_INTERVAL);
        if poll_interval.is_zero() {
            return Err(invalid("worker.poll_interval_ms", "must be positive"));
        }
        bounded("worker.poll_interval_ms", poll_interval)?;

        let jitter = bounded(
            "worker.jitter_ms",
            file.jitter_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_JITTER),
        )?;

        let renew_interval = file
            .renew_interval_secs
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_RENEW_INTERVAL);
        if renew_interval.is_zero() || renew_interval >= queue.lease_duration {
            return Err(invalid(
                "worker.renew_interval_secs",
                format!(
                    "must be positive and shorter than the lease duration ({}s)",
                    queue.lease_duration.as_secs()
                ),
            ));
        }

        let sweep_interval = match file.sweep_interval_secs {
            Some(0) => None,
            Some(secs) => Some(bounded(
                "worker.sweep_interval_secs",
                Duration::from_secs(secs),
            )?),
            None => Some(DEFAULT_SWEEP_INTERVAL),
        };

        Ok(WorkerSettings {
            server_name: server_name.to_string(),
            queues,
            workers_per_queue,
            batch_size,
            poll_interval,
            jitter,
            renew_interval,
            sweep_interval,
            shutdown_when_queue_empty: false,
        })
    }
}
