use super::ConfigError;
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FileConfig {
    pub server_name: Option<String>,
    /// 0 disables the metrics endpoint
    pub metrics_port: Option<u16>,

    pub storage: Option<StorageConfig>,
    pub queue: Option<QueueConfig>,
    pub worker: Option<WorkerConfig>,
    pub migration: Option<MigrationConfig>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct StorageConfig {
    /// "document" (aliases "document-store", "mongodb") or "relational" ("sqlite")
    pub backend: Option<String>,
    pub connection_string: Option<String>,
    pub collection_prefix: Option<String>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct QueueConfig {
    pub lease_duration_secs: Option<u64>,
    pub max_attempts: Option<u32>,
    pub retry_base_delay_secs: Option<u64>,
    pub retry_max_delay_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct WorkerConfig {
    pub queues: Option<Vec<String>>,
    pub workers_per_queue: Option<usize>,
    pub batch_size: Option<usize>,
    pub poll_interval_ms: Option<u64>,
    pub jitter_ms: Option<u64>,
    pub renew_interval_secs: Option<u64>,
    /// 0 disables the lease sweeper
    pub sweep_interval_secs: Option<u64>,
    /// 0 disables the purge maintenance job
    pub finished_retention_hours: Option<u64>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct MigrationConfig {
    /// "in_place" or "recreate_and_copy"
    pub strategy: Option<String>,
    /// "none" or "snapshot"
    pub backup: Option<String>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}
