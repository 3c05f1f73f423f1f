use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::info;

// Constants for hardcoded values
/// Default Docker Engine API endpoint
pub const DEFAULT_RUNTIME_ENDPOINT: &str = "http://localhost:2375";

/// Default bind address for the daemon API
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0";

/// Default port for the daemon API
pub const DEFAULT_PORT: u16 = 8090;

/// Default maximum compressed size of a single volume archive (1 GiB)
pub const DEFAULT_MAX_ARCHIVE_BYTES: u64 = 1024 * 1024 * 1024;

/// Default timeout for container power actions (start/stop/kill/restart)
pub const DEFAULT_POWER_TIMEOUT_SECS: u64 = 30;

/// Bounded parallelism for archive tree stats and multi-archive purge
pub const DEFAULT_FS_CONCURRENCY: usize = 8;

/// Daemon configuration. Loadable from YAML, with compile-time defaults
/// for every field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub runtime: RuntimeConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Base URL of the Docker Engine HTTP API.
    pub endpoint: String,
    /// Timeout applied to container power actions, in seconds.
    pub power_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root directory holding one volume directory per instance.
    pub volume_root: PathBuf,
    /// Root directory holding per-instance archive subdirectories.
    pub archive_root: PathBuf,
    /// State persistence document (JSON array of {Id, State} records).
    pub state_file: PathBuf,
    /// Maximum cumulative compressed bytes for a single archive.
    pub max_archive_bytes: u64,
    /// Concurrency bound for tree stats and archive purges.
    pub fs_concurrency: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: DEFAULT_BIND_ADDRESS.to_string(),
            port: DEFAULT_PORT,
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_RUNTIME_ENDPOINT.to_string(),
            power_timeout_secs: DEFAULT_POWER_TIMEOUT_SECS,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            volume_root: PathBuf::from("./data/volumes"),
            archive_root: PathBuf::from("./data/archives"),
            state_file: PathBuf::from("./data/state.json"),
            max_archive_bytes: DEFAULT_MAX_ARCHIVE_BYTES,
            fs_concurrency: DEFAULT_FS_CONCURRENCY,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            runtime: RuntimeConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML file, falling back to defaults when
    /// the file is absent. An unreadable or malformed file is an error.
    pub fn load(path: &std::path::Path) -> crate::error::Result<Self> {
        if !path.exists() {
            info!(
                "[Config] No config file at {}, using compile-time defaults",
                path.display()
            );
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&raw).map_err(|e| {
            crate::error::BerthError::Validation(format!(
                "Failed to parse config {}: {}",
                path.display(),
                e
            ))
        })?;

        info!("[Config] Loaded configuration from {}", path.display());
        Ok(config)
    }
}
