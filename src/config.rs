//! StripeFS configuration
//!
//! TOML-backed configuration for both sides: the client loads a partition
//! description (the ordered server list plus striping parameters), the
//! server loads its bind/storage/worker settings. Both are validated once
//! at load time; the partition is immutable afterwards and shared read-only
//! by every open file.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default configuration constants.
pub mod defaults {
    /// Default stripe block size: 64KB.
    pub const BLOCK_SIZE: usize = 64 * 1024;

    /// Default replication level (number of extra copies per stripe).
    pub const REPLICATION_LEVEL: usize = 0;

    /// Well-known control port servers listen on.
    pub const CONTROL_PORT: u16 = 3456;

    /// Default worker pool size for the server dispatch core.
    pub const WORKERS: usize = 8;

    /// Default log level.
    pub const fn default_log_level() -> &'static str {
        "info"
    }
}

/// What to do when writing one replica of a stripe fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReplicaWritePolicy {
    /// Fail the whole write on the first replica error.
    Abort,
    /// Keep writing the remaining replicas and report the error afterwards.
    BestEffort,
}

/// How the server schedules operation handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "kebab-case")]
pub enum WorkerMode {
    /// Bounded pool: at most `workers` operations execute at once.
    Pool { workers: usize },
    /// One task per request, unbounded.
    OnDemand,
    /// One operation at a time across the whole server.
    Sequential,
}

impl Default for WorkerMode {
    fn default() -> Self {
        WorkerMode::Pool {
            workers: defaults::WORKERS,
        }
    }
}

/// A partition: the ordered server fleet one logical namespace stripes
/// over. Immutable after load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionConfig {
    /// Partition name (used in log lines only).
    pub name: String,

    /// Ordered server endpoint URLs, `protocol://host[:port]/path`.
    /// Order matters: placement is computed against this list.
    pub servers: Vec<String>,

    /// Stripe block size in bytes.
    #[serde(default = "default_block_size")]
    pub block_size: usize,

    /// Extra copies per stripe (0 = no replication).
    #[serde(default)]
    pub replication_level: usize,

    /// Keep one remote file descriptor open per (file, server) pair
    /// instead of embedding open+op+close in every remote call.
    #[serde(default)]
    pub session_file: bool,

    /// Same discipline for directory handles.
    #[serde(default)]
    pub session_dir: bool,

    /// Use a fresh ephemeral session per request instead of persistent
    /// connections (one extra handshake per call).
    #[serde(default)]
    pub connectionless: bool,

    #[serde(default = "default_replica_write_policy")]
    pub replica_write_policy: ReplicaWritePolicy,

    /// Cluster controller address. Only consulted for reachability
    /// queries, never for data-path decisions.
    #[serde(default)]
    pub controller: Option<String>,
}

fn default_block_size() -> usize {
    defaults::BLOCK_SIZE
}

fn default_replica_write_policy() -> ReplicaWritePolicy {
    ReplicaWritePolicy::Abort
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            servers: Vec::new(),
            block_size: defaults::BLOCK_SIZE,
            replication_level: defaults::REPLICATION_LEVEL,
            session_file: false,
            session_dir: false,
            connectionless: false,
            replica_write_policy: ReplicaWritePolicy::Abort,
            controller: None,
        }
    }
}

impl PartitionConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Read(format!("{}: {e}", path.display())))?;
        let config: PartitionConfig =
            toml::from_str(&contents).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.servers.is_empty() {
            return Err(ConfigError::Validation(
                "partition needs at least one server".to_string(),
            ));
        }
        if self.block_size == 0 {
            return Err(ConfigError::Validation(
                "block_size must be positive".to_string(),
            ));
        }
        if self.replication_level >= self.servers.len() {
            return Err(ConfigError::Validation(format!(
                "replication_level {} needs more than {} servers",
                self.replication_level,
                self.servers.len()
            )));
        }
        for url in &self.servers {
            crate::nfi::ServerUrl::parse(url)
                .map_err(|e| ConfigError::Validation(format!("bad server url '{url}': {e}")))?;
        }
        Ok(())
    }

    pub fn server_count(&self) -> usize {
        self.servers.len()
    }
}

/// Server daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host/interface to bind.
    #[serde(default = "default_bind_host")]
    pub bind_host: String,

    /// Well-known control port.
    #[serde(default = "default_control_port")]
    pub control_port: u16,

    /// Data port; 0 lets the OS choose and the control handshake reports it.
    #[serde(default)]
    pub data_port: u16,

    /// Storage root exported by this server.
    pub storage_root: PathBuf,

    #[serde(default)]
    pub worker_mode: WorkerMode,

    /// Nested partition: when set, this server executes operations against
    /// a nested stripefs client instead of the local disk (hierarchical
    /// deployments).
    #[serde(default)]
    pub nested_partition: Option<PartitionConfig>,

    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_bind_host() -> String {
    "0.0.0.0".to_string()
}

fn default_control_port() -> u16 {
    defaults::CONTROL_PORT
}

fn default_log_level() -> String {
    defaults::default_log_level().to_string()
}

impl ServerConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Read(format!("{}: {e}", path.display())))?;
        let config: ServerConfig =
            toml::from_str(&contents).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bind_host.is_empty() {
            return Err(ConfigError::Validation(
                "bind_host cannot be empty".to_string(),
            ));
        }
        if let WorkerMode::Pool { workers } = self.worker_mode {
            if workers == 0 {
                return Err(ConfigError::Validation(
                    "worker pool size must be positive".to_string(),
                ));
            }
        }
        if let Some(nested) = &self.nested_partition {
            nested.validate()?;
        }
        match self.log_level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => {
                return Err(ConfigError::Validation(format!(
                    "invalid log level: {other}"
                )));
            }
        }
        Ok(())
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Read(String),

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("configuration validation error: {0}")]
    Validation(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn partition(servers: &[&str]) -> PartitionConfig {
        PartitionConfig {
            name: "p1".to_string(),
            servers: servers.iter().map(|s| s.to_string()).collect(),
            block_size: defaults::BLOCK_SIZE,
            replication_level: 0,
            session_file: false,
            session_dir: false,
            connectionless: false,
            replica_write_policy: ReplicaWritePolicy::Abort,
            controller: None,
        }
    }

    #[test]
    fn test_partition_validation() {
        let config = partition(&["tcp://node0:3456/export", "local:///tmp/sfs"]);
        assert!(config.validate().is_ok());

        let empty = partition(&[]);
        assert!(empty.validate().is_err());

        let mut bad_block = partition(&["tcp://node0:3456/export"]);
        bad_block.block_size = 0;
        assert!(bad_block.validate().is_err());

        let mut over_replicated = partition(&["tcp://node0:3456/export"]);
        over_replicated.replication_level = 1;
        assert!(over_replicated.validate().is_err());

        let bad_url = partition(&["nfs://node0/export"]);
        assert!(bad_url.validate().is_err());
    }

    #[test]
    fn test_partition_toml_round_trip() {
        let config = partition(&["tcp://a:1/x", "tcp://b:2/y"]);
        let text = toml::to_string(&config).unwrap();
        let back: PartitionConfig = toml::from_str(&text).unwrap();
        assert_eq!(back.servers, config.servers);
        assert_eq!(back.block_size, config.block_size);
        assert_eq!(back.replica_write_policy, ReplicaWritePolicy::Abort);
    }

    #[test]
    fn test_partition_defaults_from_minimal_toml() {
        let text = r#"
            name = "scratch"
            servers = ["tcp://node0:3456/export"]
        "#;
        let config: PartitionConfig = toml::from_str(text).unwrap();
        assert_eq!(config.block_size, defaults::BLOCK_SIZE);
        assert_eq!(config.replication_level, 0);
        assert!(!config.session_file);
        assert!(!config.connectionless);
    }

    #[test]
    fn test_server_config_validation() {
        let mut config = ServerConfig {
            bind_host: "127.0.0.1".to_string(),
            control_port: 3456,
            data_port: 0,
            storage_root: PathBuf::from("/tmp/sfs"),
            worker_mode: WorkerMode::default(),
            nested_partition: None,
            log_level: "info".to_string(),
        };
        assert!(config.validate().is_ok());

        config.worker_mode = WorkerMode::Pool { workers: 0 };
        assert!(config.validate().is_err());

        config.worker_mode = WorkerMode::Sequential;
        config.log_level = "loud".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_worker_mode_toml_forms() {
        let pool: WorkerMode = toml::from_str("mode = \"pool\"\nworkers = 4").unwrap();
        assert_eq!(pool, WorkerMode::Pool { workers: 4 });
        let seq: WorkerMode = toml::from_str("mode = \"sequential\"").unwrap();
        assert_eq!(seq, WorkerMode::Sequential);
    }
}
