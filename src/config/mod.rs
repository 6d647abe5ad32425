//! Application configuration.
//!
//! Aggregates configuration from all modules into a single Config struct
//! that can be loaded from YAML files or environment variables.

mod messaging;
mod server;
mod storage;

pub use messaging::{IpcBusConfig, MessagingConfig, MessagingType};
pub use server::{ClusterConfig, RecoveryConfig, ServerConfig};
pub use storage::{SqliteConfig, StorageConfig, StorageType};

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "chorus.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "CHORUS_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "CHORUS";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "CHORUS_LOG";
/// Environment variable carrying a worker's index (set by the supervisor).
pub const WORKER_INDEX_ENV_VAR: &str = "CHORUS_WORKER_INDEX";

use serde::Deserialize;

/// Errors from configuration validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cluster.workers must be at least 1")]
    NoWorkers,

    #[error("{workers} workers need a cross-process bus; set messaging.type to ipc")]
    InProcessBusWithWorkers { workers: usize },

    #[error("{workers} workers cannot share in-memory storage; set storage.type to sqlite")]
    InMemoryStorageWithWorkers { workers: usize },

    #[error("server.outbound_queue must be at least 1")]
    EmptyOutboundQueue,
}

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Listener configuration.
    pub server: ServerConfig,
    /// Worker process topology.
    pub cluster: ClusterConfig,
    /// Offset store configuration.
    pub storage: StorageConfig,
    /// Broadcast bus configuration.
    pub messaging: MessagingConfig,
    /// Transport-level connection state recovery.
    pub recovery: RecoveryConfig,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `chorus.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    pub fn load(path: Option<&str>) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject topologies that would silently break fanout or dedup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let workers = self.cluster.workers;
        if workers == 0 {
            return Err(ConfigError::NoWorkers);
        }
        if self.server.outbound_queue == 0 {
            return Err(ConfigError::EmptyOutboundQueue);
        }
        if workers > 1 && self.messaging.messaging_type == MessagingType::Channel {
            return Err(ConfigError::InProcessBusWithWorkers { workers });
        }
        if workers > 1 && self.storage.storage_type == StorageType::Memory {
            return Err(ConfigError::InMemoryStorageWithWorkers { workers });
        }
        Ok(())
    }

    /// Create config for testing: in-memory storage, channel bus, ephemeral port.
    pub fn for_test() -> Self {
        let mut config = Self::default();
        config.server.host = "127.0.0.1".to_string();
        config.server.port = 0;
        config.storage.storage_type = StorageType::Memory;
        config
    }
}
