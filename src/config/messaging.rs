//! Broadcast bus configuration types.

use std::path::PathBuf;

use serde::Deserialize;

use crate::bus::ipc::DEFAULT_BASE_PATH;

/// Messaging type discriminator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessagingType {
    /// In-process broadcast channel (single worker).
    #[default]
    Channel,
    /// Named-pipe fanout between worker processes.
    Ipc,
}

/// Messaging configuration (discriminated union).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    /// Messaging type discriminator.
    #[serde(rename = "type")]
    pub messaging_type: MessagingType,
    /// IPC-specific configuration.
    pub ipc: IpcBusConfig,
}

/// IPC-specific configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IpcBusConfig {
    /// Directory holding one named pipe per worker.
    pub base_path: PathBuf,
}

impl Default for IpcBusConfig {
    fn default() -> Self {
        Self {
            base_path: PathBuf::from(DEFAULT_BASE_PATH),
        }
    }
}
