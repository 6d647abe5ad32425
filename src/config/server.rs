//! Listener, worker topology and connection recovery configuration types.

use std::time::Duration;

use serde::Deserialize;

/// Listener configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to.
    pub host: String,
    /// Base port. Shared by every worker unless `cluster.reuse_port` is off.
    pub port: u16,
    /// Depth of each connection's outbound queue.
    ///
    /// A broadcast that finds the queue full fails for that connection only.
    pub outbound_queue: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            outbound_queue: 256,
        }
    }
}

impl ServerConfig {
    /// Listen address for the worker at `index`.
    pub fn addr_for(&self, cluster: &ClusterConfig, index: usize) -> String {
        let port = if cluster.reuse_port || self.port == 0 {
            self.port
        } else {
            self.port.saturating_add(index as u16)
        };
        format!("{}:{}", self.host, port)
    }
}

/// Worker process topology.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Number of worker processes.
    pub workers: usize,
    /// Share one port between workers via `SO_REUSEPORT`.
    ///
    /// When false, worker `i` listens on `server.port + i`.
    pub reuse_port: bool,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            reuse_port: true,
        }
    }
}

/// Transport-level connection state recovery.
///
/// A dropped connection's session is parked on its worker; a reconnect to the
/// same worker within the window gets the broadcasts it missed replayed
/// without a catch-up read.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Enable parking disconnected sessions.
    pub enabled: bool,
    /// How long a parked session stays resumable.
    pub max_disconnection_secs: u64,
    /// Recent broadcasts kept for replay; a client further behind than this
    /// falls back to catch-up.
    pub max_buffered_events: usize,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_disconnection_secs: 120,
            max_buffered_events: 1024,
        }
    }
}

impl RecoveryConfig {
    pub fn max_disconnection(&self) -> Duration {
        Duration::from_secs(self.max_disconnection_secs)
    }
}
