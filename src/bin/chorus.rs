//! chorus: realtime message broadcast server
//!
//! Runs in one of three modes:
//! - worker: `CHORUS_WORKER_INDEX` is set (spawned by the supervisor)
//! - supervisor: `cluster.workers > 1`, spawns that many workers
//! - single: one in-process worker
//!
//! ## Architecture
//! ```text
//! chorus (supervisor)
//!     ├── chorus worker-0 ──┐
//!     ├── chorus worker-1 ──┼── :3000 (SO_REUSEPORT)
//!     └── chorus worker-2 ──┘
//!           │
//!           ├── chat.db (shared SQLite, WAL)
//!           └── /tmp/chorus/worker-*.pipe (broadcast bus)
//! ```
//!
//! ## Configuration
//! ```yaml
//! server:
//!   port: 3000
//! cluster:
//!   workers: 4
//! storage:
//!   type: sqlite
//!   sqlite:
//!     path: chat.db
//! messaging:
//!   type: ipc
//! ```

use tracing::{error, info};

use chorus::config::{Config, WORKER_INDEX_ENV_VAR};
use chorus::utils::bootstrap::{init_tracing, parse_config_path};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    init_tracing();

    let config_path = parse_config_path();
    let config = Config::load(config_path.as_deref()).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    if let Ok(index) = std::env::var(WORKER_INDEX_ENV_VAR) {
        let index: usize = index.parse().map_err(|e| {
            error!(value = %index, "Invalid {}: {}", WORKER_INDEX_ENV_VAR, e);
            e
        })?;
        info!(worker = index, "Starting chorus worker");
        return chorus::worker::run(&config, index).await;
    }

    if config.cluster.workers > 1 {
        info!(workers = config.cluster.workers, "Starting chorus supervisor");
        return chorus::process::supervise(&config, config_path.as_deref()).await;
    }

    info!("Starting chorus");
    chorus::worker::run(&config, 0).await
}
