//! IPC pipe registry for multi-worker mode.
//!
//! Creates and manages one named pipe per worker process.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use nix::sys::stat::Mode;
use nix::unistd::mkfifo;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::worker_pipe_path;

/// Worker pipe info passed to every worker via env var.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerPipe {
    /// Worker name.
    pub name: String,
    /// Path to the worker's named pipe.
    pub pipe_path: PathBuf,
}

/// IPC pipe registry.
///
/// Used by the supervisor to:
/// 1. Register workers and create their pipes
/// 2. Get the pipe list to pass to workers via env var
/// 3. Clean up pipes on shutdown
pub struct IpcBroker {
    base_path: PathBuf,
    workers: BTreeMap<String, WorkerPipe>,
}

impl IpcBroker {
    /// Create a new IPC broker, creating `base_path` if needed.
    pub fn new(base_path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let base_path = base_path.into();
        fs::create_dir_all(&base_path)?;

        Ok(Self {
            base_path,
            workers: BTreeMap::new(),
        })
    }

    /// Get the base path for pipes.
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Register a worker and create its named pipe.
    pub fn register_worker(&mut self, name: &str) -> std::io::Result<WorkerPipe> {
        let pipe_path = worker_pipe_path(&self.base_path, name);

        // A pipe left by a previous run may still hold stale frames.
        if pipe_path.exists() {
            fs::remove_file(&pipe_path)?;
        }

        mkfifo(&pipe_path, Mode::S_IRUSR | Mode::S_IWUSR).map_err(std::io::Error::other)?;

        info!(worker = %name, pipe = %pipe_path.display(), "Registered worker pipe");

        let pipe = WorkerPipe {
            name: name.to_string(),
            pipe_path,
        };
        self.workers.insert(name.to_string(), pipe.clone());

        Ok(pipe)
    }

    /// Unregister a worker and remove its pipe.
    pub fn unregister_worker(&mut self, name: &str) {
        if let Some(pipe) = self.workers.remove(name) {
            if pipe.pipe_path.exists() {
                let _ = fs::remove_file(&pipe.pipe_path);
            }
            info!(worker = %name, "Unregistered worker pipe");
        }
    }

    /// All registered worker pipes, ordered by name.
    pub fn workers(&self) -> Vec<WorkerPipe> {
        self.workers.values().cloned().collect()
    }

    /// Serialize the worker pipe list to JSON for the env var.
    pub fn workers_to_json(&self) -> String {
        serde_json::to_string(&self.workers()).unwrap_or_else(|_| "[]".to_string())
    }

    /// Remove every registered pipe.
    pub fn cleanup(&self) {
        for pipe in self.workers.values() {
            if pipe.pipe_path.exists() {
                let _ = fs::remove_file(&pipe.pipe_path);
            }
        }
        info!("Cleaned up {} worker pipes", self.workers.len());
    }
}

impl Drop for IpcBroker {
    fn drop(&mut self) {
        self.cleanup();
    }
}
