//! IPC-based broadcast bus for multi-worker mode.
//!
//! Every worker owns one named pipe. Publishing writes the frame into every
//! worker's pipe, the publisher's own included.
//!
//! ```text
//!                ┌──────────────┐
//!                │   worker-1   │
//!                │  (publish)   │
//!                └──────────────┘
//!                        │
//!       ┌────────────────┼────────────────┐
//!       ▼                ▼                ▼
//! ┌────────────┐   ┌────────────┐   ┌────────────┐
//! │ worker-0   │   │ worker-1   │   │ worker-2   │
//! │   .pipe    │   │   .pipe    │   │   .pipe    │
//! └────────────┘   └────────────┘   └────────────┘
//! ```
//!
//! Usage:
//! 1. Supervisor creates `IpcBroker` and registers one pipe per worker
//! 2. Supervisor passes the pipe list to each worker via env var
//! 3. Each worker builds an `IpcBus` from the env var and consumes its own pipe
//!
//! Frames are a 4-byte big-endian length followed by a JSON body, and never
//! exceed `PIPE_BUF`, so concurrent writers never interleave. The body is the
//! message itself, or just its offset when the message is too large; the
//! receiver then reads it from the shared store.

#[cfg(unix)]
mod broker;
#[cfg(unix)]
mod client;

#[cfg(unix)]
pub use broker::{IpcBroker, WorkerPipe};
#[cfg(unix)]
pub use client::IpcBus;

/// Default base path for worker pipes.
pub const DEFAULT_BASE_PATH: &str = "/tmp/chorus";

/// Name prefix for workers and their pipes.
pub const WORKER_PIPE_PREFIX: &str = "worker-";

/// Env var name for the worker pipe list (set by supervisor).
pub const SUBSCRIBERS_ENV_VAR: &str = "CHORUS_IPC_SUBSCRIBERS";

/// Largest frame written in a single atomic pipe write.
pub const MAX_FRAME_LEN: usize = 4096;

/// Pipe path for a worker name under `base_path`.
pub fn worker_pipe_path(base_path: &std::path::Path, name: &str) -> std::path::PathBuf {
    base_path.join(format!("{}.pipe", name))
}
