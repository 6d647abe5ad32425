//! Chorus - durable, deduplicated realtime message broadcast
//!
//! Clients publish short messages over a WebSocket. Each message is stored
//! exactly once (retries are deduplicated by idempotency token), broadcast to
//! every client connected to any worker process, and replayed point-to-point
//! to clients that reconnect with the last offset they saw.

pub mod bus;
pub mod chat;
pub mod config;
pub mod message;
pub mod process;
pub mod storage;
pub mod transport;
pub mod utils;
pub mod worker;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
