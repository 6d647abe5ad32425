//! Broadcast bus connecting every worker process.
//!
//! Every stored message is published to the bus exactly once, by the worker
//! that performed the insert. Every worker subscribes, including the
//! publisher itself, so local and remote connections are reached through the
//! same path and no connection is delivered to twice.
//!
//! This module contains:
//! - `BroadcastBus` trait: publish/subscribe capability pair
//! - `MessageHandler` trait: For processing messages received from the bus
//! - Implementations: Channel (in-process), IPC (named pipes), Mock

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tracing::info;

use crate::config::{MessagingConfig, MessagingType};
use crate::message::ChatMessage;
use crate::storage::MessageStore;

pub mod channel;
mod dispatch;
pub mod ipc;
pub mod mock;

pub use channel::ChannelBus;
pub(crate) use dispatch::{dispatch_to_handlers, Handlers};
#[cfg(unix)]
pub use ipc::{IpcBroker, IpcBus, WorkerPipe, SUBSCRIBERS_ENV_VAR};
pub use mock::MockBroadcastBus;

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Frame encode failed: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("Frame decode failed: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("Stored message lookup failed: {0}")]
    Lookup(String),

    #[error("Handler failed: {0}")]
    Handler(String),
}

/// Handler for processing messages from the bus.
pub trait MessageHandler: Send + Sync {
    /// Process one broadcast message.
    fn handle(&self, message: Arc<ChatMessage>) -> BoxFuture<'static, Result<()>>;
}

/// Publish/subscribe capability pair shared by all workers.
///
/// Implementations:
/// - `ChannelBus`: tokio broadcast channel, single process
/// - `IpcBus`: named-pipe fanout across worker processes
/// - `MockBroadcastBus`: In-memory mock for testing
#[async_trait]
pub trait BroadcastBus: Send + Sync {
    /// Publish a stored message to every subscribed worker.
    ///
    /// Messages published from one process reach each subscriber in the order
    /// they were published.
    async fn publish(&self, message: Arc<ChatMessage>) -> Result<()>;

    /// Register a handler for messages received from the bus.
    async fn subscribe(&self, handler: Box<dyn MessageHandler>) -> Result<()>;

    /// Start delivering received messages to handlers (call after subscribe).
    async fn start_consuming(&self) -> Result<()> {
        Ok(())
    }
}

/// Identity of the worker a bus is built for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerIdentity {
    /// Zero-based index assigned by the supervisor.
    pub index: usize,
}

impl WorkerIdentity {
    pub fn new(index: usize) -> Self {
        Self { index }
    }

    /// Name used for the worker's pipe and in logs.
    pub fn name(&self) -> String {
        format!("{}{}", ipc::WORKER_PIPE_PREFIX, self.index)
    }
}

/// Initialize the broadcast bus based on configuration.
///
/// `store` is the worker's message store; the IPC bus reads large messages
/// back from it instead of carrying them in the pipe.
pub async fn init_bus(
    config: &MessagingConfig,
    worker: &WorkerIdentity,
    store: Arc<dyn MessageStore>,
) -> std::result::Result<Arc<dyn BroadcastBus>, Box<dyn std::error::Error + Send + Sync>> {
    match config.messaging_type {
        MessagingType::Channel => {
            drop(store);
            info!(messaging_type = "channel", "Broadcast bus initialized");
            Ok(Arc::new(ChannelBus::new()))
        }
        MessagingType::Ipc => {
            #[cfg(unix)]
            {
                let bus = IpcBus::from_env(&config.ipc.base_path, worker.name(), store);
                info!(
                    messaging_type = "ipc",
                    worker = %worker.name(),
                    "Broadcast bus initialized"
                );
                Ok(Arc::new(bus))
            }

            #[cfg(not(unix))]
            {
                let _ = (worker, store);
                Err("IPC messaging requires named pipes and is only available on unix".into())
            }
        }
    }
}
