//! Publish, broadcast and catch-up core.
//!
//! - `publisher`: dedup-append writer with its three-way outcome
//! - `catch_up`: point-to-point replay of missed messages
//! - `fanout`: bus-driven delivery to every connection
//! - `hub`: this worker's live connections
//! - `session`: per-connection recovery state machine
//! - `service`: wires the pieces together for the transport

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::message::ChatMessage;

pub mod catch_up;
pub mod fanout;
pub mod hub;
pub mod publisher;
pub mod service;
pub mod session;

pub use catch_up::{CatchUpReader, CatchUpReport};
pub use fanout::{BroadcastFanout, HubDelivery};
pub use hub::ConnectionHub;
pub use publisher::{DedupWriter, PublishOutcome};
pub use service::ChatService;
pub use session::{Active, ConnectionSession, RecoveryPending};

/// Opaque handle for one live client attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A send to one connection failed. Never affects other connections.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    #[error("Connection {0} is closed")]
    ConnectionClosed(ConnectionId),

    #[error("Outbound queue full for connection {0}")]
    QueueFull(ConnectionId),
}

/// Outbound side of a client connection, as seen by the core.
#[async_trait]
pub trait Connection: Send + Sync {
    fn id(&self) -> ConnectionId;

    /// Queue a message without waiting. Used by broadcast, which must never
    /// stall on one slow client.
    fn try_emit(&self, message: Arc<ChatMessage>) -> Result<(), DeliveryError>;

    /// Queue a message, waiting for room. Used by point-to-point replay.
    async fn emit(&self, message: Arc<ChatMessage>) -> Result<(), DeliveryError>;

    fn is_closed(&self) -> bool;
}
