//! Dedup-append writer.
//!
//! Turns the store's duplicate-token failure into a normal outcome so that a
//! retried publish is acknowledged without being stored or broadcast twice.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::message::Offset;
use crate::storage::{MessageStore, StorageError};

/// Result of one publish attempt.
#[derive(Debug)]
pub enum PublishOutcome {
    /// A new row was written. Broadcast, then acknowledge.
    Stored(Offset),
    /// The token was already recorded. Acknowledge only.
    AlreadyStored,
    /// Any other storage fault. Neither acknowledge nor broadcast.
    Failed(StorageError),
}

impl PublishOutcome {
    /// Whether the client should receive an acknowledgment.
    pub fn should_acknowledge(&self) -> bool {
        !matches!(self, PublishOutcome::Failed(_))
    }

    /// Offset to broadcast, present only on the branch that inserted.
    pub fn broadcast_offset(&self) -> Option<Offset> {
        match self {
            PublishOutcome::Stored(offset) => Some(*offset),
            _ => None,
        }
    }
}

/// Wraps the store's append with duplicate-token handling.
#[derive(Clone)]
pub struct DedupWriter {
    store: Arc<dyn MessageStore>,
}

impl DedupWriter {
    pub fn new(store: Arc<dyn MessageStore>) -> Self {
        Self { store }
    }

    pub async fn publish(&self, content: &str, token: Option<&str>) -> PublishOutcome {
        match self.store.append(content, token).await {
            Ok(offset) => {
                debug!(offset, "Message stored");
                PublishOutcome::Stored(offset)
            }
            Err(StorageError::DuplicateToken(token)) => {
                debug!(token = %token, "Duplicate publish, already stored");
                PublishOutcome::AlreadyStored
            }
            Err(e) => {
                warn!(error = %e, "Append failed");
                PublishOutcome::Failed(e)
            }
        }
    }
}
