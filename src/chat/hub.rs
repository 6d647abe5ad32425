//! Registry of this worker's live connections.
//!
//! A connection enters the hub as pending before its catch-up pass starts.
//! Broadcasts reaching a pending connection are held, and released on
//! activation minus anything at or below the connection's watermark. Holding
//! and releasing happen under the same lock as broadcast delivery, so a
//! connection sees broadcasts in bus order with no gaps and no repeats.
//! An active connection keeps its watermark: a broadcast that reaches the bus
//! after the catch-up scan already delivered it is skipped.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{Connection, ConnectionId, DeliveryError};
use crate::message::{ChatMessage, Offset};

enum EntryState {
    Pending(Vec<Arc<ChatMessage>>),
    Active { watermark: Offset },
}

struct Entry {
    connection: Arc<dyn Connection>,
    state: EntryState,
}

/// Local connections, keyed by id.
#[derive(Default)]
pub struct ConnectionHub {
    entries: Mutex<HashMap<ConnectionId, Entry>>,
}

impl ConnectionHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection that is not yet receiving broadcasts directly.
    pub async fn register_pending(&self, connection: Arc<dyn Connection>) {
        let id = connection.id();
        self.entries.lock().await.insert(
            id,
            Entry {
                connection,
                state: EntryState::Pending(Vec::new()),
            },
        );
        debug!(connection = %id, "Connection registered");
    }

    /// Switch a connection to direct broadcast delivery.
    ///
    /// Held broadcasts with offset above `watermark` are delivered first.
    /// Returns how many held messages were released.
    pub async fn activate(&self, id: ConnectionId, watermark: Offset) -> usize {
        self.activate_excluding(id, watermark, &HashSet::new()).await
    }

    /// Like `activate`, but also drops held broadcasts whose offsets are in
    /// `already_delivered`.
    pub async fn activate_excluding(
        &self,
        id: ConnectionId,
        watermark: Offset,
        already_delivered: &HashSet<Offset>,
    ) -> usize {
        let mut entries = self.entries.lock().await;
        let Some(entry) = entries.get_mut(&id) else {
            return 0;
        };

        let connection = Arc::clone(&entry.connection);
        let held = match std::mem::replace(&mut entry.state, EntryState::Active { watermark }) {
            EntryState::Pending(held) => held,
            EntryState::Active { .. } => return 0,
        };

        let mut released = 0;
        let fresh = held
            .into_iter()
            .filter(|m| m.offset > watermark && !already_delivered.contains(&m.offset));
        for message in fresh {
            if let Err(e) = connection.try_emit(message) {
                warn!(connection = %id, error = %e, "Dropping held broadcast");
                if matches!(e, DeliveryError::ConnectionClosed(_)) {
                    entries.remove(&id);
                    return released;
                }
                continue;
            }
            released += 1;
        }

        debug!(connection = %id, watermark, released, "Connection active");
        released
    }

    /// Deliver one broadcast to every local connection.
    ///
    /// A failed send only affects its own connection; closed connections are
    /// dropped from the hub. Returns how many connections were sent to.
    pub async fn broadcast(&self, message: &Arc<ChatMessage>) -> usize {
        let mut entries = self.entries.lock().await;
        let mut delivered = 0;
        let mut closed = Vec::new();

        for (id, entry) in entries.iter_mut() {
            match &mut entry.state {
                EntryState::Pending(held) => held.push(Arc::clone(message)),
                EntryState::Active { watermark } if message.offset <= *watermark => {}
                EntryState::Active { .. } => match entry.connection.try_emit(Arc::clone(message)) {
                    Ok(()) => delivered += 1,
                    Err(DeliveryError::ConnectionClosed(_)) => closed.push(*id),
                    Err(e) => warn!(
                        connection = %id,
                        offset = message.offset,
                        error = %e,
                        "Broadcast dropped"
                    ),
                },
            }
        }

        for id in closed {
            entries.remove(&id);
            debug!(connection = %id, "Removed closed connection");
        }

        delivered
    }

    pub async fn remove(&self, id: ConnectionId) {
        if self.entries.lock().await.remove(&id).is_some() {
            debug!(connection = %id, "Connection removed");
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
