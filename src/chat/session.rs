//! Per-connection recovery state machine.
//!
//! `RecoveryPending` is the only way to obtain an `Active` session, and the
//! transition consumes it, so the choice between transport replay and an
//! explicit catch-up pass is made exactly once per connection.

use std::collections::HashSet;

use tracing::debug;

use super::{CatchUpReader, CatchUpReport, Connection, ConnectionHub, ConnectionId};
use crate::message::Offset;

/// Facts fixed at connect time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionSession {
    pub id: ConnectionId,
    /// The transport already replayed what this client missed.
    pub recovered: bool,
    /// Client's last-seen offset; 0 if unknown.
    pub prior_offset: Offset,
}

/// Initial state: connected, not yet receiving broadcasts directly.
#[derive(Debug)]
pub struct RecoveryPending {
    session: ConnectionSession,
    /// Offsets the transport already sent on this connection.
    replayed: HashSet<Offset>,
}

/// Terminal state: the connection only receives broadcasts.
#[derive(Debug)]
pub struct Active {
    session: ConnectionSession,
    catch_up: Option<CatchUpReport>,
}

impl RecoveryPending {
    pub fn new(id: ConnectionId, recovered: bool, prior_offset: Offset) -> Self {
        Self {
            session: ConnectionSession {
                id,
                recovered,
                prior_offset,
            },
            replayed: HashSet::new(),
        }
    }

    /// Record offsets the transport replayed before activation, so held
    /// broadcasts carrying them are not sent twice.
    pub fn with_replayed(mut self, replayed: HashSet<Offset>) -> Self {
        self.replayed = replayed;
        self
    }

    pub fn session(&self) -> &ConnectionSession {
        &self.session
    }

    /// Run the catch-up pass if the transport did not recover the
    /// connection, then release held broadcasts and go active.
    ///
    /// The connection must already be registered with `hub`.
    pub async fn activate(
        self,
        connection: &dyn Connection,
        reader: &CatchUpReader,
        hub: &ConnectionHub,
    ) -> Active {
        let Self { session, replayed } = self;

        let catch_up = if session.recovered {
            None
        } else {
            Some(reader.replay(session.prior_offset, connection).await)
        };

        let watermark = catch_up
            .as_ref()
            .map_or(session.prior_offset, |r| r.watermark(session.prior_offset));
        let released = hub
            .activate_excluding(session.id, watermark, &replayed)
            .await;

        debug!(
            connection = %session.id,
            recovered = session.recovered,
            watermark,
            released,
            "Session active"
        );

        Active { session, catch_up }
    }
}

impl Active {
    pub fn session(&self) -> &ConnectionSession {
        &self.session
    }

    /// The catch-up pass, if one ran.
    pub fn catch_up(&self) -> Option<&CatchUpReport> {
        self.catch_up.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ChatMessage;
    use crate::storage::{MessageStore, MockMessageStore};
    use crate::test_utils::RecordingConnection;
    use std::sync::Arc;

    async fn setup(stored: usize) -> (CatchUpReader, ConnectionHub, Arc<MockMessageStore>) {
        let store = Arc::new(MockMessageStore::new());
        for i in 1..=stored {
            store.append(&format!("m{i}"), None).await.unwrap();
        }
        (CatchUpReader::new(store.clone()), ConnectionHub::new(), store)
    }

    #[tokio::test]
    async fn test_not_recovered_runs_catch_up() {
        let (reader, hub, _) = setup(3).await;
        let conn = RecordingConnection::new();
        hub.register_pending(conn.clone()).await;

        let active = RecoveryPending::new(conn.id(), false, 0)
            .activate(conn.as_ref(), &reader, &hub)
            .await;

        assert_eq!(conn.offsets(), vec![1, 2, 3]);
        assert_eq!(active.catch_up().map(|r| r.delivered), Some(3));
    }

    #[tokio::test]
    async fn test_recovered_skips_catch_up() {
        let (reader, hub, _) = setup(3).await;
        let conn = RecordingConnection::new();
        hub.register_pending(conn.clone()).await;

        let active = RecoveryPending::new(conn.id(), true, 0)
            .activate(conn.as_ref(), &reader, &hub)
            .await;

        assert!(conn.offsets().is_empty());
        assert!(active.catch_up().is_none());
        assert!(active.session().recovered);
    }

    #[tokio::test]
    async fn test_broadcast_during_catch_up_is_not_repeated() {
        let (reader, hub, store) = setup(2).await;
        let conn = RecordingConnection::new();
        hub.register_pending(conn.clone()).await;

        // Offset 3 is stored and broadcast while the connection is pending,
        // so it arrives both through the scan and through the held backlog.
        let offset = store.append("m3", None).await.unwrap();
        hub.broadcast(&Arc::new(ChatMessage::new(offset, "m3"))).await;
        hub.broadcast(&Arc::new(ChatMessage::new(4, "m4"))).await;

        RecoveryPending::new(conn.id(), false, 0)
            .activate(conn.as_ref(), &reader, &hub)
            .await;

        assert_eq!(conn.offsets(), vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_recovered_session_releases_backlog_above_prior_offset() {
        let (reader, hub, _) = setup(0).await;
        let conn = RecordingConnection::new();
        hub.register_pending(conn.clone()).await;
        hub.broadcast(&Arc::new(ChatMessage::new(5, "old"))).await;
        hub.broadcast(&Arc::new(ChatMessage::new(6, "new"))).await;

        RecoveryPending::new(conn.id(), true, 5)
            .activate(conn.as_ref(), &reader, &hub)
            .await;

        assert_eq!(conn.offsets(), vec![6]);
    }

    #[tokio::test]
    async fn test_recovered_session_skips_replayed_but_keeps_out_of_order_backlog() {
        let (reader, hub, _) = setup(0).await;
        let conn = RecordingConnection::new();
        hub.register_pending(conn.clone()).await;
        // Another worker's broadcasts can reach this one out of offset order.
        hub.broadcast(&Arc::new(ChatMessage::new(7, "b"))).await;
        hub.broadcast(&Arc::new(ChatMessage::new(6, "a"))).await;

        RecoveryPending::new(conn.id(), true, 5)
            .with_replayed(HashSet::from([7]))
            .activate(conn.as_ref(), &reader, &hub)
            .await;

        assert_eq!(conn.offsets(), vec![6]);
    }

    #[tokio::test]
    async fn test_active_receives_later_broadcasts() {
        let (reader, hub, _) = setup(1).await;
        let conn = RecordingConnection::new();
        hub.register_pending(conn.clone()).await;
        RecoveryPending::new(conn.id(), false, 1)
            .activate(conn.as_ref(), &reader, &hub)
            .await;

        hub.broadcast(&Arc::new(ChatMessage::new(2, "later"))).await;

        assert_eq!(conn.offsets(), vec![2]);
    }
}
