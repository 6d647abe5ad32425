//! Chat service: the operations the transport calls.

use std::sync::Arc;

use tracing::{error, info};

use super::{
    Active, BroadcastFanout, CatchUpReader, Connection, ConnectionHub, ConnectionId, DedupWriter,
    PublishOutcome, RecoveryPending,
};
use crate::bus::{BroadcastBus, MessageHandler, Result as BusResult};
use crate::message::{ChatMessage, Offset};
use crate::storage::MessageStore;

/// Publish and connect handling for one worker.
#[derive(Clone)]
pub struct ChatService {
    writer: DedupWriter,
    reader: CatchUpReader,
    fanout: BroadcastFanout,
    hub: Arc<ConnectionHub>,
}

impl ChatService {
    pub fn new(store: Arc<dyn MessageStore>, bus: Arc<dyn BroadcastBus>) -> Self {
        Self {
            writer: DedupWriter::new(store.clone()),
            reader: CatchUpReader::new(store),
            fanout: BroadcastFanout::new(bus),
            hub: Arc::new(ConnectionHub::new()),
        }
    }

    /// Subscribe this worker's hub and any `observers` to the bus, then
    /// start consuming.
    pub async fn start(&self, observers: Vec<Box<dyn MessageHandler>>) -> BusResult<()> {
        self.fanout.deliver_to(self.hub.clone()).await?;
        for observer in observers {
            self.fanout.observe(observer).await?;
        }
        self.fanout.start().await?;
        info!("Chat service started");
        Ok(())
    }

    pub fn hub(&self) -> &Arc<ConnectionHub> {
        &self.hub
    }

    /// Store a message and, if this call inserted it, broadcast it.
    ///
    /// A bus failure after a successful insert is logged and the outcome is
    /// still `Stored`: the row exists, so a retry would only be deduplicated.
    /// Clients on other workers pick the message up on their next catch-up.
    pub async fn publish(&self, content: &str, token: Option<&str>) -> PublishOutcome {
        let outcome = self.writer.publish(content, token).await;

        if let Some(offset) = outcome.broadcast_offset() {
            if let Err(e) = self
                .fanout
                .broadcast(ChatMessage::new(offset, content))
                .await
            {
                error!(offset, error = %e, "Broadcast failed after store");
            }
        }

        outcome
    }

    /// Register a new connection. It holds broadcasts until activated.
    pub async fn attach(&self, connection: Arc<dyn Connection>) {
        self.hub.register_pending(connection).await;
    }

    /// Drive the connection's recovery decision and make it active.
    pub async fn activate(&self, pending: RecoveryPending, connection: &dyn Connection) -> Active {
        pending.activate(connection, &self.reader, &self.hub).await
    }

    /// Convenience for the common path: attach, then activate.
    pub async fn connect(
        &self,
        connection: Arc<dyn Connection>,
        recovered: bool,
        prior_offset: Offset,
    ) -> Active {
        self.attach(connection.clone()).await;
        let pending = RecoveryPending::new(connection.id(), recovered, prior_offset);
        self.activate(pending, connection.as_ref()).await
    }

    pub async fn detach(&self, id: ConnectionId) {
        self.hub.remove(id).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MockBroadcastBus;
    use crate::storage::MockMessageStore;
    use crate::test_utils::RecordingConnection;

    async fn service() -> (ChatService, Arc<MockMessageStore>, Arc<MockBroadcastBus>) {
        let store = Arc::new(MockMessageStore::new());
        let bus = Arc::new(MockBroadcastBus::new());
        let service = ChatService::new(store.clone(), bus.clone());
        service.start(Vec::new()).await.unwrap();
        (service, store, bus)
    }

    #[tokio::test]
    async fn test_publish_stores_and_broadcasts_once() {
        let (service, _, bus) = service().await;
        let conn = RecordingConnection::new();
        service.connect(conn.clone(), false, 0).await;

        let first = service.publish("hello", Some("tok-1")).await;
        let retry = service.publish("hello", Some("tok-1")).await;

        assert!(matches!(first, PublishOutcome::Stored(1)));
        assert!(matches!(retry, PublishOutcome::AlreadyStored));
        assert!(first.should_acknowledge() && retry.should_acknowledge());
        assert_eq!(bus.published_count().await, 1);
        assert_eq!(conn.messages(), vec![ChatMessage::new(1, "hello")]);
    }

    #[tokio::test]
    async fn test_failed_publish_neither_broadcasts_nor_acks() {
        let (service, store, bus) = service().await;
        store.set_fail_on_append(true).await;

        let outcome = service.publish("hello", Some("tok-1")).await;

        assert!(!outcome.should_acknowledge());
        assert_eq!(bus.published_count().await, 0);
    }

    #[tokio::test]
    async fn test_bus_failure_still_acknowledges() {
        let (service, store, bus) = service().await;
        bus.set_fail_on_publish(true).await;

        let outcome = service.publish("hello", Some("tok-1")).await;

        assert!(matches!(outcome, PublishOutcome::Stored(1)));
        assert_eq!(store.row_count().await, 1);
    }

    #[tokio::test]
    async fn test_scenario_catch_up_by_prior_offset() {
        let (service, _, _) = service().await;
        service.publish("hello", Some("tok-1")).await;

        let second = RecordingConnection::new();
        service.connect(second.clone(), false, 0).await;
        let third = RecordingConnection::new();
        service.connect(third.clone(), false, 1).await;

        assert_eq!(second.messages(), vec![ChatMessage::new(1, "hello")]);
        assert!(third.messages().is_empty());
    }

    #[tokio::test]
    async fn test_detach_stops_delivery() {
        let (service, _, _) = service().await;
        let conn = RecordingConnection::new();
        service.connect(conn.clone(), false, 0).await;

        service.detach(conn.id()).await;
        service.publish("after", None).await;

        assert!(conn.messages().is_empty());
        assert!(service.hub().is_empty().await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_large_message_is_broadcast_over_ipc() {
        use crate::bus::IpcBroker;
        use std::time::Duration;

        let dir = tempfile::TempDir::new().unwrap();
        let mut broker = IpcBroker::new(dir.path()).unwrap();
        broker.register_worker("worker-0").unwrap();
        let store: Arc<dyn MessageStore> = Arc::new(MockMessageStore::new());
        let bus = crate::bus::IpcBus::new(dir.path(), "worker-0", broker.workers(), store.clone());
        let service = ChatService::new(store, Arc::new(bus));
        service.start(Vec::new()).await.unwrap();
        let conn = RecordingConnection::new();
        service.connect(conn.clone(), false, 0).await;

        let content = "x".repeat(5000);
        let outcome = service.publish(&content, Some("tok-big")).await;

        assert!(matches!(outcome, PublishOutcome::Stored(1)));
        for _ in 0..100 {
            if !conn.messages().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(conn.messages(), vec![ChatMessage::new(1, content)]);
    }
}
