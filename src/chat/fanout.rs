//! Broadcast fanout over the bus.
//!
//! Stored messages are never delivered to local connections directly. They
//! go out on the bus, and every worker (the publisher included) hands what it
//! receives to its hub. One delivery path per connection means no doubles.

use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::debug;

use super::ConnectionHub;
use crate::bus::{BroadcastBus, MessageHandler, Result};
use crate::message::ChatMessage;

/// Publishing side of the fanout.
#[derive(Clone)]
pub struct BroadcastFanout {
    bus: Arc<dyn BroadcastBus>,
}

impl BroadcastFanout {
    pub fn new(bus: Arc<dyn BroadcastBus>) -> Self {
        Self { bus }
    }

    /// Publish a freshly stored message to every worker.
    pub async fn broadcast(&self, message: ChatMessage) -> Result<()> {
        self.bus.publish(Arc::new(message)).await
    }

    /// Subscribe `hub` to the bus. Call before `start`.
    pub async fn deliver_to(&self, hub: Arc<ConnectionHub>) -> Result<()> {
        self.bus.subscribe(Box::new(HubDelivery::new(hub))).await
    }

    /// Subscribe an additional bus observer. Call before `start`.
    pub async fn observe(&self, handler: Box<dyn MessageHandler>) -> Result<()> {
        self.bus.subscribe(handler).await
    }

    pub async fn start(&self) -> Result<()> {
        self.bus.start_consuming().await
    }
}

/// Bus handler delivering each received message to this worker's hub.
pub struct HubDelivery {
    hub: Arc<ConnectionHub>,
}

impl HubDelivery {
    pub fn new(hub: Arc<ConnectionHub>) -> Self {
        Self { hub }
    }
}

impl MessageHandler for HubDelivery {
    fn handle(&self, message: Arc<ChatMessage>) -> BoxFuture<'static, Result<()>> {
        let hub = self.hub.clone();
        Box::pin(async move {
            let delivered = hub.broadcast(&message).await;
            debug!(offset = message.offset, delivered, "Broadcast delivered locally");
            Ok(())
        })
    }
}
