//! Mock broadcast bus implementation for testing.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{BroadcastBus, BusError, Handlers, MessageHandler, Result};
use crate::message::ChatMessage;

/// Mock broadcast bus for testing.
///
/// Records every published message and dispatches it to subscribed handlers
/// before `publish` returns.
#[derive(Default)]
pub struct MockBroadcastBus {
    published: RwLock<Vec<ChatMessage>>,
    handlers: Handlers,
    fail_on_publish: RwLock<bool>,
}

impl MockBroadcastBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_fail_on_publish(&self, fail: bool) {
        *self.fail_on_publish.write().await = fail;
    }

    pub async fn published_count(&self) -> usize {
        self.published.read().await.len()
    }
}

#[async_trait]
impl BroadcastBus for MockBroadcastBus {
    async fn publish(&self, message: Arc<ChatMessage>) -> Result<()> {
        if *self.fail_on_publish.read().await {
            return Err(BusError::Connection("Mock publish failure".to_string()));
        }
        self.published.write().await.push((*message).clone());
        super::dispatch_to_handlers(&self.handlers, &message).await;
        Ok(())
    }

    async fn subscribe(&self, handler: Box<dyn MessageHandler>) -> Result<()> {
        self.handlers.write().await.push(handler);
        Ok(())
    }
}
