//! In-process broadcast bus.
//!
//! A single worker publishes to itself through a tokio broadcast channel.
//! Buses made with [`ChannelBus::attach`] share one channel but keep their
//! own handlers, so several `ChatService`s in one process behave like
//! separate workers on a shared bus. Tests and the acceptance suite run
//! multi-worker scenarios this way without spawning processes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info};

use super::{dispatch_to_handlers, BroadcastBus, Handlers, MessageHandler, Result};
use crate::message::ChatMessage;

/// Messages a slow consumer may fall behind before it starts losing them.
const CHANNEL_CAPACITY: usize = 1024;

/// One worker's view of an in-process broadcast channel.
pub struct ChannelBus {
    sender: broadcast::Sender<Arc<ChatMessage>>,
    handlers: Handlers,
    consuming: AtomicBool,
}

impl Default for ChannelBus {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelBus {
    /// Open a fresh channel.
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        debug!(capacity = CHANNEL_CAPACITY, "Channel bus created");
        Self::on(sender)
    }

    /// Another worker on this bus's channel.
    ///
    /// It receives everything either bus publishes, including its own
    /// messages, and dispatches to its own handlers only.
    pub fn attach(&self) -> Self {
        Self::on(self.sender.clone())
    }

    fn on(sender: broadcast::Sender<Arc<ChatMessage>>) -> Self {
        Self {
            sender,
            handlers: Handlers::default(),
            consuming: AtomicBool::new(false),
        }
    }
}

/// Drain `receiver` into `handlers` until every sender is gone.
async fn consume(mut receiver: broadcast::Receiver<Arc<ChatMessage>>, handlers: Handlers) {
    loop {
        match receiver.recv().await {
            Ok(message) => dispatch_to_handlers(&handlers, &message).await,
            Err(RecvError::Lagged(skipped)) => {
                // Those clients recover on their next catch-up.
                error!(skipped, "Channel consumer lagged");
            }
            Err(RecvError::Closed) => break,
        }
    }
    debug!("Channel consumer stopped");
}

#[async_trait]
impl BroadcastBus for ChannelBus {
    #[tracing::instrument(name = "bus.publish", skip_all, fields(offset = message.offset))]
    async fn publish(&self, message: Arc<ChatMessage>) -> Result<()> {
        // Zero receivers just means no worker is consuming yet.
        let receivers = self.sender.send(message).unwrap_or(0);
        debug!(receivers, "Published to channel");
        Ok(())
    }

    async fn subscribe(&self, handler: Box<dyn MessageHandler>) -> Result<()> {
        let mut handlers = self.handlers.write().await;
        handlers.push(handler);
        debug!(handlers = handlers.len(), "Handler subscribed to channel bus");
        Ok(())
    }

    async fn start_consuming(&self) -> Result<()> {
        if self.consuming.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        tokio::spawn(consume(self.sender.subscribe(), self.handlers.clone()));
        info!("Channel consumer started");
        Ok(())
    }
}
