//! Test utilities shared by unit and integration tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::bus::{MessageHandler, Result as BusResult};
use crate::chat::{Connection, ConnectionId, DeliveryError};
use crate::message::ChatMessage;

/// Bus handler that counts and records every message it receives.
///
/// Clones share their counters, so a test can keep one and subscribe another.
#[derive(Default, Clone)]
pub struct CountingHandler {
    count: Arc<AtomicUsize>,
    received: Arc<Mutex<Vec<ChatMessage>>>,
}

impl CountingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> Arc<AtomicUsize> {
        self.count.clone()
    }

    pub fn received(&self) -> Arc<Mutex<Vec<ChatMessage>>> {
        self.received.clone()
    }
}

impl MessageHandler for CountingHandler {
    fn handle(&self, message: Arc<ChatMessage>) -> BoxFuture<'static, BusResult<()>> {
        let count = self.count.clone();
        let received = self.received.clone();
        Box::pin(async move {
            if let Ok(mut guard) = received.lock() {
                guard.push((*message).clone());
            }
            count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }
}

/// Build `n` messages with offsets starting at `first`.
pub fn make_messages(first: i64, n: usize) -> Vec<ChatMessage> {
    (0..n as i64)
        .map(|i| ChatMessage::new(first + i, format!("message {}", first + i)))
        .collect()
}

/// Connection double that records what it is sent.
pub struct RecordingConnection {
    id: ConnectionId,
    received: Mutex<Vec<ChatMessage>>,
    closed: AtomicBool,
    /// When set, `try_emit` fails once this many messages are held.
    capacity: Option<usize>,
    /// When set, the connection closes itself after this many deliveries.
    close_after: Option<usize>,
}

impl RecordingConnection {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::build(None, None))
    }

    pub fn with_capacity(capacity: usize) -> Arc<Self> {
        Arc::new(Self::build(Some(capacity), None))
    }

    pub fn closing_after(deliveries: usize) -> Arc<Self> {
        Arc::new(Self::build(None, Some(deliveries)))
    }

    fn build(capacity: Option<usize>, close_after: Option<usize>) -> Self {
        Self {
            id: ConnectionId::new(),
            received: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            capacity,
            close_after,
        }
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn offsets(&self) -> Vec<i64> {
        self.messages().iter().map(|m| m.offset).collect()
    }

    pub fn messages(&self) -> Vec<ChatMessage> {
        self.received.lock().map(|g| g.clone()).unwrap_or_default()
    }

    fn push(&self, message: &ChatMessage) -> Result<(), DeliveryError> {
        if self.is_closed() {
            return Err(DeliveryError::ConnectionClosed(self.id));
        }
        let mut guard = self
            .received
            .lock()
            .map_err(|_| DeliveryError::ConnectionClosed(self.id))?;
        if self.capacity.is_some_and(|cap| guard.len() >= cap) {
            return Err(DeliveryError::QueueFull(self.id));
        }
        guard.push(message.clone());
        if self.close_after.is_some_and(|n| guard.len() >= n) {
            self.close();
        }
        Ok(())
    }
}

#[async_trait]
impl Connection for RecordingConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn try_emit(&self, message: Arc<ChatMessage>) -> Result<(), DeliveryError> {
        self.push(&message)
    }

    async fn emit(&self, message: Arc<ChatMessage>) -> Result<(), DeliveryError> {
        self.push(&message)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
