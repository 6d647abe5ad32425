//! WebSocket-backed connection with a bounded outbound queue.

use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use futures::stream::SplitSink;
use futures::SinkExt;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::debug;

use super::frames::ServerFrame;
use crate::chat::{Connection, ConnectionId, DeliveryError};
use crate::message::ChatMessage;

/// Outbound half of one client socket.
///
/// Frames are queued on a bounded channel drained by a writer task. Once the
/// writer stops the queue reports closed.
pub struct WsConnection {
    id: ConnectionId,
    outbound: mpsc::Sender<ServerFrame>,
}

impl WsConnection {
    /// Create a connection and the receiver its writer task drains.
    pub fn new(queue: usize) -> (Self, mpsc::Receiver<ServerFrame>) {
        let (outbound, rx) = mpsc::channel(queue);
        (
            Self {
                id: ConnectionId::new(),
                outbound,
            },
            rx,
        )
    }

    /// Queue a control frame, waiting for room.
    pub async fn send_frame(&self, frame: ServerFrame) -> Result<(), DeliveryError> {
        self.outbound
            .send(frame)
            .await
            .map_err(|_| DeliveryError::ConnectionClosed(self.id))
    }
}

#[async_trait]
impl Connection for WsConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn try_emit(&self, message: Arc<ChatMessage>) -> Result<(), DeliveryError> {
        self.outbound
            .try_send(ServerFrame::from(message.as_ref()))
            .map_err(|e| match e {
                TrySendError::Full(_) => DeliveryError::QueueFull(self.id),
                TrySendError::Closed(_) => DeliveryError::ConnectionClosed(self.id),
            })
    }

    async fn emit(&self, message: Arc<ChatMessage>) -> Result<(), DeliveryError> {
        self.send_frame(ServerFrame::from(message.as_ref())).await
    }

    fn is_closed(&self) -> bool {
        self.outbound.is_closed()
    }
}

/// Drain queued frames into the socket until either side goes away.
pub fn spawn_writer(
    id: ConnectionId,
    mut sink: SplitSink<WebSocket, Message>,
    mut frames: mpsc::Receiver<ServerFrame>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(frame) = frames.recv().await {
            let text = match serde_json::to_string(&frame) {
                Ok(text) => text,
                Err(e) => {
                    debug!(connection = %id, error = %e, "Failed to encode frame");
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                debug!(connection = %id, "Socket write failed, stopping writer");
                break;
            }
        }
        let _ = sink.close().await;
    })
}
