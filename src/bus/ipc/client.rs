//! IPC broadcast bus client.
//!
//! Publishing: read the worker pipe list from env var, write each frame to
//! every pipe. Consuming: read frames from this worker's own pipe.
//!
//! A message whose inline frame would not fit in one atomic pipe write goes
//! out as a reference frame carrying only its offset. Receivers load the
//! content from the shared store, where the publisher has already committed it.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use backon::Retryable;
use futures::StreamExt;
use nix::libc;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tokio::net::unix::pipe;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::broker::WorkerPipe;
use super::{worker_pipe_path, MAX_FRAME_LEN, SUBSCRIBERS_ENV_VAR};
use crate::bus::{BroadcastBus, BusError, Handlers, MessageHandler, Result};
use crate::message::{ChatMessage, Offset};
use crate::storage::MessageStore;
use crate::utils::retry::pipe_backoff;

/// Body of one pipe frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum BusFrame {
    Inline(ChatMessage),
    Stored { offset: Offset },
}

/// Load the worker pipe list from env var.
fn load_workers_from_env() -> Vec<WorkerPipe> {
    match std::env::var(SUBSCRIBERS_ENV_VAR) {
        Ok(json) => serde_json::from_str(&json).unwrap_or_else(|e| {
            warn!(error = %e, "Failed to parse {}", SUBSCRIBERS_ENV_VAR);
            Vec::new()
        }),
        Err(_) => {
            debug!("{} not set, no worker pipes configured", SUBSCRIBERS_ENV_VAR);
            Vec::new()
        }
    }
}

fn frame_bytes(frame: &BusFrame) -> Result<Vec<u8>> {
    let body = serde_json::to_vec(frame).map_err(BusError::Encode)?;
    let mut bytes = Vec::with_capacity(4 + body.len());
    bytes.extend_from_slice(&(body.len() as u32).to_be_bytes());
    bytes.extend_from_slice(&body);
    Ok(bytes)
}

/// Encode a message as a length-prefixed frame of at most `MAX_FRAME_LEN`
/// bytes, falling back to a reference frame for large content.
fn encode_frame(message: &ChatMessage) -> Result<Vec<u8>> {
    let inline = frame_bytes(&BusFrame::Inline(message.clone()))?;
    if inline.len() <= MAX_FRAME_LEN {
        return Ok(inline);
    }

    debug!(
        offset = message.offset,
        len = inline.len(),
        "Message too large for one pipe write, sending reference"
    );
    frame_bytes(&BusFrame::Stored {
        offset: message.offset,
    })
}

/// Turn a received frame back into the message it stands for.
async fn resolve_frame(frame: BusFrame, store: &dyn MessageStore) -> Result<ChatMessage> {
    let offset = match frame {
        BusFrame::Inline(message) => return Ok(message),
        BusFrame::Stored { offset } => offset,
    };

    match store.scan_after(offset - 1).next().await {
        Some(Ok(message)) if message.offset == offset => Ok(message),
        Some(Ok(message)) => Err(BusError::Lookup(format!(
            "offset {} not in store (next is {})",
            offset, message.offset
        ))),
        Some(Err(e)) => Err(BusError::Lookup(format!("offset {}: {}", offset, e))),
        None => Err(BusError::Lookup(format!("offset {} not in store", offset))),
    }
}

/// Write one frame to a pipe in a single write.
fn write_frame(path: &Path, frame: &[u8]) -> std::io::Result<()> {
    let sender = pipe::OpenOptions::new().open_sender(path)?;
    let written = sender.try_write(frame)?;
    if written != frame.len() {
        return Err(std::io::Error::new(
            ErrorKind::WriteZero,
            "short write to worker pipe",
        ));
    }
    Ok(())
}

/// IPC broadcast bus.
pub struct IpcBus {
    /// This worker's name.
    worker_name: String,
    /// This worker's pipe.
    own_pipe: PathBuf,
    /// Every worker's pipe, this worker included.
    workers: Vec<WorkerPipe>,
    /// Serializes publishes so frames leave in call order.
    publish_lock: Mutex<()>,
    /// Where reference frames are resolved.
    store: Arc<dyn MessageStore>,
    handlers: Handlers,
    consumer_task: Arc<RwLock<Option<JoinHandle<()>>>>,
}

impl IpcBus {
    /// Create a bus with an explicit worker pipe list.
    ///
    /// `store` must be the store every worker appends to.
    pub fn new(
        base_path: impl AsRef<Path>,
        worker_name: impl Into<String>,
        workers: Vec<WorkerPipe>,
        store: Arc<dyn MessageStore>,
    ) -> Self {
        let worker_name = worker_name.into();
        let own_pipe = worker_pipe_path(base_path.as_ref(), &worker_name);
        Self {
            worker_name,
            own_pipe,
            workers,
            publish_lock: Mutex::new(()),
            store,
            handlers: Arc::new(RwLock::new(Vec::new())),
            consumer_task: Arc::new(RwLock::new(None)),
        }
    }

    /// Create a bus, loading the worker pipe list from env var.
    pub fn from_env(
        base_path: impl AsRef<Path>,
        worker_name: impl Into<String>,
        store: Arc<dyn MessageStore>,
    ) -> Self {
        Self::new(base_path, worker_name, load_workers_from_env(), store)
    }

    /// Path of the pipe this worker consumes.
    pub fn own_pipe(&self) -> &Path {
        &self.own_pipe
    }

    async fn start_consuming_impl(&self) -> Result<()> {
        let mut task = self.consumer_task.write().await;
        if task.is_some() {
            return Ok(());
        }

        let receiver = pipe::OpenOptions::new()
            .open_receiver(&self.own_pipe)
            .map_err(|e| BusError::Subscribe(format!("{}: {}", self.own_pipe.display(), e)))?;
        // Holding a write end keeps the pipe from reporting EOF between publishers.
        let keepalive = pipe::OpenOptions::new()
            .open_sender(&self.own_pipe)
            .map_err(|e| BusError::Subscribe(format!("{}: {}", self.own_pipe.display(), e)))?;

        let handlers = self.handlers.clone();
        let store = self.store.clone();
        let pipe_path = self.own_pipe.clone();

        info!(worker = %self.worker_name, pipe = %pipe_path.display(), "Starting IPC consumer");

        *task = Some(tokio::spawn(async move {
            let _keepalive = keepalive;
            let mut receiver = receiver;

            loop {
                let mut len_buf = [0u8; 4];
                if let Err(e) = receiver.read_exact(&mut len_buf).await {
                    error!(pipe = %pipe_path.display(), error = %e, "Pipe read error");
                    return;
                }

                let len = u32::from_be_bytes(len_buf) as usize;
                if len > MAX_FRAME_LEN {
                    // Frames are written atomically, so this stream is unrecoverable.
                    error!(len, "Frame length out of range, stopping consumer");
                    return;
                }

                let mut buf = vec![0u8; len];
                if let Err(e) = receiver.read_exact(&mut buf).await {
                    error!(error = %e, "Failed to read frame body");
                    return;
                }

                let frame = match serde_json::from_slice::<BusFrame>(&buf) {
                    Ok(frame) => frame,
                    Err(e) => {
                        error!(error = %BusError::Decode(e), "Dropping undecodable frame");
                        continue;
                    }
                };
                let message = match resolve_frame(frame, store.as_ref()).await {
                    Ok(message) => Arc::new(message),
                    Err(e) => {
                        error!(error = %e, "Dropping unresolvable frame");
                        continue;
                    }
                };

                debug!(offset = message.offset, "Received message via pipe");

                crate::bus::dispatch_to_handlers(&handlers, &message).await;
            }
        }));

        Ok(())
    }
}

#[async_trait]
impl BroadcastBus for IpcBus {
    #[tracing::instrument(name = "bus.publish", skip_all, fields(offset = message.offset))]
    async fn publish(&self, message: Arc<ChatMessage>) -> Result<()> {
        if self.workers.is_empty() {
            debug!("No worker pipes configured, message not published");
            return Ok(());
        }

        let frame = encode_frame(&message)?;
        let _guard = self.publish_lock.lock().await;

        for worker in &self.workers {
            let result = (|| async { write_frame(&worker.pipe_path, &frame) })
                .retry(pipe_backoff())
                .when(|e: &std::io::Error| e.kind() == ErrorKind::WouldBlock)
                .await;

            match result {
                Ok(()) => debug!(worker = %worker.name, "Published message to pipe"),
                // ENXIO: worker has not opened its pipe yet.
                Err(e) if e.raw_os_error() == Some(libc::ENXIO) => {
                    debug!(worker = %worker.name, "Worker pipe has no reader, skipping");
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    warn!(worker = %worker.name, "Pipe full, dropping message");
                }
                Err(e) => {
                    warn!(worker = %worker.name, error = %e, "Failed to write to pipe");
                }
            }
        }

        Ok(())
    }

    async fn subscribe(&self, handler: Box<dyn MessageHandler>) -> Result<()> {
        let count = {
            let mut handlers = self.handlers.write().await;
            handlers.push(handler);
            handlers.len()
        };

        info!(handler_count = count, "Handler subscribed to IPC bus");

        Ok(())
    }

    async fn start_consuming(&self) -> Result<()> {
        self.start_consuming_impl().await
    }
}
