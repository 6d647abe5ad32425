//! Transport-level connection state recovery.
//!
//! When a socket drops, its session is parked on the worker that held it.
//! The registry also keeps a bounded ring of the most recent broadcasts this
//! worker delivered. A reconnect to the same worker that presents the session
//! id within `max_disconnection` gets every ring entry above its offset
//! replayed by the transport and is marked recovered, so the core skips its
//! catch-up pass. Recovery is only granted while the ring still holds every
//! broadcast above the client's offset; anything else (unknown id, expired,
//! history evicted, a different worker) falls back to catch-up.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

use crate::bus::{MessageHandler, Result as BusResult};
use crate::config::RecoveryConfig;
use crate::message::{ChatMessage, Offset};

/// Client-visible id that survives a reconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Most recent broadcasts, oldest first in arrival order.
struct RecentBroadcasts {
    entries: VecDeque<Arc<ChatMessage>>,
    capacity: usize,
    /// Highest offset pushed out of the ring.
    evicted_high: Offset,
    /// Lowest offset ever recorded.
    lowest_seen: Option<Offset>,
}

impl RecentBroadcasts {
    fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            evicted_high: 0,
            lowest_seen: None,
        }
    }

    fn push(&mut self, message: &Arc<ChatMessage>) {
        self.lowest_seen = Some(
            self.lowest_seen
                .map_or(message.offset, |low| low.min(message.offset)),
        );
        self.entries.push_back(Arc::clone(message));
        while self.entries.len() > self.capacity {
            if let Some(evicted) = self.entries.pop_front() {
                self.evicted_high = self.evicted_high.max(evicted.offset);
            }
        }
    }

    /// Whether every broadcast above `offset` is still held.
    fn covers_after(&self, offset: Offset) -> bool {
        self.evicted_high <= offset && self.lowest_seen.map_or(true, |low| low - 1 <= offset)
    }

    /// Held broadcasts above `offset`, in offset order, each once.
    fn after(&self, offset: Offset) -> Vec<Arc<ChatMessage>> {
        let mut found: Vec<_> = self
            .entries
            .iter()
            .filter(|m| m.offset > offset)
            .cloned()
            .collect();
        found.sort_by_key(|m| m.offset);
        found.dedup_by_key(|m| m.offset);
        found
    }
}

/// Disconnected sessions awaiting a reconnect.
pub struct RecoveryRegistry {
    sessions: Mutex<HashMap<SessionId, Instant>>,
    recent: Mutex<RecentBroadcasts>,
    max_disconnection: Duration,
}

impl RecoveryRegistry {
    pub fn new(config: &RecoveryConfig) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            recent: Mutex::new(RecentBroadcasts::new(config.max_buffered_events)),
            max_disconnection: config.max_disconnection(),
        }
    }

    /// Remember a session whose socket is closing.
    pub async fn park(&self, id: SessionId) {
        self.sessions.lock().await.insert(id, Instant::now());
        debug!(session = %id, "Session parked");
    }

    /// Claim a parked session and the broadcasts it missed since `offset`.
    ///
    /// Returns `None` (and forgets the session) if it is unknown or expired,
    /// or if the ring no longer holds everything above `offset`.
    pub async fn resume(&self, id: SessionId, offset: Offset) -> Option<Vec<Arc<ChatMessage>>> {
        let parked_at = self.sessions.lock().await.remove(&id)?;

        if parked_at.elapsed() > self.max_disconnection {
            debug!(session = %id, "Parked session expired");
            return None;
        }

        let recent = self.recent.lock().await;
        if !recent.covers_after(offset) {
            debug!(
                session = %id,
                offset,
                evicted_high = recent.evicted_high,
                "Recent broadcasts no longer cover session"
            );
            return None;
        }

        let missed = recent.after(offset);
        debug!(session = %id, offset, missed = missed.len(), "Session resumed");
        Some(missed)
    }

    /// Add a broadcast to the ring of recent broadcasts.
    pub async fn record(&self, message: &Arc<ChatMessage>) {
        self.recent.lock().await.push(message);
    }

    /// Forget expired sessions. Returns how many were dropped.
    pub async fn sweep(&self) -> usize {
        let mut sessions = self.sessions.lock().await;
        let before = sessions.len();
        let max = self.max_disconnection;
        sessions.retain(|_, parked_at| parked_at.elapsed() <= max);
        before - sessions.len()
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Run `sweep` every `interval` until the task is aborted.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            loop {
                tick.tick().await;
                let dropped = registry.sweep().await;
                if dropped > 0 {
                    info!(dropped, "Expired parked sessions");
                }
            }
        })
    }
}

/// Bus handler feeding broadcasts into the registry.
pub struct RecoveryRecorder {
    registry: Arc<RecoveryRegistry>,
}

impl RecoveryRecorder {
    pub fn new(registry: Arc<RecoveryRegistry>) -> Self {
        Self { registry }
    }
}

impl MessageHandler for RecoveryRecorder {
    fn handle(&self, message: Arc<ChatMessage>) -> BoxFuture<'static, BusResult<()>> {
        let registry = self.registry.clone();
        Box::pin(async move {
            registry.record(&message).await;
            Ok(())
        })
    }
}
