//! Message types shared by storage, bus and transport.

use serde::{Deserialize, Serialize};

/// Position of a message in the global append sequence.
///
/// Assigned by the store at append time, strictly increasing, never reused.
/// Clients use the highest offset they have seen as their catch-up watermark.
pub type Offset = i64;

/// A durably recorded message.
///
/// The same shape travels over the broadcast bus and out to clients, both for
/// broadcast and for point-to-point catch-up delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Store-assigned offset.
    pub offset: Offset,
    /// Opaque payload, stored and delivered verbatim.
    pub content: String,
}

impl ChatMessage {
    pub fn new(offset: Offset, content: impl Into<String>) -> Self {
        Self {
            offset,
            content: content.into(),
        }
    }
}
