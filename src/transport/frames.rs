//! JSON frames exchanged over the WebSocket.

use serde::{Deserialize, Serialize};

use super::recovery::SessionId;
use crate::message::{ChatMessage, Offset};

/// Query parameters of the `/ws` handshake.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ConnectQuery {
    /// Last offset the client has seen; 0 if none.
    pub offset: Offset,
    /// Session id from a previous connection, for transport recovery.
    pub session: Option<SessionId>,
}

/// Client to server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Publish {
        content: String,
        /// Idempotency token; retries must reuse it.
        #[serde(default)]
        token: Option<String>,
        /// Client correlation id echoed in the ack.
        #[serde(default)]
        ack: Option<u64>,
    },
}

/// Server to client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Welcome {
        session: SessionId,
        recovered: bool,
    },
    Message {
        content: String,
        offset: Offset,
    },
    Ack {
        ack: Option<u64>,
    },
}

impl From<&ChatMessage> for ServerFrame {
    fn from(message: &ChatMessage) -> Self {
        ServerFrame::Message {
            content: message.content.clone(),
            offset: message.offset,
        }
    }
}
