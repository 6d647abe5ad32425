//! Fan one bus message out to a worker's subscribed handlers.

use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::error;

use super::MessageHandler;
use crate::message::ChatMessage;

/// Handlers subscribed to one bus, in subscription order.
pub(crate) type Handlers = Arc<RwLock<Vec<Box<dyn MessageHandler>>>>;

/// Run every handler on `message`, in subscription order.
///
/// The hub is subscribed first, so local clients see a broadcast before any
/// observer records it. A failing handler is logged and does not stop the
/// ones after it.
pub(crate) async fn dispatch_to_handlers(handlers: &Handlers, message: &Arc<ChatMessage>) {
    for handler in handlers.read().await.iter() {
        if let Err(e) = handler.handle(Arc::clone(message)).await {
            error!(offset = message.offset, error = %e, "Handler failed");
        }
    }
}
