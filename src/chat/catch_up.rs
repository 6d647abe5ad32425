//! Catch-up reader: point-to-point replay of missed messages.

use std::sync::Arc;

use futures::StreamExt;
use tracing::{debug, warn};

use super::Connection;
use crate::message::Offset;
use crate::storage::MessageStore;

/// What one catch-up pass delivered.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CatchUpReport {
    /// Messages delivered to the connection.
    pub delivered: usize,
    /// Offset of the last delivered message.
    pub last_offset: Option<Offset>,
    /// False when the scan failed or the connection went away mid-pass.
    pub complete: bool,
}

impl CatchUpReport {
    /// Highest offset the connection has now seen.
    pub fn watermark(&self, prior_offset: Offset) -> Offset {
        self.last_offset.map_or(prior_offset, |o| o.max(prior_offset))
    }
}

/// Replays stored messages after a connection's last-seen offset.
#[derive(Clone)]
pub struct CatchUpReader {
    store: Arc<dyn MessageStore>,
}

impl CatchUpReader {
    pub fn new(store: Arc<dyn MessageStore>) -> Self {
        Self { store }
    }

    /// Deliver every message after `prior_offset` to `connection`, in order.
    ///
    /// Scan faults end the pass early and are only logged. The client
    /// reconciles on its next reconnect from whatever offset it reached.
    pub async fn replay(&self, prior_offset: Offset, connection: &dyn Connection) -> CatchUpReport {
        let mut report = CatchUpReport::default();
        let mut scan = self.store.scan_after(prior_offset);

        loop {
            if connection.is_closed() {
                debug!(connection = %connection.id(), "Connection closed during catch-up");
                return report;
            }

            let message = match scan.next().await {
                Some(Ok(message)) => Arc::new(message),
                Some(Err(e)) => {
                    warn!(
                        connection = %connection.id(),
                        delivered = report.delivered,
                        error = %e,
                        "Catch-up scan failed"
                    );
                    return report;
                }
                None => break,
            };

            let offset = message.offset;
            if let Err(e) = connection.emit(message).await {
                debug!(error = %e, "Catch-up delivery stopped");
                return report;
            }
            report.delivered += 1;
            report.last_offset = Some(offset);
        }

        report.complete = true;
        debug!(
            connection = %connection.id(),
            prior_offset,
            delivered = report.delivered,
            "Catch-up complete"
        );
        report
    }
}
