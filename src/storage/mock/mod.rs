//! Mock storage implementation for testing.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::RwLock;

use crate::message::{ChatMessage, Offset};
use crate::storage::{MessageStore, Result, StorageError};

/// Stored row with its idempotency token.
struct StoredRow {
    offset: Offset,
    token: Option<String>,
    content: String,
}

/// Mock message store that keeps rows in memory.
///
/// Mirrors the SQLite semantics: offsets start at 1, duplicates never consume
/// an offset, and null tokens are never deduplicated.
#[derive(Default)]
pub struct MockMessageStore {
    rows: Arc<RwLock<Vec<StoredRow>>>,
    fail_on_append: RwLock<bool>,
    /// When set, scans yield this many rows and then fail.
    fail_scan_after: Arc<RwLock<Option<usize>>>,
}

impl MockMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_fail_on_append(&self, fail: bool) {
        *self.fail_on_append.write().await = fail;
    }

    pub async fn set_fail_scan_after(&self, rows: Option<usize>) {
        *self.fail_scan_after.write().await = rows;
    }

    pub async fn row_count(&self) -> usize {
        self.rows.read().await.len()
    }
}

#[async_trait]
impl MessageStore for MockMessageStore {
    async fn append(&self, content: &str, token: Option<&str>) -> Result<Offset> {
        if *self.fail_on_append.read().await {
            return Err(StorageError::Unavailable("Mock append failure".to_string()));
        }

        let mut rows = self.rows.write().await;
        if let Some(token) = token {
            if rows.iter().any(|r| r.token.as_deref() == Some(token)) {
                return Err(StorageError::DuplicateToken(token.to_string()));
            }
        }

        let offset = rows.last().map(|r| r.offset + 1).unwrap_or(1);
        rows.push(StoredRow {
            offset,
            token: token.map(str::to_string),
            content: content.to_string(),
        });
        Ok(offset)
    }

    fn scan_after(&self, offset: Offset) -> BoxStream<'static, Result<ChatMessage>> {
        let rows = Arc::clone(&self.rows);
        let fail_scan_after = Arc::clone(&self.fail_scan_after);

        stream::once(async move {
            let mut items: Vec<Result<ChatMessage>> = rows
                .read()
                .await
                .iter()
                .filter(|r| r.offset > offset)
                .map(|r| Ok(ChatMessage::new(r.offset, r.content.clone())))
                .collect();

            if let Some(limit) = *fail_scan_after.read().await {
                items.truncate(limit);
                items.push(Err(StorageError::Unavailable(
                    "Mock scan failure".to_string(),
                )));
            }

            stream::iter(items)
        })
        .flatten()
        .boxed()
    }
}
