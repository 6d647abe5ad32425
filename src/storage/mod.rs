//! Durable message storage.
//!
//! The offset store is an append-only table keyed by a store-assigned,
//! monotonically increasing offset, with a unique constraint on the
//! client-supplied idempotency token. It is the single source of truth for
//! "did this publish already happen" across every worker process.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use tracing::info;

use crate::config::{StorageConfig, StorageType};
use crate::message::{ChatMessage, Offset};

pub mod mock;
#[cfg(feature = "sqlite")]
pub mod schema;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use mock::MockMessageStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteMessageStore;

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The idempotency token is already present. Expected on client retries.
    #[error("Idempotency token already recorded: {0}")]
    DuplicateToken(String),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[cfg(feature = "sqlite")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    /// True for the one error the publish path recovers from locally.
    pub fn is_duplicate_token(&self) -> bool {
        matches!(self, StorageError::DuplicateToken(_))
    }
}

/// Interface for the durable offset store.
///
/// Implementations:
/// - `SqliteMessageStore`: SQLite table shared by every worker process
/// - `MockMessageStore`: In-memory mock for testing
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Append a message and return its newly assigned offset.
    ///
    /// Fails with `DuplicateToken` when `token` is non-null and already
    /// recorded; a duplicate never consumes an offset. Null tokens are never
    /// deduplicated.
    async fn append(&self, content: &str, token: Option<&str>) -> Result<Offset>;

    /// Lazily scan every message with offset strictly greater than `offset`,
    /// in ascending order.
    ///
    /// Each call re-scans the store's current state. The upper bound is fixed
    /// when the scan starts, so rows appended mid-scan are left for broadcast.
    /// The stream ends after the first error it yields.
    fn scan_after(&self, offset: Offset) -> BoxStream<'static, Result<ChatMessage>>;
}

/// Initialize storage based on configuration.
///
/// Creates the schema if needed; safe to run on every process start.
pub async fn init_storage(
    config: &StorageConfig,
) -> std::result::Result<Arc<dyn MessageStore>, Box<dyn std::error::Error + Send + Sync>> {
    match config.storage_type {
        StorageType::Sqlite => {
            #[cfg(feature = "sqlite")]
            {
                info!(path = %config.sqlite.path, "Storage: sqlite");
                let store = SqliteMessageStore::open(&config.sqlite)
                    .await?
                    .with_batch_size(config.catch_up_batch_size);
                Ok(Arc::new(store))
            }

            #[cfg(not(feature = "sqlite"))]
            {
                Err("SQLite storage requires the 'sqlite' feature. Rebuild with --features sqlite"
                    .into())
            }
        }
        StorageType::Memory => {
            info!("Storage: in-memory (messages are lost on restart)");
            Ok(Arc::new(MockMessageStore::new()))
        }
    }
}
