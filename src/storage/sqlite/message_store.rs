//! SQLite MessageStore implementation.

use std::collections::VecDeque;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use backon::Retryable;
use futures::stream::{self, BoxStream, StreamExt};
use sea_query::{Expr, Order, Query, SqliteQueryBuilder};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tracing::{debug, warn};

use crate::config::SqliteConfig;
use crate::message::{ChatMessage, Offset};
use crate::storage::schema::{Messages, CREATE_MESSAGES_TABLE};
use crate::storage::{MessageStore, Result, StorageError};
use crate::utils::retry::startup_backoff;

/// Rows fetched per round trip while scanning.
pub const DEFAULT_SCAN_BATCH_SIZE: u32 = 256;

/// How long a connection waits on another worker's write lock.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite implementation of MessageStore.
///
/// Every worker process opens its own pool on the same database file; the
/// unique index on `client_offset` is what keeps concurrent retries from
/// different workers race-free.
pub struct SqliteMessageStore {
    pool: SqlitePool,
    batch_size: u32,
}

impl SqliteMessageStore {
    /// Create a new SQLite message store.
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            batch_size: DEFAULT_SCAN_BATCH_SIZE,
        }
    }

    /// Override the number of rows fetched per scan round trip.
    pub fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Open (creating if missing) the database file and initialize the schema.
    ///
    /// Retried with backoff: N workers start at once against one file, and
    /// schema creation can briefly see the database locked.
    pub async fn open(config: &SqliteConfig) -> Result<Self> {
        if let Some(parent) = std::path::Path::new(&config.path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", config.path))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);

        let max_connections = config.max_connections;
        let open = || {
            let options = options.clone();
            async move {
                let pool = SqlitePoolOptions::new()
                    .max_connections(max_connections)
                    .connect_with(options)
                    .await?;
                let store = Self::new(pool);
                store.init().await?;
                Ok::<_, StorageError>(store)
            }
        };

        open.retry(startup_backoff())
            .notify(|e, delay| {
                warn!(error = %e, ?delay, "Failed to open SQLite store, retrying");
            })
            .await
    }

    /// Initialize the database schema.
    pub async fn init(&self) -> Result<()> {
        sqlx::query(CREATE_MESSAGES_TABLE).execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl MessageStore for SqliteMessageStore {
    async fn append(&self, content: &str, token: Option<&str>) -> Result<Offset> {
        let query = Query::insert()
            .into_table(Messages::Table)
            .columns([Messages::Content, Messages::ClientOffset])
            .values_panic([content.into(), token.map(str::to_string).into()])
            .to_string(SqliteQueryBuilder);

        match sqlx::query(&query).execute(&self.pool).await {
            Ok(done) => {
                let offset = done.last_insert_rowid();
                debug!(offset, "Appended message");
                Ok(offset)
            }
            Err(sqlx::Error::Database(ref db)) if db.is_unique_violation() => Err(
                StorageError::DuplicateToken(token.unwrap_or_default().to_string()),
            ),
            Err(e) => Err(e.into()),
        }
    }

    fn scan_after(&self, offset: Offset) -> BoxStream<'static, Result<ChatMessage>> {
        let scan = Scan {
            pool: self.pool.clone(),
            cursor: offset,
            ceiling: None,
            batch_size: self.batch_size,
            buffered: VecDeque::new(),
            exhausted: false,
        };

        stream::try_unfold(scan, Scan::next).boxed()
    }
}

/// Paged cursor over the messages table.
///
/// Fetches `batch_size` rows at a time so a slow consumer never pins a pooled
/// connection, and so dropping the stream stops the scan between pages.
struct Scan {
    pool: SqlitePool,
    cursor: Offset,
    ceiling: Option<Offset>,
    batch_size: u32,
    buffered: VecDeque<ChatMessage>,
    exhausted: bool,
}

impl Scan {
    async fn next(mut self) -> Result<Option<(ChatMessage, Self)>> {
        loop {
            if let Some(message) = self.buffered.pop_front() {
                return Ok(Some((message, self)));
            }
            if self.exhausted {
                return Ok(None);
            }

            let ceiling = match self.ceiling {
                Some(ceiling) => ceiling,
                None => {
                    let ceiling = self.max_offset().await?;
                    self.ceiling = Some(ceiling);
                    ceiling
                }
            };

            if self.cursor >= ceiling {
                self.exhausted = true;
                continue;
            }

            let page = self.fetch_page(ceiling).await?;
            if page.len() < self.batch_size as usize {
                self.exhausted = true;
            }
            if let Some(last) = page.last() {
                self.cursor = last.offset;
            }
            self.buffered.extend(page);
        }
    }

    async fn max_offset(&self) -> Result<Offset> {
        let query = Query::select()
            .expr(Expr::col(Messages::Id).max())
            .from(Messages::Table)
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query).fetch_one(&self.pool).await?;
        let max: Option<i64> = row.try_get(0)?;
        Ok(max.unwrap_or(0))
    }

    async fn fetch_page(&self, ceiling: Offset) -> Result<Vec<ChatMessage>> {
        let query = Query::select()
            .columns([Messages::Id, Messages::Content])
            .from(Messages::Table)
            .and_where(Expr::col(Messages::Id).gt(self.cursor))
            .and_where(Expr::col(Messages::Id).lte(ceiling))
            .order_by(Messages::Id, Order::Asc)
            .limit(u64::from(self.batch_size))
            .to_string(SqliteQueryBuilder);

        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;

        let mut messages = Vec::with_capacity(rows.len());
        for row in rows {
            let offset: i64 = row.try_get("id")?;
            let content: Option<String> = row.try_get("content")?;
            messages.push(ChatMessage {
                offset,
                content: content.unwrap_or_default(),
            });
        }

        Ok(messages)
    }
}
