//! Database schema definitions using sea-query.
//!
//! These define the table and column identifiers for type-safe query building.

use sea_query::Iden;

/// Messages table schema.
///
/// `id` doubles as the client-visible offset. `client_offset` holds the
/// idempotency token chosen by the client.
#[derive(Iden)]
pub enum Messages {
    Table,
    #[iden = "id"]
    Id,
    #[iden = "client_offset"]
    ClientOffset,
    #[iden = "content"]
    Content,
}

/// SQL for creating the messages table.
///
/// `AUTOINCREMENT` guarantees offsets are never reused, even after the
/// highest row is gone. SQLite treats NULLs as distinct under `UNIQUE`, so
/// untokened messages are never deduplicated.
pub const CREATE_MESSAGES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    client_offset TEXT UNIQUE,
    content TEXT
);
"#;
