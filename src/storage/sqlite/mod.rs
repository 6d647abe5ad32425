//! SQLite implementation of the offset store.

mod message_store;

pub use message_store::SqliteMessageStore;
