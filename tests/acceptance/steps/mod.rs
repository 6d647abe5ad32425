//! Step definitions.

pub mod chat;
