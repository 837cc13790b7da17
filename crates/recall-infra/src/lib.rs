//! Infrastructure layer for Recall.
//!
//! Contains implementations of the port traits defined in `recall-core`:
//! SQLite conversation storage, the JSONL outbox and dead-letter logs, the
//! BPE token counter, plus config loading and data-directory layout.

pub mod config;
pub mod crypto;
pub mod filesystem;
pub mod outbox;
pub mod sqlite;
pub mod tokens;
