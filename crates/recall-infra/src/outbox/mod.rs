//! Durable outbox storage.

pub mod jsonl;

pub use jsonl::JsonlOutboxLog;
