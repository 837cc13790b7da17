//! Shared domain types for Recall.
//!
//! This crate contains the core domain types used across the conversation
//! memory layer: messages, context windows, outbox records, configuration,
//! and their associated error types.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod chat;
pub mod config;
pub mod error;
pub mod outbox;
