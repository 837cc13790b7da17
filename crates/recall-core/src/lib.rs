//! Conversation memory logic and port trait definitions for Recall.
//!
//! This crate defines the "ports" (storage capability traits) that the
//! infrastructure layer implements, plus everything that can be decided
//! without touching a database or a file: the in-memory sliding window,
//! token budgeting, the circuit breaker, outbox retry bookkeeping, and the
//! hybrid manager that ties them together. It depends only on
//! `recall-types` -- never on `recall-infra` or any database/IO crate.

pub mod breaker;
pub mod conversation;
pub mod hybrid;
pub mod metrics;
pub mod outbox;
pub mod persistence;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;
