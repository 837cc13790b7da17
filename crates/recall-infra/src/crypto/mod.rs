//! Hashing helpers.

pub mod idempotency;
