//! SHA-256 idempotency keys for durable message writes.
//!
//! The key is a fingerprint of `(session_id, timestamp, content)`. A retried
//! write of the same message always produces the same key, so the storage
//! layer's unique constraint turns the retry into a no-op.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

/// Lowercase hex SHA-256 over the length-prefixed session id, the
/// microsecond timestamp, and the content.
///
/// Length-prefixing keeps `("a:1", ..)` and `("a", ..)` style inputs from
/// hashing the same bytes.
pub fn generate_idempotency_key(session_id: &str, timestamp: DateTime<Utc>, content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update((session_id.len() as u64).to_be_bytes());
    hasher.update(session_id.as_bytes());
    hasher.update(timestamp.timestamp_micros().to_be_bytes());
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}
