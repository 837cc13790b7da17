//! Outbox and dead-letter record types.
//!
//! The outbox is a generic at-least-once delivery buffer: entries carry an
//! opaque JSON payload plus delivery bookkeeping. On disk the queue is an
//! append-only sequence of version-tagged [`OutboxRecord`] events; the
//! current pending set is recovered by folding those events in order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Schema version written into every durable record.
pub const OUTBOX_RECORD_VERSION: u32 = 1;

/// A not-yet-delivered payload waiting in the outbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub id: Uuid,
    pub payload: serde_json::Value,
    /// Replay attempts made so far (the failed inline write is not counted).
    pub attempts: u32,
    pub enqueued_at: DateTime<Utc>,
    /// Earliest time the next replay attempt may run.
    pub next_attempt_at: DateTime<Utc>,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl OutboxEntry {
    /// A fresh entry, eligible for replay immediately.
    pub fn new(payload: serde_json::Value, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::now_v7(),
            payload,
            attempts: 0,
            enqueued_at: now,
            next_attempt_at: now,
            last_error: None,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_attempt_at <= now
    }
}

/// An entry that exhausted its retry budget, kept for operator inspection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub entry: OutboxEntry,
    pub reason: String,
    pub dead_lettered_at: DateTime<Utc>,
}

/// A state change of the durable outbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutboxEvent {
    Enqueued {
        entry: OutboxEntry,
    },
    RetryScheduled {
        id: Uuid,
        attempts: u32,
        next_attempt_at: DateTime<Utc>,
        last_error: String,
    },
    Delivered {
        id: Uuid,
    },
    DeadLettered {
        id: Uuid,
    },
}

/// One line of the outbox log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxRecord {
    pub v: u32,
    pub at: DateTime<Utc>,
    pub event: OutboxEvent,
}

impl OutboxRecord {
    pub fn new(event: OutboxEvent, at: DateTime<Utc>) -> Self {
        Self {
            v: OUTBOX_RECORD_VERSION,
            at,
            event,
        }
    }
}

/// One line of the dead-letter log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub v: u32,
    pub dead_letter: DeadLetterEntry,
}

impl DeadLetterRecord {
    pub fn new(dead_letter: DeadLetterEntry) -> Self {
        Self {
            v: OUTBOX_RECORD_VERSION,
            dead_letter,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_entry_is_due_immediately() {
        let now = Utc::now();
        let entry = OutboxEntry::new(serde_json::json!({"k": 1}), now);
        assert_eq!(entry.attempts, 0);
        assert!(entry.is_due(now));
        assert!(entry.last_error.is_none());
    }

    #[test]
    fn test_record_is_version_tagged() {
        let record = OutboxRecord::new(OutboxEvent::Delivered { id: Uuid::now_v7() }, Utc::now());
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["v"], 1);
        assert_eq!(json["event"]["kind"], "delivered");
    }

    #[test]
    fn test_event_serde_roundtrip() {
        let event = OutboxEvent::RetryScheduled {
            id: Uuid::now_v7(),
            attempts: 2,
            next_attempt_at: Utc::now(),
            last_error: "timeout".to_string(),
        };
        let line = serde_json::to_string(&OutboxRecord::new(event.clone(), Utc::now())).unwrap();
        let parsed: OutboxRecord = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed.event, event);
    }
}
