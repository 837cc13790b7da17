//! OutboxLog trait definition and event folding.
//!
//! The log is append-only: the pending set is never rewritten in place, only
//! recovered by replaying events in order. `compact` is the one exception and
//! runs only once the queue has drained.

use recall_types::error::OutboxError;
use recall_types::outbox::{DeadLetterEntry, OutboxEntry, OutboxEvent, OutboxRecord};

/// Durable storage for outbox events and dead letters.
///
/// Implementations live in recall-infra (`JsonlOutboxLog`) and, for tests,
/// in `crate::testing`.
pub trait OutboxLog: Send + Sync {
    /// Durably append one event.
    fn append(
        &self,
        record: &OutboxRecord,
    ) -> impl std::future::Future<Output = Result<(), OutboxError>> + Send;

    /// Every readable event, in append order.
    fn load(&self) -> impl std::future::Future<Output = Result<Vec<OutboxRecord>, OutboxError>> + Send;

    /// Replace the log with one `Enqueued` event per entry in `pending`.
    fn compact(
        &self,
        pending: &[OutboxEntry],
    ) -> impl std::future::Future<Output = Result<(), OutboxError>> + Send;

    /// Durably append an entry to the dead-letter sink.
    fn append_dead_letter(
        &self,
        dead_letter: &DeadLetterEntry,
    ) -> impl std::future::Future<Output = Result<(), OutboxError>> + Send;

    /// Every dead letter, oldest first.
    fn load_dead_letters(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<DeadLetterEntry>, OutboxError>> + Send;
}

/// Rebuild the pending set from events, preserving enqueue order.
///
/// Events for unknown ids are ignored; a repeated `Enqueued` for a known id
/// keeps the first copy.
pub fn fold_records(records: impl IntoIterator<Item = OutboxRecord>) -> Vec<OutboxEntry> {
    let mut pending: Vec<OutboxEntry> = Vec::new();
    for record in records {
        match record.event {
            OutboxEvent::Enqueued { entry } => {
                if !pending.iter().any(|e| e.id == entry.id) {
                    pending.push(entry);
                }
            }
            OutboxEvent::RetryScheduled {
                id,
                attempts,
                next_attempt_at,
                last_error,
            } => {
                if let Some(entry) = pending.iter_mut().find(|e| e.id == id) {
                    entry.attempts = attempts;
                    entry.next_attempt_at = next_attempt_at;
                    entry.last_error = Some(last_error);
                }
            }
            OutboxEvent::Delivered { id } | OutboxEvent::DeadLettered { id } => {
                pending.retain(|e| e.id != id);
            }
        }
    }
    pending
}
