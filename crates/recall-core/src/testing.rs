//! In-memory implementations of the storage ports, for tests.
//!
//! Available to this crate's unit tests and, through the `test-util`
//! feature, to downstream crates.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use recall_types::chat::{ConversationMessage, HistoryQuery};
use recall_types::error::{OutboxError, RepositoryError};
use recall_types::outbox::{DeadLetterEntry, OutboxEntry, OutboxEvent, OutboxRecord};

use crate::outbox::OutboxLog;
use crate::persistence::ConversationStore;

/// Conversation store backed by a vector.
///
/// Rows are deduplicated on `(session_id, timestamp, content)`, the same
/// identity the SQLite store hashes into its idempotency key.
#[derive(Debug, Default)]
pub struct InMemoryConversationStore {
    rows: Mutex<Vec<(String, ConversationMessage)>>,
    failing: AtomicBool,
    insert_calls: AtomicUsize,
}

impl InMemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of `insert_messages` calls, failed ones included.
    pub fn insert_calls(&self) -> usize {
        self.insert_calls.load(Ordering::SeqCst)
    }

    pub fn row_count(&self) -> usize {
        self.rows.lock().len()
    }

    fn check(&self) -> Result<(), RepositoryError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(RepositoryError::Query("injected failure".to_string()))
        } else {
            Ok(())
        }
    }
}

impl ConversationStore for InMemoryConversationStore {
    async fn insert_messages(
        &self,
        session_id: &str,
        messages: &[ConversationMessage],
    ) -> Result<(), RepositoryError> {
        self.insert_calls.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        let mut rows = self.rows.lock();
        for message in messages {
            let duplicate = rows.iter().any(|(sid, m)| {
                sid == session_id && m.timestamp == message.timestamp && m.content == message.content
            });
            if !duplicate {
                rows.push((session_id.to_string(), message.clone()));
            }
        }
        Ok(())
    }

    async fn fetch_history(
        &self,
        session_id: &str,
        query: HistoryQuery,
    ) -> Result<Vec<ConversationMessage>, RepositoryError> {
        self.check()?;
        let rows = self.rows.lock();
        let mut messages: Vec<ConversationMessage> = rows
            .iter()
            .filter(|(sid, _)| sid == session_id)
            .map(|(_, m)| m.clone())
            .collect();
        // Stable sort keeps insertion order for equal timestamps.
        messages.sort_by_key(|m| m.timestamp);
        if query.order_desc {
            messages.reverse();
        }
        Ok(messages
            .into_iter()
            .skip(query.offset as usize)
            .take(query.limit as usize)
            .collect())
    }

    async fn count_messages(&self, session_id: &str) -> Result<u64, RepositoryError> {
        self.check()?;
        Ok(self.rows.lock().iter().filter(|(sid, _)| sid == session_id).count() as u64)
    }
}

#[derive(Debug, Default)]
struct LogState {
    records: Vec<OutboxRecord>,
    dead_letters: Vec<DeadLetterEntry>,
    append_failing: bool,
    dead_letter_failing: bool,
    compact_failing: bool,
    compactions: usize,
}

/// Outbox log kept in memory. Clones share state, so dropping a queue and
/// opening a new one over a clone simulates a process restart.
#[derive(Debug, Clone, Default)]
pub struct InMemoryOutboxLog {
    state: Arc<Mutex<LogState>>,
}

impl InMemoryOutboxLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_count(&self) -> usize {
        self.state.lock().records.len()
    }

    pub fn set_append_failing(&self, failing: bool) {
        self.state.lock().append_failing = failing;
    }

    pub fn set_dead_letter_failing(&self, failing: bool) {
        self.state.lock().dead_letter_failing = failing;
    }

    pub fn set_compact_failing(&self, failing: bool) {
        self.state.lock().compact_failing = failing;
    }

    /// Successful `compact` calls so far.
    pub fn compaction_count(&self) -> usize {
        self.state.lock().compactions
    }
}

impl OutboxLog for InMemoryOutboxLog {
    async fn append(&self, record: &OutboxRecord) -> Result<(), OutboxError> {
        let mut state = self.state.lock();
        if state.append_failing {
            return Err(OutboxError::Io("injected append failure".to_string()));
        }
        state.records.push(record.clone());
        Ok(())
    }

    async fn load(&self) -> Result<Vec<OutboxRecord>, OutboxError> {
        Ok(self.state.lock().records.clone())
    }

    async fn compact(&self, pending: &[OutboxEntry]) -> Result<(), OutboxError> {
        let mut state = self.state.lock();
        if state.compact_failing {
            return Err(OutboxError::Io("injected compaction failure".to_string()));
        }
        state.compactions += 1;
        state.records = pending
            .iter()
            .map(|entry| {
                OutboxRecord::new(
                    OutboxEvent::Enqueued {
                        entry: entry.clone(),
                    },
                    entry.enqueued_at,
                )
            })
            .collect();
        Ok(())
    }

    async fn append_dead_letter(&self, dead_letter: &DeadLetterEntry) -> Result<(), OutboxError> {
        let mut state = self.state.lock();
        if state.dead_letter_failing {
            return Err(OutboxError::Io("injected dead-letter failure".to_string()));
        }
        state.dead_letters.push(dead_letter.clone());
        Ok(())
    }

    async fn load_dead_letters(&self) -> Result<Vec<DeadLetterEntry>, OutboxError> {
        Ok(self.state.lock().dead_letters.clone())
    }
}
