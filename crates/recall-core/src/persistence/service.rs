//! Persistence service: idempotent writes and paginated reads of turns.
//!
//! Wraps a [`ConversationStore`] with the memory layer's error policy. The
//! `try_*` methods report failures so the circuit breaker can count them;
//! the plain methods swallow them (false / empty) and log a warning.

use tracing::warn;

use recall_types::chat::{ConversationMessage, HistoryQuery};
use recall_types::error::RepositoryError;

use super::store::ConversationStore;

pub struct PersistenceService<S> {
    store: S,
}

impl<S: ConversationStore> PersistenceService<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Write a batch of messages. Empty input succeeds without a store call.
    pub async fn try_save_messages(
        &self,
        session_id: &str,
        messages: &[ConversationMessage],
    ) -> Result<(), RepositoryError> {
        if messages.is_empty() {
            return Ok(());
        }
        self.store.insert_messages(session_id, messages).await
    }

    /// Write a batch of messages; `false` on any storage error.
    pub async fn save_messages(&self, session_id: &str, messages: &[ConversationMessage]) -> bool {
        match self.try_save_messages(session_id, messages).await {
            Ok(()) => true,
            Err(e) => {
                warn!(session_id, error = %e, "Failed to save conversation messages");
                false
            }
        }
    }

    /// Read one page of history with the limit clamped to the hard maximum.
    pub async fn try_load_session_history(
        &self,
        session_id: &str,
        query: HistoryQuery,
    ) -> Result<Vec<ConversationMessage>, RepositoryError> {
        self.store.fetch_history(session_id, query.clamped()).await
    }

    /// Read one page of history; empty on any storage error.
    pub async fn load_session_history(
        &self,
        session_id: &str,
        query: HistoryQuery,
    ) -> Vec<ConversationMessage> {
        match self.try_load_session_history(session_id, query).await {
            Ok(messages) => messages,
            Err(e) => {
                warn!(session_id, error = %e, "Failed to load conversation history");
                Vec::new()
            }
        }
    }

    pub async fn count_messages(&self, session_id: &str) -> Result<u64, RepositoryError> {
        self.store.count_messages(session_id).await
    }
}
