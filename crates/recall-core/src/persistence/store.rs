//! ConversationStore trait definition.
//!
//! The durable capability the memory layer consumes. Implementations live in
//! recall-infra (`SqliteConversationStore`) and, for tests, in
//! `crate::testing`. Uses native async fn in traits (RPITIT, Rust 2024 edition).

use recall_types::chat::{ConversationMessage, HistoryQuery};
use recall_types::error::RepositoryError;

/// Durable storage for conversation turns.
///
/// Writes must be idempotent per message: re-inserting a message with the
/// same `(session_id, timestamp, content)` is a successful no-op.
pub trait ConversationStore: Send + Sync {
    /// Insert each message individually, ignoring idempotency-key conflicts.
    fn insert_messages(
        &self,
        session_id: &str,
        messages: &[ConversationMessage],
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// One page of a session's history. `query.limit` is already clamped.
    fn fetch_history(
        &self,
        session_id: &str,
        query: HistoryQuery,
    ) -> impl std::future::Future<Output = Result<Vec<ConversationMessage>, RepositoryError>> + Send;

    /// Number of stored messages for a session.
    fn count_messages(
        &self,
        session_id: &str,
    ) -> impl std::future::Future<Output = Result<u64, RepositoryError>> + Send;
}
