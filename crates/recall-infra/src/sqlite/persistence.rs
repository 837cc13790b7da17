//! SQLite conversation store.
//!
//! Implements `ConversationStore` from `recall-core` using sqlx with split
//! read/write pools. Each message is its own INSERT inside one transaction
//! per turn; a repeated idempotency key is skipped by the conflict clause.

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::Row;
use uuid::Uuid;

use recall_core::persistence::ConversationStore;
use recall_types::chat::{ConversationMessage, HistoryQuery, MessageRole};
use recall_types::error::RepositoryError;

use super::pool::DatabasePool;
use crate::crypto::idempotency::generate_idempotency_key;

/// SQLite-backed implementation of `ConversationStore`.
pub struct SqliteConversationStore {
    pool: DatabasePool,
}

impl SqliteConversationStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DatabasePool {
        &self.pool
    }
}

// ---------------------------------------------------------------------------
// Private Row type for SQLite-to-domain mapping
// ---------------------------------------------------------------------------

struct ConversationMessageRow {
    role: String,
    content: String,
    chunk_ids: String,
    created_at: String,
}

impl ConversationMessageRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            role: row.try_get("role")?,
            content: row.try_get("content")?,
            chunk_ids: row.try_get("chunk_ids")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn into_message(self) -> Result<ConversationMessage, RepositoryError> {
        let role: MessageRole = self
            .role
            .parse()
            .map_err(|e: String| RepositoryError::Query(e))?;
        // A JSON null reads back as an empty list.
        let chunk_ids: Option<Vec<String>> = serde_json::from_str(&self.chunk_ids)
            .map_err(|e| RepositoryError::Query(format!("invalid chunk_ids: {e}")))?;

        Ok(ConversationMessage {
            role,
            content: self.content,
            timestamp: parse_datetime(&self.created_at)?,
            chunk_ids: chunk_ids.unwrap_or_default(),
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

/// Pool-level failures mean the database is unreachable; everything else is
/// a failed statement.
fn store_error(e: sqlx::Error) -> RepositoryError {
    match e {
        sqlx::Error::PoolClosed | sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => {
            RepositoryError::Connection
        }
        other => RepositoryError::Query(other.to_string()),
    }
}

/// Fixed-width microsecond RFC 3339, so text order is time order.
fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

// ---------------------------------------------------------------------------
// ConversationStore implementation
// ---------------------------------------------------------------------------

impl ConversationStore for SqliteConversationStore {
    async fn insert_messages(
        &self,
        session_id: &str,
        messages: &[ConversationMessage],
    ) -> Result<(), RepositoryError> {
        let mut tx = self
            .pool
            .writer
            .begin()
            .await
            .map_err(store_error)?;

        for message in messages {
            let chunk_ids = serde_json::to_string(&message.chunk_ids)
                .map_err(|e| RepositoryError::Query(e.to_string()))?;
            sqlx::query(
                r#"INSERT INTO conversation_messages
                       (id, session_id, role, content, chunk_ids, metadata, created_at, idempotency_key)
                   VALUES (?, ?, ?, ?, ?, '{}', ?, ?)
                   ON CONFLICT(idempotency_key) DO NOTHING"#,
            )
            .bind(Uuid::now_v7().to_string())
            .bind(session_id)
            .bind(message.role.to_string())
            .bind(&message.content)
            .bind(chunk_ids)
            .bind(format_datetime(&message.timestamp))
            .bind(generate_idempotency_key(
                session_id,
                message.timestamp,
                &message.content,
            ))
            .execute(&mut *tx)
            .await
            .map_err(store_error)?;
        }

        tx.commit()
            .await
            .map_err(store_error)
    }

    async fn fetch_history(
        &self,
        session_id: &str,
        query: HistoryQuery,
    ) -> Result<Vec<ConversationMessage>, RepositoryError> {
        let sql = if query.order_desc {
            "SELECT role, content, chunk_ids, created_at FROM conversation_messages
             WHERE session_id = ? ORDER BY created_at DESC, rowid DESC LIMIT ? OFFSET ?"
        } else {
            "SELECT role, content, chunk_ids, created_at FROM conversation_messages
             WHERE session_id = ? ORDER BY created_at ASC, rowid ASC LIMIT ? OFFSET ?"
        };

        let rows = sqlx::query(sql)
            .bind(session_id)
            .bind(i64::from(query.limit))
            .bind(i64::from(query.offset))
            .fetch_all(&self.pool.reader)
            .await
            .map_err(store_error)?;

        let mut messages = Vec::with_capacity(rows.len());
        for row in &rows {
            let message_row = ConversationMessageRow::from_row(row)
                .map_err(store_error)?;
            messages.push(message_row.into_message()?);
        }
        Ok(messages)
    }

    async fn count_messages(&self, session_id: &str) -> Result<u64, RepositoryError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM conversation_messages WHERE session_id = ?")
            .bind(session_id)
            .fetch_one(&self.pool.reader)
            .await
            .map_err(store_error)?;
        let count: i64 = row
            .try_get("n")
            .map_err(store_error)?;
        Ok(count.max(0) as u64)
    }
}
