//! Conversation message and context window types for Recall.
//!
//! These types model the turns of a tutoring conversation: individual
//! messages, the bounded window handed to prompt construction, and the
//! paging parameters used when reading durable history back.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use std::fmt;
use std::str::FromStr;

/// Hard cap on a single history page, regardless of what the caller asks for.
pub const MAX_HISTORY_LIMIT: u32 = 500;

/// Default history page size.
pub const DEFAULT_HISTORY_LIMIT: u32 = 100;

/// Author of a conversation message.
///
/// Only the two conversational roles are recorded; system prompts are
/// assembled elsewhere and never stored as turns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

impl fmt::Display for MessageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
        }
    }
}

impl FromStr for MessageRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "user" => Ok(MessageRole::User),
            "assistant" => Ok(MessageRole::Assistant),
            other => Err(format!("invalid message role: '{other}'")),
        }
    }
}

/// A single message within a conversation session.
///
/// `chunk_ids` lists the retrieval chunks cited by an assistant answer. It is
/// always present; user messages and uncited answers carry an empty list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub role: MessageRole,
    pub content: String,
    /// Creation time, truncated to microsecond precision.
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub chunk_ids: Vec<String>,
}

impl ConversationMessage {
    /// Create a user message stamped at `timestamp` (truncated to microseconds).
    pub fn user(content: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
            timestamp: truncate_to_micros(timestamp),
            chunk_ids: Vec::new(),
        }
    }

    /// Create an assistant message stamped at `timestamp` citing `chunk_ids`.
    pub fn assistant(
        content: impl Into<String>,
        timestamp: DateTime<Utc>,
        chunk_ids: Vec<String>,
    ) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
            timestamp: truncate_to_micros(timestamp),
            chunk_ids,
        }
    }
}

/// Build the user/assistant message pair for one turn.
///
/// The assistant message is stamped one microsecond after the user message
/// so the pair keeps its order under `created_at` sorting.
pub fn turn_messages(
    user_text: impl Into<String>,
    assistant_text: impl Into<String>,
    chunk_ids: Vec<String>,
    now: DateTime<Utc>,
) -> [ConversationMessage; 2] {
    let user = ConversationMessage::user(user_text, now);
    let assistant_at = user.timestamp + chrono::TimeDelta::microseconds(1);
    let assistant = ConversationMessage::assistant(assistant_text, assistant_at, chunk_ids);
    [user, assistant]
}

/// Drop sub-microsecond precision from a timestamp.
pub fn truncate_to_micros(ts: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(ts.timestamp_micros()).unwrap_or(ts)
}

/// The bounded, prompt-ready view of a session's recent turns.
///
/// `total_tokens` always equals the token count of exactly `messages`
/// under the counter that produced the window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatContextWindow {
    pub session_id: String,
    pub messages: Vec<ConversationMessage>,
    pub total_tokens: u32,
}

impl ChatContextWindow {
    /// An empty window for a session with no recorded turns.
    pub fn empty(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            messages: Vec::new(),
            total_tokens: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// Paging parameters for durable history reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryQuery {
    pub limit: u32,
    pub offset: u32,
    /// Newest first when true; chronological otherwise.
    pub order_desc: bool,
}

impl HistoryQuery {
    pub fn new(limit: u32, offset: u32, order_desc: bool) -> Self {
        Self {
            limit,
            offset,
            order_desc,
        }
    }

    /// The same query with `limit` capped at [`MAX_HISTORY_LIMIT`].
    pub fn clamped(self) -> Self {
        Self {
            limit: self.limit.min(MAX_HISTORY_LIMIT),
            ..self
        }
    }
}

impl Default for HistoryQuery {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LIMIT, 0, false)
    }
}

/// One turn as handed to durable storage (and to the outbox when storage is down).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnPayload {
    pub session_id: String,
    pub messages: Vec<ConversationMessage>,
}
