//! In-memory sliding window over each session's recent turns.
//!
//! The session map is sharded (`DashMap`) and every session has its own
//! lock, so appends and reads for one session are serialized while different
//! sessions never contend. The window bound is applied when reading; the
//! backing list keeps a few windows' worth of history and sheds the oldest
//! messages beyond that (the durable copy stays reachable through paginated
//! history reads).

use std::sync::Arc;

use chrono::{TimeDelta, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

use recall_types::chat::{turn_messages, ChatContextWindow, ConversationMessage, MessageRole};
use recall_types::config::ConversationConfig;
use recall_types::error::ConfigError;

use super::prompt;
use super::tokens::{count_tokens, message_tokens, HeuristicTokenCounter, TokenCounter};

/// Backing lists hold at most this many windows before shedding old messages.
const RETAINED_WINDOWS: usize = 4;

type SessionLog = Arc<Mutex<Vec<ConversationMessage>>>;

/// Messages that survived budget truncation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BudgetedMessages {
    pub messages: Vec<ConversationMessage>,
    pub total_tokens: u32,
    /// Messages removed from the oldest end.
    pub dropped: usize,
}

/// Fast, bounded per-session conversation memory.
///
/// Constructed once at startup and shared by reference (`Arc`) with request
/// handlers.
pub struct ConversationManager {
    config: ConversationConfig,
    counter: Arc<dyn TokenCounter>,
    sessions: DashMap<String, SessionLog>,
}

impl ConversationManager {
    /// Create a manager using the character heuristic for token counts.
    pub fn new(config: ConversationConfig) -> Result<Self, ConfigError> {
        Self::with_counter(config, Arc::new(HeuristicTokenCounter))
    }

    /// Create a manager with a specific token counter.
    ///
    /// Fails only on malformed configuration.
    pub fn with_counter(
        config: ConversationConfig,
        counter: Arc<dyn TokenCounter>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            counter,
            sessions: DashMap::new(),
        })
    }

    pub fn config(&self) -> &ConversationConfig {
        &self.config
    }

    /// Maximum number of messages in a context window (`2 * max_turns`).
    pub fn window_limit(&self) -> usize {
        self.config.window_messages()
    }

    /// Record one turn: the user message, then the assistant message.
    ///
    /// Returns the two stored messages so callers can persist exactly what
    /// the window holds (same timestamps, same idempotency keys).
    pub fn add_turn(
        &self,
        session_id: &str,
        user_text: &str,
        assistant_text: &str,
        chunk_ids: Vec<String>,
    ) -> [ConversationMessage; 2] {
        let log = self.session_log(session_id);
        let mut log = log.lock();
        // Timestamps strictly increase within a session, so durable reads
        // ordered by creation time reproduce the append order.
        let now = match log.last() {
            Some(last) => Utc::now().max(last.timestamp + TimeDelta::microseconds(1)),
            None => Utc::now(),
        };
        let messages = turn_messages(user_text, assistant_text, chunk_ids, now);
        self.push_bounded(&mut log, &messages);
        messages
    }

    fn push_bounded(&self, log: &mut Vec<ConversationMessage>, messages: &[ConversationMessage]) {
        log.extend_from_slice(messages);
        let retain = self.window_limit() * RETAINED_WINDOWS;
        if log.len() > retain {
            let excess = log.len() - retain;
            log.drain(..excess);
        }
    }

    /// The last `2 * max_turns` messages of a session, oldest first.
    ///
    /// Unseen sessions yield an empty window with zero tokens.
    pub fn get_context_window(&self, session_id: &str) -> ChatContextWindow {
        let Some(log) = self.sessions.get(session_id).map(|e| Arc::clone(e.value())) else {
            return ChatContextWindow::empty(session_id);
        };

        let messages: Vec<ConversationMessage> = {
            let log = log.lock();
            let start = log.len().saturating_sub(self.window_limit());
            log[start..].to_vec()
        };

        let total_tokens = self.count_tokens(&messages);
        ChatContextWindow {
            session_id: session_id.to_string(),
            messages,
            total_tokens,
        }
    }

    /// Whether the session has any messages in memory.
    pub fn has_session(&self, session_id: &str) -> bool {
        self.sessions
            .get(session_id)
            .is_some_and(|e| !e.value().lock().is_empty())
    }

    /// Seed a cold session from durable history (chronological order).
    ///
    /// Does nothing if the session already holds messages: a turn recorded
    /// while the history was loading wins over the stale copy.
    pub fn hydrate(&self, session_id: &str, history: Vec<ConversationMessage>) -> bool {
        if history.is_empty() {
            return false;
        }
        let log = self.session_log(session_id);
        let mut log = log.lock();
        if !log.is_empty() {
            return false;
        }
        debug!(session_id, messages = history.len(), "Hydrated session from durable history");
        *log = history;
        true
    }

    /// Token estimate for a set of messages. Never fails.
    pub fn count_tokens(&self, messages: &[ConversationMessage]) -> u32 {
        count_tokens(self.counter.as_ref(), messages)
    }

    /// Drop whole turns from the oldest end until the rest fits `max_tokens`.
    ///
    /// The most recent turn (2 messages) is always kept, even when it alone
    /// exceeds the budget.
    pub fn truncate_to_budget(&self, messages: &[ConversationMessage]) -> BudgetedMessages {
        let costs: Vec<u32> = messages
            .iter()
            .map(|m| u32::try_from(message_tokens(self.counter.as_ref(), m)).unwrap_or(u32::MAX))
            .collect();
        let mut total: u32 = costs.iter().fold(0u32, |acc, c| acc.saturating_add(*c));
        let mut start = 0;

        while total > self.config.max_tokens && messages.len() - start > 2 {
            // A turn is a user message followed by its answer; an orphaned
            // leading answer counts as a turn of its own.
            let turn_len = match (messages.get(start), messages.get(start + 1)) {
                (Some(first), Some(second))
                    if first.role == MessageRole::User && second.role == MessageRole::Assistant =>
                {
                    2
                }
                _ => 1,
            };
            let turn_len = turn_len.min(messages.len() - start - 2).max(1);
            for cost in &costs[start..start + turn_len] {
                total = total.saturating_sub(*cost);
            }
            start += turn_len;
        }

        BudgetedMessages {
            messages: messages[start..].to_vec(),
            total_tokens: total,
            dropped: start,
        }
    }

    /// Render a window for the prompt builder.
    pub fn format_for_prompt(&self, window: &ChatContextWindow) -> String {
        prompt::format_history(
            &window.messages,
            self.config.compact_length,
            self.config.full_recent_messages,
        )
    }

    /// Window, budget, and render in one step.
    pub fn build_prompt_history(&self, session_id: &str) -> String {
        let window = self.get_context_window(session_id);
        let budgeted = self.truncate_to_budget(&window.messages);
        self.format_for_prompt(&ChatContextWindow {
            session_id: window.session_id,
            messages: budgeted.messages,
            total_tokens: budgeted.total_tokens,
        })
    }

    /// Forget a session's in-memory turns. Durable history is untouched.
    pub fn clear_session(&self, session_id: &str) -> bool {
        self.sessions.remove(session_id).is_some()
    }

    /// Number of sessions currently held in memory.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Drop every session (test construction path only).
    #[cfg(any(test, feature = "test-util"))]
    pub fn reset(&self) {
        self.sessions.clear();
    }

    fn session_log(&self, session_id: &str) -> SessionLog {
        if let Some(log) = self.sessions.get(session_id) {
            return Arc::clone(log.value());
        }
        Arc::clone(
            self.sessions
                .entry(session_id.to_string())
                .or_default()
                .value(),
        )
    }
}
