//! Token counting for context windows.
//!
//! A precise tokenizer is optional. Whatever counter is installed, counting a
//! set of messages never fails: any tokenizer error falls back to the
//! character heuristic (1 token ~ 4 characters, rounded up).

use recall_types::chat::ConversationMessage;
use recall_types::error::TokenCountError;
use tracing::debug;

/// Tokens charged per message for role name and delimiters.
pub const MESSAGE_OVERHEAD_TOKENS: usize = 4;

/// Counts the tokens of a single text.
pub trait TokenCounter: Send + Sync {
    /// Short name for logs (e.g. "heuristic", "cl100k_base").
    fn name(&self) -> &str;

    /// Count the tokens in `text`.
    fn count(&self, text: &str) -> Result<usize, TokenCountError>;
}

/// Deterministic character-based estimate. Never fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicTokenCounter;

impl TokenCounter for HeuristicTokenCounter {
    fn name(&self) -> &str {
        "heuristic"
    }

    fn count(&self, text: &str) -> Result<usize, TokenCountError> {
        Ok(estimate_tokens(text))
    }
}

/// Heuristic: 1 token ~ 4 characters. Rounds up.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

/// Count one message with `counter`, falling back to the heuristic on error.
pub fn message_tokens(counter: &dyn TokenCounter, message: &ConversationMessage) -> usize {
    let content_tokens = match counter.count(&message.content) {
        Ok(n) => n,
        Err(err) => {
            debug!(counter = counter.name(), error = %err, "Token counter failed, using heuristic");
            estimate_tokens(&message.content)
        }
    };
    MESSAGE_OVERHEAD_TOKENS + content_tokens
}

/// Count a set of messages. Zero for an empty set, positive otherwise.
pub fn count_tokens(counter: &dyn TokenCounter, messages: &[ConversationMessage]) -> u32 {
    let total: usize = messages.iter().map(|m| message_tokens(counter, m)).sum();
    u32::try_from(total).unwrap_or(u32::MAX)
}
