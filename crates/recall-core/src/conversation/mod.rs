//! In-memory conversation state and prompt rendering.
//!
//! - `ConversationManager`: per-session sliding window with token budgeting
//! - `TokenCounter`: pluggable token counting with a heuristic fallback
//! - `prompt`: renders a context window for the prompt builder

pub mod manager;
pub mod prompt;
pub mod tokens;
