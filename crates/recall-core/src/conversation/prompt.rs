//! Prompt rendering for conversation history.
//!
//! Recent messages are rendered verbatim; older ones are compacted to a fixed
//! number of characters so long answers early in a session do not crowd out
//! the retrieved context.

use recall_types::chat::{ConversationMessage, MessageRole};

/// Rendered in place of history on a session's first turn.
pub const FIRST_INTERACTION_MARKER: &str =
    "(No previous conversation: this is the first interaction with the student.)";

/// Heading placed above rendered history.
pub const HISTORY_HEADER: &str = "Previous conversation (oldest first):";

/// Marker appended to compacted messages.
pub const ELLIPSIS: &str = "...";

/// Render messages for the prompt builder.
///
/// The last `full_recent` messages are kept whole; everything before them is
/// flattened to a single line and cut to `compact_length` characters.
pub fn format_history(
    messages: &[ConversationMessage],
    compact_length: usize,
    full_recent: usize,
) -> String {
    if messages.is_empty() {
        return FIRST_INTERACTION_MARKER.to_string();
    }

    let first_full = messages.len().saturating_sub(full_recent);
    let mut out = String::from(HISTORY_HEADER);
    for (i, message) in messages.iter().enumerate() {
        let text = if i >= first_full {
            message.content.trim().to_string()
        } else {
            compact(&message.content, compact_length)
        };
        out.push('\n');
        out.push_str(role_label(message.role));
        out.push_str(": ");
        out.push_str(&text);
    }
    out
}

/// Speaker label as the tutoring prompt expects it.
pub fn role_label(role: MessageRole) -> &'static str {
    match role {
        MessageRole::User => "Student",
        MessageRole::Assistant => "Tutor",
    }
}

/// Collapse whitespace and cut to `max_chars`, ellipsis included.
pub fn compact(text: &str, max_chars: usize) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= max_chars {
        return flat;
    }
    let keep = max_chars.saturating_sub(ELLIPSIS.len());
    let mut cut: String = flat.chars().take(keep).collect();
    cut.truncate(cut.trim_end().len());
    cut.push_str(ELLIPSIS);
    cut
}
