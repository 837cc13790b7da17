//! Conversation memory commands: record, window, history.

use anyhow::Result;
use comfy_table::{presets, Cell, Color, ContentArrangement, Table};
use console::style;

use recall_core::conversation::prompt::compact;
use recall_types::chat::{ConversationMessage, HistoryQuery, MessageRole};

use crate::state::AppState;

/// Width content is cut to in message tables.
const PREVIEW_CHARS: usize = 80;

/// Record one turn, then show the resulting window.
pub async fn record(
    state: &AppState,
    session: &str,
    user: &str,
    assistant: &str,
    chunks: Vec<String>,
    json: bool,
) -> Result<()> {
    state.memory.add_turn(session, user, assistant, chunks).await;
    let window = state.memory.get_context_window(session).await;

    if json {
        println!("{}", serde_json::to_string_pretty(&window)?);
        return Ok(());
    }

    let pending = match state.memory.durable() {
        Some(durable) => durable.outbox.depth().await,
        None => 0,
    };

    println!();
    println!(
        "  {} Recorded turn in session {}",
        style("✓").green().bold(),
        style(session).cyan()
    );
    if !state.memory.is_durable() {
        println!("  {}", style("Memory-only mode: turn was not persisted.").yellow());
    } else if pending > 0 {
        println!(
            "  {} {} turn(s) waiting in the outbox",
            style("!").yellow().bold(),
            pending
        );
    }
    println!(
        "  Window: {} messages, {} tokens",
        style(window.messages.len()).bold(),
        window.total_tokens
    );
    println!();
    Ok(())
}

/// Show the context window as a table, or the rendered prompt history.
pub async fn window(state: &AppState, session: &str, prompt: bool, json: bool) -> Result<()> {
    if prompt {
        let rendered = state.memory.build_prompt_history(session).await;
        if json {
            let out = serde_json::json!({
                "session_id": session,
                "prompt_history": rendered,
            });
            println!("{}", serde_json::to_string_pretty(&out)?);
        } else {
            println!("{rendered}");
        }
        return Ok(());
    }

    let window = state.memory.get_context_window(session).await;
    if json {
        println!("{}", serde_json::to_string_pretty(&window)?);
        return Ok(());
    }

    if window.is_empty() {
        println!();
        println!("  No turns recorded for session {}.", style(session).cyan());
        println!();
        return Ok(());
    }

    println!();
    println!(
        "  {} Context window for {} ({} tokens)",
        style("◆").bold(),
        style(session).cyan(),
        window.total_tokens
    );
    println!();
    println!("{}", message_table(&window.messages));
    println!();
    Ok(())
}

/// One page of durable history.
pub async fn history(
    state: &AppState,
    session: &str,
    limit: u32,
    offset: u32,
    desc: bool,
    json: bool,
) -> Result<()> {
    if !state.memory.is_durable() {
        anyhow::bail!("durable storage is disabled; history is not available");
    }

    let query = HistoryQuery::new(limit, offset, desc);
    let messages = state.memory.load_session_history(session, query).await;

    if json {
        println!("{}", serde_json::to_string_pretty(&messages)?);
        return Ok(());
    }

    if messages.is_empty() {
        println!();
        println!("  No stored messages for session {}.", style(session).cyan());
        println!();
        return Ok(());
    }

    println!();
    println!("{}", message_table(&messages));
    println!(
        "  {}",
        style(format!(
            "{} message(s), offset {}{}",
            messages.len(),
            offset,
            if desc { ", newest first" } else { "" }
        ))
        .dim()
    );
    println!();
    Ok(())
}

fn message_table(messages: &[ConversationMessage]) -> Table {
    let mut table = Table::new();
    table.load_preset(presets::UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        Cell::new("Time").fg(Color::White),
        Cell::new("Role").fg(Color::White),
        Cell::new("Content").fg(Color::White),
        Cell::new("Chunks").fg(Color::White),
    ]);

    for message in messages {
        let role = match message.role {
            MessageRole::User => Cell::new("user").fg(Color::Cyan),
            MessageRole::Assistant => Cell::new("assistant").fg(Color::Green),
        };
        table.add_row(vec![
            Cell::new(message.timestamp.format("%Y-%m-%d %H:%M:%S%.6f")).fg(Color::DarkGrey),
            role,
            Cell::new(compact(&message.content, PREVIEW_CHARS)),
            Cell::new(message.chunk_ids.join(", ")).fg(Color::DarkGrey),
        ]);
    }
    table
}
