//! Outbox inspection and manual replay.

use anyhow::Result;
use chrono::Utc;
use comfy_table::{presets, Cell, Color, ContentArrangement, Table};
use console::style;

use recall_core::hybrid::DurableBackend;
use recall_infra::outbox::JsonlOutboxLog;
use recall_infra::sqlite::persistence::SqliteConversationStore;
use recall_types::outbox::OutboxEntry;

use crate::state::AppState;

type Backend = DurableBackend<SqliteConversationStore, JsonlOutboxLog>;

fn backend(state: &AppState) -> Result<&Backend> {
    state
        .memory
        .durable()
        .ok_or_else(|| anyhow::anyhow!("durable storage is disabled; there is no outbox"))
}

/// Queue depth and the pending entries.
pub async fn status(state: &AppState, json: bool) -> Result<()> {
    let backend = backend(state)?;
    let pending = backend.outbox.pending().await;

    if json {
        let out = serde_json::json!({
            "depth": pending.len(),
            "outbox_path": backend.outbox.log().outbox_path().display().to_string(),
            "pending": pending,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} Outbox: {} pending",
        style("◆").bold(),
        style(pending.len()).bold()
    );
    println!(
        "  {}",
        style(backend.outbox.log().outbox_path().display()).dim()
    );
    println!();
    if !pending.is_empty() {
        println!("{}", entry_table(&pending));
        println!();
    }
    Ok(())
}

/// One replay cycle, then the report.
pub async fn replay(state: &AppState, json: bool) -> Result<()> {
    let backend = backend(state)?;
    let report = state.memory.replay_outbox().await;
    let remaining = backend.outbox.depth().await;

    if json {
        let out = serde_json::json!({
            "report": report,
            "remaining": remaining,
            "breaker": backend.breaker.status(),
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    if report.is_idle() {
        println!("  Nothing to replay.");
    } else {
        println!("  Delivered:     {}", style(report.delivered).green());
        println!("  Retrying:      {}", style(report.retried).yellow());
        println!("  Dead-lettered: {}", style(report.dead_lettered).red());
        if report.deferred > 0 {
            println!(
                "  Deferred:      {} (circuit {})",
                style(report.deferred).yellow(),
                backend.breaker.state_kind()
            );
        }
        if report.not_yet_due > 0 {
            println!("  Backing off:   {}", report.not_yet_due);
        }
    }
    println!("  Remaining:     {}", style(remaining).bold());
    println!();
    Ok(())
}

/// Entries moved out of the outbox after exhausting their retries.
pub async fn dead_letters(state: &AppState, json: bool) -> Result<()> {
    let backend = backend(state)?;
    let dead = backend.outbox.dead_letters().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&dead)?);
        return Ok(());
    }

    if dead.is_empty() {
        println!();
        println!("  No dead letters.");
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(presets::UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        Cell::new("Id").fg(Color::White),
        Cell::new("Session").fg(Color::White),
        Cell::new("Attempts").fg(Color::White),
        Cell::new("Dead-lettered").fg(Color::White),
        Cell::new("Reason").fg(Color::White),
    ]);
    for letter in &dead {
        table.add_row(vec![
            Cell::new(letter.entry.id).fg(Color::DarkGrey),
            Cell::new(payload_session(&letter.entry)).fg(Color::Cyan),
            Cell::new(letter.entry.attempts),
            Cell::new(letter.dead_lettered_at.format("%Y-%m-%d %H:%M:%S")),
            Cell::new(&letter.reason).fg(Color::Red),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

fn entry_table(entries: &[OutboxEntry]) -> Table {
    let now = Utc::now();
    let mut table = Table::new();
    table.load_preset(presets::UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        Cell::new("Id").fg(Color::White),
        Cell::new("Session").fg(Color::White),
        Cell::new("Attempts").fg(Color::White),
        Cell::new("Next attempt").fg(Color::White),
        Cell::new("Last error").fg(Color::White),
    ]);

    for entry in entries {
        let next = if entry.is_due(now) {
            Cell::new("due").fg(Color::Green)
        } else {
            Cell::new(format!("in {}s", (entry.next_attempt_at - now).num_seconds()))
                .fg(Color::Yellow)
        };
        table.add_row(vec![
            Cell::new(entry.id).fg(Color::DarkGrey),
            Cell::new(payload_session(entry)).fg(Color::Cyan),
            Cell::new(entry.attempts),
            next,
            Cell::new(entry.last_error.as_deref().unwrap_or("-")).fg(Color::DarkGrey),
        ]);
    }
    table
}

/// The session a turn payload belongs to, if it is one.
fn payload_session(entry: &OutboxEntry) -> &str {
    entry
        .payload
        .get("session_id")
        .and_then(serde_json::Value::as_str)
        .unwrap_or("?")
}
