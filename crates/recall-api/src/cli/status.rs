//! Memory layer status dashboard.

use anyhow::Result;
use console::style;

use recall_core::breaker::CircuitStateKind;

use crate::state::AppState;

/// Show mode, window settings, breaker state, outbox depth, and metrics.
pub async fn status(state: &AppState, json: bool) -> Result<()> {
    let breaker = state.memory.breaker_status();
    let (depth, dead_letters) = match state.memory.durable() {
        Some(durable) => {
            let dead = durable.outbox.dead_letters().await.map(|d| d.len()).ok();
            (Some(durable.outbox.depth().await), dead)
        }
        None => (None, None),
    };
    let metrics = state.memory.metrics().snapshot();
    let conv = &state.config.conversation;

    if json {
        let status = serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "data_dir": state.data_dir.display().to_string(),
            "durable": state.memory.is_durable(),
            "conversation": {
                "max_turns": conv.max_turns,
                "max_tokens": conv.max_tokens,
            },
            "breaker": breaker,
            "outbox": {
                "depth": depth,
                "dead_letters": dead_letters,
            },
            "metrics": metrics,
        });
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!();
    println!("  {} Recall v{}", style("⚡").bold(), env!("CARGO_PKG_VERSION"));
    println!();

    println!("  {}", style("── Memory ──").dim());
    println!(
        "  Mode:     {}",
        if state.memory.is_durable() {
            style("durable (SQLite + outbox)").green()
        } else {
            style("memory-only").yellow()
        }
    );
    println!("  Window:   {} turns, {} tokens", conv.max_turns, conv.max_tokens);
    println!();

    if let Some(breaker) = &breaker {
        println!("  {}", style("── Store circuit ──").dim());
        let state_label = match breaker.state {
            CircuitStateKind::Closed => style(breaker.state.to_string()).green(),
            CircuitStateKind::HalfOpen => style(breaker.state.to_string()).yellow(),
            CircuitStateKind::Open => style(breaker.state.to_string()).red(),
        };
        println!("  State:    {state_label}");
        println!(
            "  Calls:    {} ({} failed, {} rejected)",
            breaker.total_calls, breaker.total_failures, breaker.total_rejections
        );
        if let Some(err) = &breaker.last_error {
            println!("  Last err: {}", style(err).dim());
        }
        println!();
    }

    if let Some(depth) = depth {
        println!("  {}", style("── Outbox ──").dim());
        println!("  Pending:      {}", style(depth).bold());
        match dead_letters {
            Some(0) => println!("  Dead letters: 0"),
            Some(n) => println!("  Dead letters: {}", style(n).red()),
            None => println!("  Dead letters: {}", style("unreadable").red()),
        }
        println!();
    }

    println!("  {}", style("── This process ──").dim());
    println!(
        "  Window hits:   {} ({:.0}%)",
        metrics.window_hits,
        metrics.window_hit_ratio() * 100.0
    );
    println!("  Rehydrations:  {}", metrics.rehydrations);
    println!(
        "  Store writes:  {} ok, {} failed",
        metrics.durable_writes_ok, metrics.durable_writes_failed
    );
    println!();

    println!("  {}", style("── System ──").dim());
    println!("  Data dir: {}", style(state.data_dir.display()).dim());
    if state.memory.is_durable() {
        println!(
            "  Database: {}",
            style(format!("{} (WAL mode)", state.config.durability.database_file)).dim()
        );
    }
    println!();

    Ok(())
}
