//! Recall operator CLI entry point.
//!
//! Binary name: `recall`
//!
//! Parses CLI arguments, wires the memory layer, then dispatches to the
//! command handler or runs the outbox replay loop.

mod cli;
mod state;

use std::time::Duration;

use clap::Parser;
use clap_complete::generate;
use console::style;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use cli::{Cli, Commands, OutboxCommand};
use recall_observe::tracing_setup::{
    init_tracing, shutdown_tracing, verbosity_filter, LogFormat, TracingOptions,
};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_tracing(&TracingOptions {
        default_filter: verbosity_filter(cli.verbose, cli.quiet).to_string(),
        format: if cli.log_json {
            LogFormat::Json
        } else {
            LogFormat::Pretty
        },
        otel: cli.otel,
    })
    .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;

    // Shell completions don't need app state
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = <Cli as clap::CommandFactory>::command();
        generate(*shell, &mut cmd, "recall", &mut std::io::stdout());
        return Ok(());
    }

    let state = AppState::init().await?;
    let result = dispatch(&state, cli).await;

    state.shutdown().await;
    shutdown_tracing();
    result
}

async fn dispatch(state: &AppState, cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Record {
            session,
            user,
            assistant,
            chunks,
        } => {
            cli::memory::record(state, &session, &user, &assistant, chunks, cli.json).await?;
        }

        Commands::Window { session, prompt } => {
            cli::memory::window(state, &session, prompt, cli.json).await?;
        }

        Commands::History {
            session,
            limit,
            offset,
            desc,
        } => {
            cli::memory::history(state, &session, limit, offset, desc, cli.json).await?;
        }

        Commands::Outbox { action } => match action {
            OutboxCommand::Status => cli::outbox::status(state, cli.json).await?,
            OutboxCommand::Replay => cli::outbox::replay(state, cli.json).await?,
            OutboxCommand::DeadLetters => cli::outbox::dead_letters(state, cli.json).await?,
        },

        Commands::Run { interval_ms } => {
            if !state.memory.is_durable() {
                anyhow::bail!("durable storage is disabled; there is no outbox to replay");
            }
            let interval = interval_ms
                .map(Duration::from_millis)
                .unwrap_or_else(|| state.config.outbox.replay_interval());
            if interval.is_zero() {
                anyhow::bail!("replay interval must be positive");
            }

            let cancel = CancellationToken::new();
            let handle = state.memory.spawn_replay_loop(interval, cancel.clone());

            if !cli.quiet {
                println!();
                println!(
                    "  {} Replaying outbox every {}ms (Ctrl+C to stop)",
                    style("▶").green().bold(),
                    interval.as_millis()
                );
            }

            shutdown_signal().await;
            cancel.cancel();
            if let Err(e) = handle.await {
                warn!(error = %e, "Replay loop task failed");
            }

            if !cli.quiet {
                let remaining = match state.memory.durable() {
                    Some(durable) => durable.outbox.depth().await,
                    None => 0,
                };
                println!("\n  Stopped. {remaining} entries pending.");
            }
        }

        Commands::Status => {
            cli::status::status(state, cli.json).await?;
        }

        Commands::Completions { .. } => unreachable!("handled before state init"),
    }

    Ok(())
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
