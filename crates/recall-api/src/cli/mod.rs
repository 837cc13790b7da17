//! CLI command definitions for the `recall` binary.

pub mod memory;
pub mod outbox;
pub mod status;

use clap::{Parser, Subcommand};
use clap_complete::Shell;

/// Operate the Recall conversational memory layer.
#[derive(Parser)]
#[command(name = "recall", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for verbose, -vv for debug/trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Emit logs as JSON lines on stderr.
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Export spans through OpenTelemetry (stdout exporter).
    #[arg(long, global = true)]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Record one conversation turn.
    Record {
        /// Session identifier.
        session: String,

        /// The user's message.
        #[arg(long)]
        user: String,

        /// The assistant's reply.
        #[arg(long)]
        assistant: String,

        /// Retrieved chunk id the reply relied on (repeatable).
        #[arg(long = "chunk")]
        chunks: Vec<String>,
    },

    /// Show a session's context window.
    Window {
        /// Session identifier.
        session: String,

        /// Print the budgeted, prompt-ready rendering instead of a table.
        #[arg(long)]
        prompt: bool,
    },

    /// Page through a session's durable history.
    History {
        /// Session identifier.
        session: String,

        /// Page size (capped at 500).
        #[arg(long, default_value = "100")]
        limit: u32,

        /// Messages to skip.
        #[arg(long, default_value = "0")]
        offset: u32,

        /// Newest first.
        #[arg(long)]
        desc: bool,
    },

    /// Inspect or drain the outbox.
    Outbox {
        #[command(subcommand)]
        action: OutboxCommand,
    },

    /// Run the outbox replay loop until Ctrl+C.
    Run {
        /// Replay period in milliseconds (defaults to `outbox.replay_interval_ms`).
        #[arg(long)]
        interval_ms: Option<u64>,
    },

    /// Memory layer status dashboard.
    Status,

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

#[derive(Subcommand)]
pub enum OutboxCommand {
    /// Queue depth and pending entries.
    Status,

    /// Run one replay cycle now.
    Replay,

    /// List entries that exhausted their retries.
    #[command(name = "dead-letters")]
    DeadLetters,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parse_record_with_chunks() {
        let cli = Cli::try_parse_from([
            "recall", "record", "s1", "--user", "hi", "--assistant", "hello", "--chunk", "c1",
            "--chunk", "c2",
        ])
        .unwrap();
        match cli.command {
            Commands::Record {
                session,
                user,
                assistant,
                chunks,
            } => {
                assert_eq!(session, "s1");
                assert_eq!(user, "hi");
                assert_eq!(assistant, "hello");
                assert_eq!(chunks, vec!["c1", "c2"]);
            }
            _ => panic!("expected record"),
        }
    }

    #[test]
    fn parse_history_defaults_and_global_flags() {
        let cli = Cli::try_parse_from(["recall", "history", "s1", "--json", "-vv"]).unwrap();
        assert!(cli.json);
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Commands::History {
                limit,
                offset,
                desc,
                ..
            } => {
                assert_eq!(limit, 100);
                assert_eq!(offset, 0);
                assert!(!desc);
            }
            _ => panic!("expected history"),
        }
    }

    #[test]
    fn parse_outbox_dead_letters() {
        let cli = Cli::try_parse_from(["recall", "outbox", "dead-letters"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Outbox {
                action: OutboxCommand::DeadLetters
            }
        ));
    }

    #[test]
    fn record_requires_both_sides() {
        assert!(Cli::try_parse_from(["recall", "record", "s1", "--user", "hi"]).is_err());
    }
}
