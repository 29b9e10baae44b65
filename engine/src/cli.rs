//! CLI interface for Cairn
//!
//! This module provides the command-line interface using clap's derive API.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Cairn autonomous task agent
///
/// Plans a goal into skill invocations, runs them under budget and approval
/// control, and records every decision for replay.
#[derive(Parser, Debug)]
#[command(name = "cairn")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Output in JSON format
    #[arg(long, global = true)]
    pub json: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, global = true, value_name = "LEVEL")]
    pub log: Option<String>,

    /// Specify alternate configuration file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a goal to completion
    Run {
        /// The goal, in plain language
        goal: String,

        /// Step ceiling for this run
        #[arg(long, value_name = "N")]
        max_steps: Option<u64>,

        /// Cost ceiling for this run
        #[arg(long, value_name = "C")]
        max_cost: Option<u64>,

        /// Comma-separated skills this run may use
        #[arg(long, value_delimiter = ',', value_name = "SKILLS")]
        skills: Option<Vec<String>>,
    },

    /// Re-derive a recorded run from its trace and report divergences
    Replay {
        /// Run ID to replay
        run_id: String,
    },

    /// Show run history
    History {
        /// Number of runs to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Print the trace events of a run
    Trace {
        /// Run ID
        run_id: String,
    },

    /// List installed skills and their contracts
    Skills,

    /// Manage pending approvals
    Approvals {
        #[command(subcommand)]
        action: ApprovalAction,
    },

    /// Inspect long-term memory
    Memory {
        #[command(subcommand)]
        action: MemoryAction,
    },
}

/// Approval actions
#[derive(Subcommand, Debug)]
pub enum ApprovalAction {
    /// List approvals waiting for an answer
    List,

    /// Approve a pending step
    Approve {
        /// Approval ID as shown by `list`
        id: String,
    },

    /// Deny a pending step
    Deny {
        /// Approval ID as shown by `list`
        id: String,
    },
}

/// Memory actions
#[derive(Subcommand, Debug)]
pub enum MemoryAction {
    /// Search long-term memory
    Search {
        /// Query text
        query: String,

        /// Number of results
        #[arg(short, long, default_value = "5")]
        k: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_parses() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_with_constraints() {
        let cli = Cli::try_parse_from([
            "cairn",
            "run",
            "summarize https://example.com",
            "--max-steps",
            "4",
            "--skills",
            "web.fetch,text.summarize",
            "--json",
        ])
        .unwrap();

        assert!(cli.json);
        match cli.command {
            Command::Run {
                goal,
                max_steps,
                max_cost,
                skills,
            } => {
                assert_eq!(goal, "summarize https://example.com");
                assert_eq!(max_steps, Some(4));
                assert_eq!(max_cost, None);
                assert_eq!(
                    skills,
                    Some(vec!["web.fetch".to_string(), "text.summarize".to_string()])
                );
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_approval_subcommands() {
        let cli = Cli::try_parse_from(["cairn", "approvals", "approve", "run_1:plan-1:save"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Approvals {
                action: ApprovalAction::Approve { id }
            } if id == "run_1:plan-1:save"
        ));
    }
}
