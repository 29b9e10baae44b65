// Cairn autonomous task agent
// Main entry point for the cairn binary

use cairn_engine::cli::{ApprovalAction, Cli, Command, MemoryAction};
use cairn_engine::conductor::types::GoalConstraints;
use cairn_engine::config::Config;
use cairn_engine::handlers::{
    handle_approval_decision, handle_approvals_list, handle_history, handle_memory_search,
    handle_replay, handle_run, handle_skills, handle_trace, OutputFormat,
};
use cairn_engine::telemetry::{init_telemetry, LogFormat};
use clap::Parser;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let format = if cli.json {
        OutputFormat::Json
    } else {
        OutputFormat::Text
    };

    let config = if let Some(config_path) = &cli.config {
        Config::load_from_path(config_path)?
    } else {
        Config::load_or_create()?
    };

    // --log beats the config file; RUST_LOG beats both
    let log_level = cli.log.as_deref().unwrap_or(&config.core.log_level);
    init_telemetry(log_level, LogFormat::parse(&config.core.log_format));

    tracing::info!(
        "Cairn v{} ({} - {})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_COMMIT_HASH"),
        env!("BUILD_TIMESTAMP")
    );

    match cli.command {
        Command::Run {
            goal,
            max_steps,
            max_cost,
            skills,
        } => {
            let cancel = CancellationToken::new();
            {
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        tracing::warn!("Interrupt received, cancelling run");
                        cancel.cancel();
                    }
                });
            }

            let constraints = GoalConstraints {
                max_steps,
                max_cost,
                allowed_skills: skills,
            };
            handle_run(goal, constraints, &config, format, cancel).await
        }

        Command::Replay { run_id } => {
            tracing::info!("Replaying run: {}", run_id);
            handle_replay(run_id, &config, format).await
        }

        Command::History { limit } => handle_history(limit, &config, format).await,

        Command::Trace { run_id } => handle_trace(run_id, &config, format).await,

        Command::Skills => handle_skills(&config, format).await,

        Command::Approvals { action } => match action {
            ApprovalAction::List => handle_approvals_list(&config, format).await,
            ApprovalAction::Approve { id } => handle_approval_decision(id, true, &config).await,
            ApprovalAction::Deny { id } => handle_approval_decision(id, false, &config).await,
        },

        Command::Memory { action } => match action {
            MemoryAction::Search { query, k } => {
                handle_memory_search(query, k, &config, format).await
            }
        },
    }
}
