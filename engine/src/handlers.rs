//! Command handlers for CLI operations
//!
//! Each handler opens what it needs from the configuration, does one thing
//! and prints either text or JSON. [`build_engine`] assembles the full
//! orchestration stack for `cairn run`.

use anyhow::{Context, Result};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::conductor::approval::{ApprovalChannel, ApprovalGate, PolicyApprovals};
use crate::conductor::executor::Executor;
use crate::conductor::hierarchical::HierarchicalPlanner;
use crate::conductor::orchestrator::{LoopSettings, Orchestrator, RunOutcome};
use crate::conductor::planner::{LlmPlanner, Planner};
use crate::conductor::reflector::result_text;
use crate::conductor::template::TemplatePlanner;
use crate::conductor::types::{new_run_id, Goal, GoalConstraints};
use crate::config::{ApprovalMode, Config, LLMConfig, MemoryBackend, PlannerMode, TraceBackend};
use crate::db::Database;
use crate::llm::ollama::OllamaProvider;
use crate::llm::openai::OpenAIProvider;
use crate::llm::retry::RetryPolicy;
use crate::llm::scripted::ScriptedProvider;
use crate::llm::{CompletionOptions, LLMProvider};
use crate::memory::{InMemoryStore, MemoryStore};
use crate::sandbox::LocalSandbox;
use crate::skills::{builtin_registry, SkillRegistry};
use crate::trace::replay::Replayer;
use crate::trace::{JsonlTraceStore, TraceEvent, TracePayload, TraceStore};

/// Output format for command results
#[derive(Debug, Clone, Copy)]
pub enum OutputFormat {
    /// Human-readable text output
    Text,
    /// JSON output for machine consumption
    Json,
}

/// Everything `cairn run` needs, wired from one configuration
pub struct Engine {
    pub database: Database,
    pub orchestrator: Orchestrator,
    pub memory: Arc<dyn MemoryStore>,
    pub traces: Arc<dyn TraceStore>,
}

pub async fn open_database(config: &Config) -> Result<Database> {
    Database::new(&config.database_path())
        .await
        .context("Failed to open database")
}

pub fn memory_store(config: &Config, database: &Database) -> Arc<dyn MemoryStore> {
    match config.memory.backend {
        MemoryBackend::Sqlite => Arc::new(database.memory()),
        MemoryBackend::Memory => Arc::new(InMemoryStore::new()),
    }
}

pub fn trace_store(config: &Config, database: &Database) -> Result<Arc<dyn TraceStore>> {
    Ok(match config.trace.backend {
        TraceBackend::Sqlite => Arc::new(database.traces()),
        TraceBackend::Jsonl => Arc::new(JsonlTraceStore::new(&config.trace.dir)?),
    })
}

/// Completion provider named by `llm.provider`
pub fn provider_from_config(config: &LLMConfig) -> Arc<dyn LLMProvider> {
    match config.provider.as_str() {
        "openai" => Arc::new(OpenAIProvider::new(config.openai.clone())),
        // Offline: every completion request fails, so only template plans work
        "scripted" => Arc::new(ScriptedProvider::new(Vec::<String>::new())),
        _ => Arc::new(OllamaProvider::new(
            config.ollama.base_url.clone(),
            config.ollama.model.clone(),
        )),
    }
}

/// Planner for `planner.mode`
pub fn planner_from_config(config: &Config, provider: Arc<dyn LLMProvider>) -> Arc<dyn Planner> {
    let options = CompletionOptions {
        temperature: config.llm.temperature,
        max_tokens: config.llm.max_tokens,
    };
    let retry = RetryPolicy::from_config(&config.llm);

    match config.planner.mode {
        PlannerMode::Template => Arc::new(TemplatePlanner::new()),
        PlannerMode::Flat => Arc::new(LlmPlanner::new(provider, options, retry)),
        PlannerMode::Hierarchical => {
            let inner = LlmPlanner::new(provider, options, retry).with_delegation();
            Arc::new(HierarchicalPlanner::new(Arc::new(inner), config.planner.max_depth))
        }
    }
}

fn approval_channel(config: &Config, database: &Database) -> Arc<dyn ApprovalChannel> {
    match config.approval.mode {
        ApprovalMode::Interactive => Arc::new(database.approvals(
            Duration::from_secs(config.approval.window_secs),
            Duration::from_millis(config.approval.poll_interval_ms),
        )),
        ApprovalMode::AutoApprove => Arc::new(PolicyApprovals::auto_approve()),
        ApprovalMode::AutoDeny => Arc::new(PolicyApprovals::auto_deny()),
    }
}

/// Installed skills for this configuration
pub async fn registry_from_config(config: &Config) -> Result<SkillRegistry> {
    let database = open_database(config).await?;
    let memory = memory_store(config, &database);
    Ok(builtin_registry(config, memory)?)
}

pub async fn build_engine(config: &Config) -> Result<Engine> {
    let database = open_database(config).await?;
    let memory = memory_store(config, &database);
    let traces = trace_store(config, &database)?;
    let registry = builtin_registry(config, Arc::clone(&memory))?;

    let provider = provider_from_config(&config.llm);
    tracing::info!(
        "Planner: {:?} via {} ({} skill(s))",
        config.planner.mode,
        provider.name(),
        registry.len()
    );
    let planner = planner_from_config(config, provider);

    let gate = ApprovalGate::new(
        approval_channel(config, &database),
        Duration::from_secs(config.approval.window_secs),
    );
    let executor = Executor::new(
        Arc::new(LocalSandbox::new(Duration::from_millis(config.sandbox.kill_grace_ms))),
        gate,
        config.sandbox.limits(),
        config.core.workspace.clone(),
        config.agent.max_concurrency,
    );

    let orchestrator = Orchestrator::new(
        planner,
        executor,
        Arc::clone(&memory),
        Arc::clone(&traces),
        registry,
        LoopSettings::from_config(&config.agent, &config.memory),
    );

    Ok(Engine {
        database,
        orchestrator,
        memory,
        traces,
    })
}

/// Run a goal to a terminal state
pub async fn handle_run(
    goal: String,
    constraints: GoalConstraints,
    config: &Config,
    format: OutputFormat,
    cancel: CancellationToken,
) -> Result<()> {
    let engine = build_engine(config).await?;
    let goal = Goal::new(goal).with_constraints(constraints);
    let run_id = new_run_id();

    let runs = engine.database.runs();
    runs.create(&run_id, &goal).await?;
    let outcome = engine.orchestrator.run_with_id(run_id, goal, &cancel).await;
    if let Err(e) = runs.finish(&outcome).await {
        tracing::error!("Failed to record outcome of {}: {}", outcome.run_id, e);
    }

    match format {
        OutputFormat::Text => print_outcome(&outcome),
        OutputFormat::Json => {
            let output = json!({
                "run_id": outcome.run_id,
                "state": outcome.state,
                "reason": outcome.reason,
                "iterations": outcome.iterations,
                "budget": outcome.budget,
                "result": result_text(&outcome.records),
                "error": outcome.error,
                "records": outcome.records,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    engine.database.close().await?;

    if outcome.succeeded() {
        Ok(())
    } else {
        Err(anyhow::anyhow!(
            "Run {} ended {} ({})",
            outcome.run_id,
            outcome.state,
            outcome.reason
        ))
    }
}

fn print_outcome(outcome: &RunOutcome) {
    println!("Run {}", outcome.run_id);
    println!("  Goal: {}", outcome.goal.text);
    println!("  State: {} ({})", outcome.state, outcome.reason);
    println!(
        "  Iterations: {}, steps: {}, cost: {}, tokens: {}",
        outcome.iterations,
        outcome.budget.steps_used,
        outcome.budget.cost_used,
        outcome.budget.tokens_used
    );
    println!();

    for record in &outcome.records {
        let skill = record.skill.as_deref().unwrap_or("delegate");
        print!("  [{}] {}/{} {}", record.status, record.plan_id, record.step_id, skill);
        match &record.error {
            Some(err) => println!(" - {}: {}", err.kind, err.message),
            None => println!(" ({}ms)", record.duration_ms),
        }
    }

    if let Some(text) = result_text(&outcome.records) {
        println!();
        println!("{}", text);
    }
    if let Some(err) = &outcome.error {
        println!();
        println!("Error: {}", err);
    }
}

/// Show the most recent runs
pub async fn handle_history(limit: usize, config: &Config, format: OutputFormat) -> Result<()> {
    let database = open_database(config).await?;
    let runs = database.runs().recent(limit as i64).await?;

    match format {
        OutputFormat::Text => {
            if runs.is_empty() {
                println!("No runs in history");
                return Ok(());
            }

            println!("Run History (last {} runs):", limit);
            println!();

            for run in runs {
                println!("Run ID: {}", run.id);
                println!("  Goal: {}", run.goal);
                match run.reason {
                    Some(reason) => println!("  State: {} ({})", run.state, reason),
                    None => println!("  State: {}", run.state),
                }
                println!(
                    "  Steps: {}, cost: {}, iterations: {}",
                    run.steps_used, run.cost_used, run.iterations
                );

                let started = chrono::DateTime::from_timestamp_millis(run.started_at)
                    .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_else(|| "Unknown".to_string());
                println!("  Started: {}", started);
                println!();
            }
        }
        OutputFormat::Json => {
            let output = json!({
                "runs": runs,
                "count": runs.len(),
                "limit": limit
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}

/// Print every trace event of a run
pub async fn handle_trace(run_id: String, config: &Config, format: OutputFormat) -> Result<()> {
    let database = open_database(config).await?;
    let traces = trace_store(config, &database)?;
    let events = traces.stream(&run_id).await?;

    match format {
        OutputFormat::Text => {
            println!("Trace of {} ({} events):", run_id, events.len());
            for event in &events {
                println!("  #{:<4} {:<18} {}", event.seq, event.kind(), describe(event));
            }
        }
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&events)?),
    }
    Ok(())
}

/// One-line summary of an event
fn describe(event: &TraceEvent) -> String {
    match &event.payload {
        TracePayload::PlanCreated { plan, .. } => format!(
            "{} with {} step(s), {} child plan(s): {}",
            plan.id,
            plan.steps.len(),
            plan.walk().len() - 1,
            plan.rationale
        ),
        TracePayload::StepStarted {
            plan_id,
            step_id,
            skill,
        } => format!("{}/{} {}", plan_id, step_id, skill.as_deref().unwrap_or("delegate")),
        TracePayload::StepCompleted { record } => format!(
            "{}/{} {}{}",
            record.plan_id,
            record.step_id,
            record.status,
            record
                .error
                .as_ref()
                .map(|e| format!(": {}", e))
                .unwrap_or_default()
        ),
        TracePayload::ApprovalRequested { request } => {
            format!("{} for {} {}", request.id, request.skill, request.arguments)
        }
        TracePayload::ApprovalResolved { request_id, state, .. } => {
            format!("{} {}", request_id, state)
        }
        TracePayload::Reflection { context, reflection } => {
            format!("{} {}: {}", context.plan_id, reflection.decision, reflection.summary)
        }
        TracePayload::RunTerminated { state, reason, .. } => format!("{} ({})", state, reason),
    }
}

/// Replay a recorded run and report divergences
pub async fn handle_replay(run_id: String, config: &Config, format: OutputFormat) -> Result<()> {
    let database = open_database(config).await?;
    let traces = trace_store(config, &database)?;
    let registry = builtin_registry(config, memory_store(config, &database))?;

    let report = Replayer::new(traces, registry).replay(&run_id).await?;

    match format {
        OutputFormat::Text => {
            println!("Replay of {} ({} events)", report.run_id, report.events);
            for plan in &report.plans {
                println!("  Plan {}: {} step(s)", plan.id, plan.steps.len());
            }
            for reflection in &report.reflections {
                println!("  Decision: {} - {}", reflection.decision, reflection.summary);
            }
            for (id, state) in &report.approvals {
                println!("  Approval {}: {}", id, state);
            }
            if let Some((state, reason)) = report.terminal {
                println!("  Terminated: {} ({})", state, reason);
            }
            println!();
            if report.is_faithful() {
                println!("Replay matches the recorded run.");
            } else {
                println!("{} divergence(s):", report.divergences.len());
                for divergence in &report.divergences {
                    println!("  - {}", divergence);
                }
            }
        }
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
    }

    if report.is_faithful() {
        Ok(())
    } else {
        Err(anyhow::anyhow!("Replay of {} diverged", run_id))
    }
}

/// List installed skills
pub async fn handle_skills(config: &Config, format: OutputFormat) -> Result<()> {
    let registry = registry_from_config(config).await?;
    let mut contracts = registry.list();
    contracts.sort_by(|a, b| a.name.cmp(&b.name));

    match format {
        OutputFormat::Text => {
            println!("Installed skills:");
            for contract in contracts {
                println!(
                    "  {:<16} {:<10} cost {:<3} {}",
                    contract.name,
                    contract.side_effect.as_str(),
                    contract.cost,
                    contract.description
                );
            }
        }
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&contracts)?),
    }
    Ok(())
}

/// List approvals waiting for an answer
pub async fn handle_approvals_list(config: &Config, format: OutputFormat) -> Result<()> {
    let database = open_database(config).await?;
    let approvals = database.approvals(
        Duration::from_secs(config.approval.window_secs),
        Duration::from_millis(config.approval.poll_interval_ms),
    );
    let pending = approvals.list_pending().await?;

    match format {
        OutputFormat::Text => {
            if pending.is_empty() {
                println!("No pending approvals");
            }
            for request in pending {
                println!("{}", request.id);
                println!("  Skill: {}", request.skill);
                println!("  Arguments: {}", request.arguments);
            }
        }
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&pending)?),
    }
    Ok(())
}

/// Approve or deny a pending approval
pub async fn handle_approval_decision(id: String, approve: bool, config: &Config) -> Result<()> {
    let database = open_database(config).await?;
    let approvals = database.approvals(
        Duration::from_secs(config.approval.window_secs),
        Duration::from_millis(config.approval.poll_interval_ms),
    );

    if approve {
        approvals.approve(&id).await?;
        println!("Approved {}", id);
    } else {
        approvals.deny(&id).await?;
        println!("Denied {}", id);
    }
    Ok(())
}

/// Search long-term memory
pub async fn handle_memory_search(
    query: String,
    k: usize,
    config: &Config,
    format: OutputFormat,
) -> Result<()> {
    let database = open_database(config).await?;
    let memory = memory_store(config, &database);
    let hits = memory.query_long_term(&query, k).await?;

    match format {
        OutputFormat::Text => {
            if hits.is_empty() {
                println!("No matches for '{}'", query);
            }
            for hit in hits {
                println!("{} (score {:.3})", hit.key, hit.score);
                println!("  {}", hit.content);
            }
        }
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&hits)?),
    }
    Ok(())
}
