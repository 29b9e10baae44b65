/// Run history
///
/// One row per run: the goal it was given, the terminal state it reached
/// and the budget it consumed. Traces hold the detail; this table answers
/// `cairn history`.
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::conductor::orchestrator::RunOutcome;
use crate::conductor::types::{Goal, GoalConstraints, RunState, StepError, TerminationReason};

/// Run history record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRow {
    pub id: String,
    pub goal: String,
    pub constraints: GoalConstraints,
    pub state: RunState,
    pub reason: Option<TerminationReason>,
    pub iterations: i64,
    pub steps_used: i64,
    pub cost_used: i64,
    pub tokens_used: i64,
    pub error: Option<StepError>,
    pub started_at: i64,
    pub finished_at: Option<i64>,
}

pub struct RunRepository {
    pool: SqlitePool,
}

impl RunRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Record a run that is about to start
    pub async fn create(&self, id: &str, goal: &Goal) -> Result<()> {
        let constraints = serde_json::to_string(&goal.constraints)?;
        let now = chrono::Utc::now().timestamp_millis();

        sqlx::query(
            "INSERT INTO runs (id, goal, constraints, state, started_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(id)
        .bind(&goal.text)
        .bind(constraints)
        .bind(RunState::Running.as_str())
        .bind(now)
        .execute(&self.pool)
        .await
        .context("Failed to create run")?;

        Ok(())
    }

    /// Store the terminal state of a run
    pub async fn finish(&self, outcome: &RunOutcome) -> Result<()> {
        let error = outcome
            .error
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let now = chrono::Utc::now().timestamp_millis();

        let result = sqlx::query(
            "UPDATE runs SET state = ?, reason = ?, iterations = ?, steps_used = ?, cost_used = ?, \
             tokens_used = ?, error = ?, finished_at = ? WHERE id = ?",
        )
        .bind(outcome.state.as_str())
        .bind(outcome.reason.as_str())
        .bind(i64::from(outcome.iterations))
        .bind(outcome.budget.steps_used as i64)
        .bind(outcome.budget.cost_used as i64)
        .bind(outcome.budget.tokens_used as i64)
        .bind(error)
        .bind(now)
        .bind(&outcome.run_id)
        .execute(&self.pool)
        .await
        .context("Failed to finish run")?;

        if result.rows_affected() == 0 {
            anyhow::bail!("Run {} was never recorded", outcome.run_id);
        }
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Option<RunRow>> {
        let row = sqlx::query(
            "SELECT id, goal, constraints, state, reason, iterations, steps_used, cost_used, \
             tokens_used, error, started_at, finished_at FROM runs WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch run")?;

        row.map(|r| run_from_row(&r)).transpose()
    }

    /// Most recent runs, newest first
    pub async fn recent(&self, limit: i64) -> Result<Vec<RunRow>> {
        let rows = sqlx::query(
            "SELECT id, goal, constraints, state, reason, iterations, steps_used, cost_used, \
             tokens_used, error, started_at, finished_at FROM runs \
             ORDER BY started_at DESC, id DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch run history")?;

        rows.iter().map(run_from_row).collect()
    }
}

fn run_from_row(r: &SqliteRow) -> Result<RunRow> {
    let state: String = r.get("state");
    let reason: Option<String> = r.get("reason");
    let constraints: String = r.get("constraints");
    let error: Option<String> = r.get("error");

    Ok(RunRow {
        id: r.get("id"),
        goal: r.get("goal"),
        constraints: serde_json::from_str(&constraints).unwrap_or_default(),
        // A row left behind by a crashed process stays "running"
        state: RunState::parse(&state).unwrap_or(RunState::Running),
        reason: reason.as_deref().and_then(TerminationReason::parse),
        iterations: r.get("iterations"),
        steps_used: r.get("steps_used"),
        cost_used: r.get("cost_used"),
        tokens_used: r.get("tokens_used"),
        error: error.as_deref().and_then(|e| serde_json::from_str(e).ok()),
        started_at: r.get("started_at"),
        finished_at: r.get("finished_at"),
    })
}
