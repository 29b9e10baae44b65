//! SQLite approval channel
//!
//! A sensitive step writes its request as an `awaiting_approval` row and
//! polls it. Any process sharing the database file, usually
//! `cairn approvals approve <id>`, resolves it by updating the row. Rows
//! carry an expiry; a lapsed request can no longer be answered.

use async_trait::async_trait;
use sdk::errors::EngineError;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::time::Duration;

use super::db_error;
use crate::conductor::approval::{ApprovalChannel, ApprovalDecision, ApprovalRequest, ApprovalState};

pub struct SqliteApprovals {
    pool: SqlitePool,
    window: Duration,
    poll_interval: Duration,
}

impl SqliteApprovals {
    pub fn new(pool: SqlitePool, window: Duration, poll_interval: Duration) -> Self {
        Self {
            pool,
            window,
            poll_interval: poll_interval.max(Duration::from_millis(10)),
        }
    }

    /// Requests still waiting for an answer, oldest first. Lapsed rows are
    /// marked `timed_out` on the way.
    pub async fn list_pending(&self) -> Result<Vec<ApprovalRequest>, EngineError> {
        let now = chrono::Utc::now().timestamp_millis();

        sqlx::query(
            "UPDATE approvals SET state = ?, resolved_at = ? WHERE state = ? AND expires_at <= ?",
        )
        .bind(ApprovalState::TimedOut.as_str())
        .bind(now)
        .bind(ApprovalState::AwaitingApproval.as_str())
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("Failed to expire approvals", e))?;

        let rows = sqlx::query(
            "SELECT id, run_id, plan_id, step_id, skill, arguments, requested_at FROM approvals \
             WHERE state = ? ORDER BY requested_at, id",
        )
        .bind(ApprovalState::AwaitingApproval.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to list approvals", e))?;

        Ok(rows.iter().map(request_from_row).collect())
    }

    pub async fn approve(&self, id: &str) -> Result<(), EngineError> {
        self.resolve(id, ApprovalDecision::Approved).await
    }

    pub async fn deny(&self, id: &str) -> Result<(), EngineError> {
        self.resolve(id, ApprovalDecision::Denied).await
    }

    async fn resolve(&self, id: &str, decision: ApprovalDecision) -> Result<(), EngineError> {
        let now = chrono::Utc::now().timestamp_millis();
        let state: ApprovalState = decision.into();

        let result = sqlx::query(
            "UPDATE approvals SET state = ?, resolved_at = ? \
             WHERE id = ? AND state = ? AND expires_at > ?",
        )
        .bind(state.as_str())
        .bind(now)
        .bind(id)
        .bind(ApprovalState::AwaitingApproval.as_str())
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("Failed to resolve approval", e))?;

        if result.rows_affected() == 0 {
            return Err(EngineError::Validation(format!(
                "no pending approval {} (unknown, resolved or lapsed)",
                id
            )));
        }
        tracing::info!("Approval {} resolved: {}", id, state);
        Ok(())
    }

    async fn state_of(&self, id: &str) -> Result<Option<ApprovalState>, EngineError> {
        let state: Option<String> = sqlx::query_scalar("SELECT state FROM approvals WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_error("Failed to poll approval", e))?;
        Ok(state.as_deref().and_then(ApprovalState::parse))
    }
}

fn request_from_row(r: &SqliteRow) -> ApprovalRequest {
    let arguments: String = r.get("arguments");
    ApprovalRequest {
        id: r.get("id"),
        run_id: r.get("run_id"),
        plan_id: r.get("plan_id"),
        step_id: r.get("step_id"),
        skill: r.get("skill"),
        arguments: serde_json::from_str(&arguments).unwrap_or_default(),
        requested_at: r.get("requested_at"),
    }
}

#[async_trait]
impl ApprovalChannel for SqliteApprovals {
    async fn request(&self, request: &ApprovalRequest) -> Result<ApprovalDecision, EngineError> {
        let expires_at = request.requested_at + self.window.as_millis() as i64;

        sqlx::query(
            "INSERT OR REPLACE INTO approvals \
             (id, run_id, plan_id, step_id, skill, arguments, state, requested_at, expires_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&request.id)
        .bind(&request.run_id)
        .bind(&request.plan_id)
        .bind(&request.step_id)
        .bind(&request.skill)
        .bind(request.arguments.to_string())
        .bind(ApprovalState::AwaitingApproval.as_str())
        .bind(request.requested_at)
        .bind(expires_at)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("Failed to record approval request", e))?;

        tracing::info!(
            "Approval {} pending: run `cairn approvals approve {}` or `deny`",
            request.step_id,
            request.id
        );

        let mut ticker = tokio::time::interval(self.poll_interval);
        loop {
            ticker.tick().await;
            match self.state_of(&request.id).await? {
                Some(ApprovalState::Approved) => return Ok(ApprovalDecision::Approved),
                Some(ApprovalState::Denied) | Some(ApprovalState::TimedOut) | None => {
                    return Ok(ApprovalDecision::Denied)
                }
                Some(ApprovalState::Proposed) | Some(ApprovalState::AwaitingApproval) => {}
            }
        }
    }
}
