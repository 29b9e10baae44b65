//! SQLite trace store
//!
//! Events live in `trace_events` keyed by (run_id, seq). An append is
//! checked against the stored tail inside a transaction, so the table never
//! holds a gap or a duplicate.

use async_trait::async_trait;
use sdk::errors::EngineError;
use sqlx::{Row, SqlitePool};

use super::db_error;
use crate::trace::{TraceEvent, TraceStore};

pub struct SqliteTraceStore {
    pool: SqlitePool,
}

impl SqliteTraceStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TraceStore for SqliteTraceStore {
    async fn append(&self, event: &TraceEvent) -> Result<(), EngineError> {
        let payload = event.payload_json()?.to_string();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_error("Failed to begin trace append", e))?;

        let next: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(seq) + 1, 0) FROM trace_events WHERE run_id = ?",
        )
        .bind(&event.run_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| db_error("Failed to read trace tail", e))?;

        if next != event.seq as i64 {
            return Err(EngineError::Trace(format!(
                "out-of-order append to {}: expected #{}, got #{}",
                event.run_id, next, event.seq
            )));
        }

        sqlx::query(
            "INSERT INTO trace_events (run_id, seq, kind, timestamp, payload) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&event.run_id)
        .bind(event.seq as i64)
        .bind(event.kind().as_str())
        .bind(event.timestamp)
        .bind(payload)
        .execute(&mut *tx)
        .await
        .map_err(|e| db_error("Failed to append trace event", e))?;

        tx.commit()
            .await
            .map_err(|e| db_error("Failed to commit trace event", e))
    }

    async fn stream(&self, run_id: &str) -> Result<Vec<TraceEvent>, EngineError> {
        let rows = sqlx::query(
            "SELECT seq, kind, timestamp, payload FROM trace_events WHERE run_id = ? ORDER BY seq",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to read trace", e))?;

        if rows.is_empty() {
            return Err(EngineError::RunNotFound(run_id.to_string()));
        }

        rows.into_iter()
            .map(|r| {
                let seq: i64 = r.get("seq");
                let kind: String = r.get("kind");
                let payload: String = r.get("payload");
                let payload = serde_json::from_str(&payload).map_err(|e| {
                    EngineError::Trace(format!("corrupt payload at #{} of {}: {}", seq, run_id, e))
                })?;
                TraceEvent::from_parts(run_id.to_string(), seq as u64, r.get("timestamp"), &kind, payload)
            })
            .collect()
    }

    async fn list_runs(&self) -> Result<Vec<String>, EngineError> {
        sqlx::query_scalar(
            "SELECT run_id FROM trace_events GROUP BY run_id ORDER BY MIN(timestamp), run_id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to list traced runs", e))
    }
}
