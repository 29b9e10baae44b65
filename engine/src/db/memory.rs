//! SQLite memory store
//!
//! Long-term retrieval uses the FTS5 index over key and content, ranked by
//! bm25. Upserts are a single conditional statement, so concurrent writers
//! to one key are serialized by SQLite and the newest `updated_at` wins.

use async_trait::async_trait;
use sdk::errors::EngineError;
use sqlx::{Row, SqlitePool};

use super::db_error;
use crate::memory::{LongTermEntry, LongTermHit, MemoryStore, ShortTermEntry, UpsertOutcome};

pub struct SqliteMemoryStore {
    pool: SqlitePool,
}

impl SqliteMemoryStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Stored long-term entry for `key`
    pub async fn long_term(&self, key: &str) -> Result<Option<LongTermEntry>, EngineError> {
        let row = sqlx::query(
            "SELECT key, content, metadata, updated_at FROM long_term_memory WHERE key = ?",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to read long-term entry", e))?;

        Ok(row.map(|r| {
            let metadata: String = r.get("metadata");
            LongTermEntry {
                key: r.get("key"),
                content: r.get("content"),
                metadata: serde_json::from_str(&metadata).unwrap_or_default(),
                updated_at: r.get("updated_at"),
            }
        }))
    }
}

/// FTS5 query matching any word of `text`; `None` if it has no words
fn match_expression(text: &str) -> Option<String> {
    let terms: Vec<String> = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 1)
        .map(|t| format!("\"{}\"", t.to_lowercase()))
        .collect();

    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" OR "))
    }
}

#[async_trait]
impl MemoryStore for SqliteMemoryStore {
    async fn read_short_term(&self, run_id: &str) -> Result<Vec<ShortTermEntry>, EngineError> {
        let rows = sqlx::query(
            "SELECT kind, content, created_at FROM short_term_memory WHERE run_id = ? ORDER BY id",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to read short-term memory", e))?;

        Ok(rows
            .into_iter()
            .map(|r| ShortTermEntry {
                kind: r.get("kind"),
                content: r.get("content"),
                created_at: r.get("created_at"),
            })
            .collect())
    }

    async fn append_short_term(
        &self,
        run_id: &str,
        entry: ShortTermEntry,
    ) -> Result<(), EngineError> {
        sqlx::query(
            "INSERT INTO short_term_memory (run_id, kind, content, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(run_id)
        .bind(&entry.kind)
        .bind(&entry.content)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("Failed to append short-term memory", e))?;
        Ok(())
    }

    async fn query_long_term(
        &self,
        query: &str,
        k: usize,
    ) -> Result<Vec<LongTermHit>, EngineError> {
        let Some(expression) = match_expression(query) else {
            return Ok(Vec::new());
        };

        let rows = sqlx::query(
            r#"
            SELECT m.key AS key, m.content AS content, bm25(long_term_fts) AS relevance
            FROM long_term_fts
            JOIN long_term_memory m ON m.rowid = long_term_fts.rowid
            WHERE long_term_fts MATCH ?
            ORDER BY relevance, m.key
            LIMIT ?
            "#,
        )
        .bind(expression)
        .bind(k as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to execute FTS query on long_term_fts", e))?;

        // bm25 is lower-is-better and negative for matches
        Ok(rows
            .into_iter()
            .map(|r| {
                let relevance: f64 = r.get("relevance");
                LongTermHit {
                    key: r.get("key"),
                    content: r.get("content"),
                    score: -relevance,
                }
            })
            .collect())
    }

    async fn upsert_long_term(&self, entry: LongTermEntry) -> Result<UpsertOutcome, EngineError> {
        let metadata = serde_json::to_string(&entry.metadata)
            .map_err(|e| EngineError::Memory(format!("unserializable metadata: {}", e)))?;

        let result = sqlx::query(
            r#"
            INSERT INTO long_term_memory (key, content, metadata, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                content = excluded.content,
                metadata = excluded.metadata,
                updated_at = excluded.updated_at
            WHERE excluded.updated_at >= long_term_memory.updated_at
            "#,
        )
        .bind(&entry.key)
        .bind(&entry.content)
        .bind(metadata)
        .bind(entry.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("Failed to upsert long-term memory", e))?;

        if result.rows_affected() == 0 {
            tracing::debug!("Stale long-term write for {} ignored", entry.key);
            Ok(UpsertOutcome::Stale)
        } else {
            Ok(UpsertOutcome::Applied)
        }
    }
}
