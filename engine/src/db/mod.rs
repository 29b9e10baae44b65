/// Database module for SQLite persistence
///
/// Backs run history, traces, memory and approvals with one SQLite file.
/// Connections use WAL mode so the CLI can read traces and answer approvals
/// while a run is writing.
use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::ConnectOptions;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

pub mod approvals;
pub mod memory;
pub mod runs;
pub mod traces;

pub use approvals::SqliteApprovals;
pub use memory::SqliteMemoryStore;
pub use runs::{RunRepository, RunRow};
pub use traces::SqliteTraceStore;

/// Map a sqlx failure into the engine error type
pub(crate) fn db_error(context: &str, err: sqlx::Error) -> sdk::errors::EngineError {
    sdk::errors::EngineError::Database(format!("{}: {}", context, err))
}

/// Database connection pool
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (or create) the database and apply the schema.
    ///
    /// SQLite replays a leftover WAL on open, so an unclean shutdown needs
    /// no extra recovery step.
    pub async fn new(db_path: &Path) -> Result<Self> {
        info!("Initializing database at: {}", db_path.display());

        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("Failed to create database directory")?;
        }

        let connection_string = format!("sqlite:{}", db_path.display());
        let options = SqliteConnectOptions::from_str(&connection_string)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5))
            .disable_statement_logging();

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .context("Failed to connect to database")?;

        debug!("Database connection established");

        let db = Self { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::raw_sql(include_str!("../../migrations/001_initial.sql"))
            .execute(&self.pool)
            .await
            .context("Failed to execute migration 001_initial.sql")?;

        info!("Database migrations completed successfully");
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Checkpoint the WAL into the main database file
    pub async fn flush_wal(&self) -> Result<()> {
        info!("Flushing WAL to disk");

        sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
            .execute(&self.pool)
            .await
            .context("Failed to flush WAL")?;

        debug!("WAL flushed successfully");
        Ok(())
    }

    /// Flush the WAL and close every pooled connection
    pub async fn close(self) -> Result<()> {
        info!("Closing database connection");
        self.flush_wal().await?;
        self.pool.close().await;
        info!("Database connection closed");
        Ok(())
    }

    pub fn runs(&self) -> RunRepository {
        RunRepository::new(self.pool.clone())
    }

    pub fn memory(&self) -> SqliteMemoryStore {
        SqliteMemoryStore::new(self.pool.clone())
    }

    pub fn traces(&self) -> SqliteTraceStore {
        SqliteTraceStore::new(self.pool.clone())
    }

    /// Approval channel whose requests lapse after `window`
    pub fn approvals(&self, window: Duration, poll_interval: Duration) -> SqliteApprovals {
        SqliteApprovals::new(self.pool.clone(), window, poll_interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_database_creation() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("nested").join("cairn.db");

        let db = Database::new(&db_path).await.unwrap();
        assert!(db_path.exists());

        let result = sqlx::query("SELECT 1").fetch_one(db.pool()).await;
        assert!(result.is_ok());

        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_migrations_create_tables() {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::new(&temp_dir.path().join("cairn.db")).await.unwrap();

        let tables: Vec<String> =
            sqlx::query_scalar("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
                .fetch_all(db.pool())
                .await
                .unwrap();

        for table in ["runs", "trace_events", "short_term_memory", "long_term_memory", "approvals"] {
            assert!(tables.contains(&table.to_string()), "missing {}", table);
        }

        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_migrations_are_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("cairn.db");

        Database::new(&db_path).await.unwrap().close().await.unwrap();
        let db = Database::new(&db_path).await.unwrap();
        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_wal_mode_enabled() {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::new(&temp_dir.path().join("cairn.db")).await.unwrap();

        let journal_mode: String = sqlx::query_scalar("PRAGMA journal_mode")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(journal_mode.to_lowercase(), "wal");

        db.close().await.unwrap();
    }
}
