//! SQLite-based trace store

use crate::execution::{TraceEntry, TraceExit, TraceSink};
use crate::persistence::{RunSummary, TraceStore};
use anyhow::{Context as _, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqliteRow};
use sqlx::Row;
use std::path::Path;
use uuid::Uuid;

/// SQLite trace store
///
/// Records are stored as JSON bodies next to the columns queries filter on.
pub struct SqliteTraceStore {
    pool: SqlitePool,
}

impl SqliteTraceStore {
    /// Open (creating if needed) the database at `db_path`
    pub async fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(db_path.as_ref())
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options)
            .await
            .with_context(|| format!("Failed to open trace database {}", db_path.as_ref().display()))?;

        let store = Self { pool };
        store.init().await?;

        Ok(store)
    }

    /// Create store with default path
    pub async fn with_default_path() -> Result<Self> {
        Self::new(Self::default_path()?).await
    }

    /// `<local data dir>/brick-runtime/traces.db`
    pub fn default_path() -> Result<std::path::PathBuf> {
        let data_dir = dirs::data_local_dir().unwrap_or_else(|| std::path::PathBuf::from("."));
        let db_dir = data_dir.join("brick-runtime");
        std::fs::create_dir_all(&db_dir)
            .with_context(|| format!("Failed to create {}", db_dir.display()))?;
        Ok(db_dir.join("traces.db"))
    }

    /// Initialize database schema
    async fn init(&self) -> Result<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS trace_entries (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id TEXT NOT NULL,
                instance_id TEXT NOT NULL,
                brick_id TEXT NOT NULL,
                recorded_at TEXT NOT NULL,
                body TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS trace_exits (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id TEXT NOT NULL,
                instance_id TEXT NOT NULL,
                brick_id TEXT NOT NULL,
                is_error INTEGER NOT NULL DEFAULT 0,
                recorded_at TEXT NOT NULL,
                body TEXT NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_entries_run ON trace_entries(run_id)",
            "CREATE INDEX IF NOT EXISTS idx_exits_run ON trace_exits(run_id)",
        ];

        for statement in statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .context("Failed to initialize trace schema")?;
        }

        Ok(())
    }

    /// Convert DateTime<Utc> to NaiveDateTime for SQLite
    fn to_naive(dt: DateTime<Utc>) -> NaiveDateTime {
        dt.naive_utc()
    }

    /// Convert NaiveDateTime to DateTime<Utc>
    fn from_naive(dt: NaiveDateTime) -> DateTime<Utc> {
        DateTime::from_naive_utc_and_offset(dt, Utc)
    }

    fn decode_body<T: serde::de::DeserializeOwned>(row: &SqliteRow) -> Result<T> {
        let body: String = row.get("body");
        serde_json::from_str(&body).context("Corrupted trace record")
    }
}

#[async_trait::async_trait]
impl TraceSink for SqliteTraceStore {
    async fn add_entry(&self, entry: TraceEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO trace_entries (run_id, instance_id, brick_id, recorded_at, body)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(entry.run_id.to_string())
        .bind(entry.brick_instance_id.to_string())
        .bind(&entry.brick_id)
        .bind(Self::to_naive(entry.timestamp))
        .bind(serde_json::to_string(&entry)?)
        .execute(&self.pool)
        .await
        .context("Failed to save trace entry")?;

        Ok(())
    }

    async fn add_exit(&self, exit: TraceExit) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO trace_exits (run_id, instance_id, brick_id, is_error, recorded_at, body)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(exit.run_id.to_string())
        .bind(exit.brick_instance_id.to_string())
        .bind(&exit.brick_id)
        .bind(exit.is_error())
        .bind(Self::to_naive(exit.timestamp))
        .bind(serde_json::to_string(&exit)?)
        .execute(&self.pool)
        .await
        .context("Failed to save trace exit")?;

        Ok(())
    }
}

#[async_trait::async_trait]
impl TraceStore for SqliteTraceStore {
    async fn entries_for_run(&self, run_id: Uuid) -> Result<Vec<TraceEntry>> {
        let rows = sqlx::query("SELECT body FROM trace_entries WHERE run_id = ?1 ORDER BY seq ASC")
            .bind(run_id.to_string())
            .fetch_all(&self.pool)
            .await
            .context("Failed to load trace entries")?;

        rows.iter().map(Self::decode_body).collect()
    }

    async fn exits_for_run(&self, run_id: Uuid) -> Result<Vec<TraceExit>> {
        let rows = sqlx::query("SELECT body FROM trace_exits WHERE run_id = ?1 ORDER BY seq ASC")
            .bind(run_id.to_string())
            .fetch_all(&self.pool)
            .await
            .context("Failed to load trace exits")?;

        rows.iter().map(Self::decode_body).collect()
    }

    async fn list_runs(&self, limit: usize) -> Result<Vec<RunSummary>> {
        let rows = sqlx::query(
            r#"
            SELECT run_id,
                   SUM(kind = 'entry') AS entries,
                   SUM(kind = 'exit') AS exits,
                   SUM(is_error) AS errors,
                   MIN(recorded_at) AS first_seen,
                   MAX(recorded_at) AS last_seen
            FROM (
                SELECT run_id, 'entry' AS kind, 0 AS is_error, recorded_at FROM trace_entries
                UNION ALL
                SELECT run_id, 'exit' AS kind, is_error, recorded_at FROM trace_exits
            )
            GROUP BY run_id
            ORDER BY last_seen DESC
            LIMIT ?1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list runs")?;

        rows.iter()
            .map(|row| {
                Ok(RunSummary {
                    run_id: Uuid::parse_str(&row.get::<String, _>("run_id"))?,
                    entries: row.get::<i64, _>("entries") as usize,
                    exits: row.get::<i64, _>("exits") as usize,
                    errors: row.get::<i64, _>("errors") as usize,
                    first_seen: Self::from_naive(row.get("first_seen")),
                    last_seen: Self::from_naive(row.get("last_seen")),
                })
            })
            .collect()
    }
}
