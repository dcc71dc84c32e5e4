//! SQLite-backed persistence: checkpoints, run rows, and a stage audit log.
//!
//! Three tables:
//!
//! - `runs` — one row per run holding status, metadata, and result
//!   references, upserted via [`SqliteCheckpointStore::record_run`].
//! - `checkpoints` — one row per committed stage, written through the
//!   [`CheckpointStore`] impl with the same contiguity enforcement as the
//!   in-memory store.
//! - `stage_log` — one row per stage attempt (name, message, level,
//!   timestamp), an audit trail appended via
//!   [`SqliteCheckpointStore::log_attempt`].

use std::str::FromStr;

use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};

use crate::checkpoint::{Checkpoint, CheckpointError, CheckpointStore};
use crate::persistence::PersistedState;
use crate::run::{RunId, RunStatusView};
use crate::state::SharedState;

/// Durable checkpoint store plus the relational run/audit binding.
#[derive(Clone)]
pub struct SqliteCheckpointStore {
    pool: SqlitePool,
}

fn backend(e: impl std::fmt::Display) -> CheckpointError {
    CheckpointError::Backend {
        message: e.to_string(),
    }
}

impl SqliteCheckpointStore {
    /// Connects to `url` (e.g. `sqlite://castflow.db`), creating the file
    /// and schema when missing.
    pub async fn connect(url: &str) -> Result<Self, CheckpointError> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(backend)?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(backend)?;
        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    /// Connects using `CASTFLOW_SQLITE_URL`, falling back to
    /// `sqlite://$SQLITE_DB_NAME` and then `sqlite://castflow.db`.
    pub async fn from_env() -> Result<Self, CheckpointError> {
        dotenvy::dotenv().ok();
        let url = std::env::var("CASTFLOW_SQLITE_URL").unwrap_or_else(|_| {
            let name = std::env::var("SQLITE_DB_NAME").unwrap_or_else(|_| "castflow.db".to_string());
            format!("sqlite://{name}")
        });
        Self::connect(&url).await
    }

    async fn ensure_schema(&self) -> Result<(), CheckpointError> {
        for statement in [
            r"CREATE TABLE IF NOT EXISTS runs (
                run_id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                current_stage TEXT,
                error_json TEXT,
                artifacts_json TEXT NOT NULL DEFAULT '[]',
                created_at TEXT NOT NULL,
                finished_at TEXT
            )",
            r"CREATE TABLE IF NOT EXISTS checkpoints (
                run_id TEXT NOT NULL,
                stage_index INTEGER NOT NULL,
                stage_name TEXT NOT NULL,
                state_json TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (run_id, stage_index)
            )",
            r"CREATE TABLE IF NOT EXISTS stage_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id TEXT NOT NULL,
                stage TEXT NOT NULL,
                attempt INTEGER NOT NULL,
                level TEXT NOT NULL,
                message TEXT NOT NULL,
                created_at TEXT NOT NULL
            )",
        ] {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(backend)?;
        }
        Ok(())
    }

    /// Upserts the relational run row from a status view.
    pub async fn record_run(&self, view: &RunStatusView) -> Result<(), CheckpointError> {
        let error_json = view
            .error
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(backend)?;
        let artifacts_json = serde_json::to_string(&view.artifacts).map_err(backend)?;
        sqlx::query(
            r"
            INSERT INTO runs (run_id, status, current_stage, error_json, artifacts_json, created_at, finished_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(run_id) DO UPDATE SET
                status = excluded.status,
                current_stage = excluded.current_stage,
                error_json = excluded.error_json,
                artifacts_json = excluded.artifacts_json,
                finished_at = excluded.finished_at
            ",
        )
        .bind(&view.run_id)
        .bind(view.status.as_str())
        .bind(view.current_stage.clone())
        .bind(error_json)
        .bind(artifacts_json)
        .bind(view.created_at.to_rfc3339())
        .bind(view.finished_at.map(|t| t.to_rfc3339()))
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }

    /// Appends one audit row for a stage attempt.
    pub async fn log_attempt(
        &self,
        run_id: &str,
        stage: &str,
        attempt: u32,
        level: &str,
        message: &str,
    ) -> Result<(), CheckpointError> {
        sqlx::query(
            "INSERT INTO stage_log (run_id, stage, attempt, level, message, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(run_id)
        .bind(stage)
        .bind(attempt)
        .bind(level)
        .bind(message)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }

    /// Audit rows for a run, oldest first: `(stage, attempt, level, message)`.
    pub async fn stage_log(
        &self,
        run_id: &str,
    ) -> Result<Vec<(String, u32, String, String)>, CheckpointError> {
        let rows = sqlx::query(
            "SELECT stage, attempt, level, message FROM stage_log WHERE run_id = ?1 ORDER BY id",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        Ok(rows
            .into_iter()
            .map(|row| {
                (
                    row.get::<String, _>("stage"),
                    row.get::<i64, _>("attempt") as u32,
                    row.get::<String, _>("level"),
                    row.get::<String, _>("message"),
                )
            })
            .collect())
    }

    fn row_to_checkpoint(row: &sqlx::sqlite::SqliteRow) -> Result<Checkpoint, CheckpointError> {
        let state: SharedState =
            PersistedState::from_json_str(&row.get::<String, _>("state_json"))?.into();
        let created_at = DateTime::parse_from_rfc3339(&row.get::<String, _>("created_at"))
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now());
        Ok(Checkpoint {
            run_id: row.get::<String, _>("run_id"),
            stage_index: row.get::<i64, _>("stage_index") as u32,
            stage_name: row.get::<String, _>("stage_name"),
            state,
            created_at,
        })
    }
}

#[async_trait::async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    async fn put(&self, checkpoint: Checkpoint) -> Result<(), CheckpointError> {
        // Single writer per run is guaranteed by the engine's execution
        // guard, so read-then-insert is race-free here.
        let expected: u32 = sqlx::query(
            "SELECT COALESCE(MAX(stage_index) + 1, 0) AS next FROM checkpoints WHERE run_id = ?1",
        )
        .bind(&checkpoint.run_id)
        .fetch_one(&self.pool)
        .await
        .map_err(backend)?
        .get::<i64, _>("next") as u32;

        if checkpoint.stage_index != expected {
            return Err(CheckpointError::OutOfOrder {
                run_id: checkpoint.run_id,
                expected,
                got: checkpoint.stage_index,
            });
        }

        let state_json = PersistedState::from(&checkpoint.state).to_json_string()?;
        sqlx::query(
            "INSERT INTO checkpoints (run_id, stage_index, stage_name, state_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(&checkpoint.run_id)
        .bind(i64::from(checkpoint.stage_index))
        .bind(&checkpoint.stage_name)
        .bind(state_json)
        .bind(checkpoint.created_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn latest(&self, run_id: &str) -> Result<Option<Checkpoint>, CheckpointError> {
        let row = sqlx::query(
            "SELECT run_id, stage_index, stage_name, state_json, created_at
             FROM checkpoints WHERE run_id = ?1 ORDER BY stage_index DESC LIMIT 1",
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;
        row.as_ref().map(Self::row_to_checkpoint).transpose()
    }

    async fn list(&self, run_id: &str) -> Result<Vec<Checkpoint>, CheckpointError> {
        let rows = sqlx::query(
            "SELECT run_id, stage_index, stage_name, state_json, created_at
             FROM checkpoints WHERE run_id = ?1 ORDER BY stage_index",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        rows.iter().map(Self::row_to_checkpoint).collect()
    }

    async fn list_runs(&self) -> Result<Vec<RunId>, CheckpointError> {
        let rows = sqlx::query("SELECT DISTINCT run_id FROM checkpoints ORDER BY run_id")
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        Ok(rows
            .into_iter()
            .map(|row| row.get::<String, _>("run_id"))
            .collect())
    }
}
