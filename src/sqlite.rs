//! SQLite-based recorder implementation.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::recorder::{Recorder, RunConclusion, StageStatus};
use crate::state::RunId;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS stagecraft_runs (
    id TEXT PRIMARY KEY,
    pipeline_name TEXT NOT NULL,
    stage_count INTEGER NOT NULL,
    started_at TEXT NOT NULL DEFAULT (datetime('now')),
    completed_at TEXT,
    status TEXT NOT NULL DEFAULT 'running',
    stopped_stage TEXT,
    error_message TEXT
);

CREATE TABLE IF NOT EXISTS stagecraft_stages (
    run_id TEXT NOT NULL REFERENCES stagecraft_runs(id),
    stage_index INTEGER NOT NULL,
    stage_name TEXT NOT NULL,
    started_at TEXT NOT NULL DEFAULT (datetime('now')),
    completed_at TEXT,
    status TEXT NOT NULL DEFAULT 'active',
    error_message TEXT,
    PRIMARY KEY (run_id, stage_index)
);

CREATE INDEX IF NOT EXISTS idx_stagecraft_runs_pipeline ON stagecraft_runs(pipeline_name, started_at);
"#;

/// SQLite-based recorder for run history.
#[derive(Clone)]
pub struct SqliteRecorder {
    pool: SqlitePool,
}

impl SqliteRecorder {
    /// Create a new SQLite recorder with the given connection pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Run database migrations to create required tables.
    pub async fn run_migrations(&self) -> anyhow::Result<()> {
        for statement in SCHEMA.split(';') {
            let trimmed = statement.trim();
            if !trimmed.is_empty() {
                sqlx::query(trimmed).execute(&self.pool).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Recorder for SqliteRecorder {
    async fn start_run(&self, run_id: RunId, pipeline: &str, stage_count: usize) -> anyhow::Result<()> {
        sqlx::query("INSERT INTO stagecraft_runs (id, pipeline_name, stage_count) VALUES (?, ?, ?)")
            .bind(run_id.to_string())
            .bind(pipeline)
            .bind(stage_count as i64)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn start_stage(
        &self,
        run_id: RunId,
        stage_name: &str,
        stage_index: usize,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO stagecraft_stages (run_id, stage_index, stage_name) VALUES (?, ?, ?)",
        )
        .bind(run_id.to_string())
        .bind(stage_index as i64)
        .bind(stage_name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn complete_stage(
        &self,
        run_id: RunId,
        stage_index: usize,
        status: StageStatus,
    ) -> anyhow::Result<()> {
        let (status_str, error_msg) = match status {
            StageStatus::Completed => ("completed", None),
            StageStatus::Failed { error } => ("failed", Some(error)),
            StageStatus::Cancelled => ("cancelled", None),
        };

        sqlx::query(
            "UPDATE stagecraft_stages SET completed_at = datetime('now'), status = ?, error_message = ? WHERE run_id = ? AND stage_index = ?",
        )
        .bind(status_str)
        .bind(error_msg)
        .bind(run_id.to_string())
        .bind(stage_index as i64)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn complete_run(&self, run_id: RunId, conclusion: RunConclusion) -> anyhow::Result<()> {
        let (status_str, stage, error_msg) = match conclusion {
            RunConclusion::Completed => ("completed", None, None),
            RunConclusion::Failed { stage, error } => ("failed", Some(stage), Some(error)),
            RunConclusion::Cancelled { stage } => ("cancelled", stage, None),
        };

        sqlx::query(
            "UPDATE stagecraft_runs SET completed_at = datetime('now'), status = ?, stopped_stage = ?, error_message = ? WHERE id = ?",
        )
        .bind(status_str)
        .bind(stage)
        .bind(error_msg)
        .bind(run_id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
