//! SQLite persistence for workflow definitions and run history.
//!
//! All queries are parameterized. Step lists and reports are stored as
//! JSON columns; definitions are validated against the back-reference
//! invariant before they are ever written.

use crate::plan::{Plan, PlanStep};
use crate::workflow::{RunStatus, Trigger, WorkflowDefinition, WorkflowRun};
use async_trait::async_trait;
use sdk::errors::CoreError;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{ConnectOptions, Row};
use std::path::Path;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

/// Database connection pool
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (creating if missing) the engine database in WAL mode and
    /// run migrations. WAL recovery after an unclean shutdown happens
    /// automatically on reconnect.
    pub async fn new(db_path: &Path) -> Result<Self, CoreError> {
        info!("Initializing database at: {}", db_path.display());

        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| CoreError::Persistence(format!("create database dir: {e}")))?;
        }

        let connection_string = format!("sqlite:{}", db_path.display());
        let options = SqliteConnectOptions::from_str(&connection_string)
            .map_err(|e| CoreError::Persistence(format!("connection options: {e}")))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .foreign_keys(true)
            .disable_statement_logging();

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| CoreError::Persistence(format!("connect: {e}")))?;

        debug!("Database connection established");

        let db = Self { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    async fn run_migrations(&self) -> Result<(), CoreError> {
        sqlx::raw_sql(include_str!("../../migrations/001_workflows.sql"))
            .execute(&self.pool)
            .await
            .map_err(|e| CoreError::Persistence(format!("migration 001_workflows.sql: {e}")))?;
        debug!("Database migrations completed");
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Checkpoint the WAL; call during graceful shutdown.
    pub async fn flush_wal(&self) -> Result<(), CoreError> {
        sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
            .execute(&self.pool)
            .await
            .map_err(|e| CoreError::Persistence(format!("wal checkpoint: {e}")))?;
        Ok(())
    }

    pub async fn close(self) -> Result<(), CoreError> {
        self.flush_wal().await?;
        self.pool.close().await;
        Ok(())
    }
}

/// Persistence seam for workflow definitions and run records
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    /// Persist a definition. Rejects step lists that violate the
    /// back-reference invariant; nothing invalid ever reaches disk.
    async fn save(&self, workflow: &WorkflowDefinition) -> Result<(), CoreError>;
    async fn get(&self, id: &str) -> Result<Option<WorkflowDefinition>, CoreError>;
    async fn list(&self) -> Result<Vec<WorkflowDefinition>, CoreError>;
    async fn set_enabled(&self, id: &str, enabled: bool) -> Result<(), CoreError>;
    async fn delete(&self, id: &str) -> Result<(), CoreError>;

    async fn record_run_start(&self, run: &WorkflowRun) -> Result<(), CoreError>;
    async fn record_run_finish(
        &self,
        run_id: &str,
        status: RunStatus,
        report: &str,
    ) -> Result<(), CoreError>;
    /// Most recent runs first
    async fn list_runs(&self, workflow_id: &str, limit: i64) -> Result<Vec<WorkflowRun>, CoreError>;
}

pub struct SqliteWorkflowStore {
    pool: SqlitePool,
}

impl SqliteWorkflowStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn now() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0)
    }

    fn row_to_workflow(row: &sqlx::sqlite::SqliteRow) -> Result<WorkflowDefinition, CoreError> {
        let trigger_json: String = row.get("trigger");
        let steps_json: String = row.get("steps");
        let trigger: Trigger = serde_json::from_str(&trigger_json)
            .map_err(|e| CoreError::Persistence(format!("decode trigger: {e}")))?;
        let steps: Vec<PlanStep> = serde_json::from_str(&steps_json)
            .map_err(|e| CoreError::Persistence(format!("decode steps: {e}")))?;
        Ok(WorkflowDefinition {
            id: row.get("id"),
            name: row.get("name"),
            trigger,
            steps,
            enabled: row.get::<i64, _>("enabled") != 0,
        })
    }

    fn row_to_run(row: &sqlx::sqlite::SqliteRow) -> WorkflowRun {
        let status: String = row.get("status");
        WorkflowRun {
            id: row.get("id"),
            workflow_id: row.get("workflow_id"),
            status: RunStatus::from_str_lossy(&status),
            report: row.get("report"),
            started_at: row.get("started_at"),
            finished_at: row.get("finished_at"),
        }
    }
}

#[async_trait]
impl WorkflowStore for SqliteWorkflowStore {
    async fn save(&self, workflow: &WorkflowDefinition) -> Result<(), CoreError> {
        // Validation happens here, at the write boundary
        Plan::new(workflow.steps.clone())?;

        let trigger_json = serde_json::to_string(&workflow.trigger)
            .map_err(|e| CoreError::Persistence(format!("encode trigger: {e}")))?;
        let steps_json = serde_json::to_string(&workflow.steps)
            .map_err(|e| CoreError::Persistence(format!("encode steps: {e}")))?;
        let now = Self::now();

        sqlx::query(
            "INSERT INTO workflows (id, name, trigger, steps, enabled, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET \
             name = excluded.name, trigger = excluded.trigger, steps = excluded.steps, \
             enabled = excluded.enabled, updated_at = excluded.updated_at",
        )
        .bind(&workflow.id)
        .bind(&workflow.name)
        .bind(&trigger_json)
        .bind(&steps_json)
        .bind(workflow.enabled as i64)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| CoreError::Persistence(format!("save workflow: {e}")))?;

        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<WorkflowDefinition>, CoreError> {
        let row = sqlx::query("SELECT * FROM workflows WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| CoreError::Persistence(format!("get workflow: {e}")))?;
        row.as_ref().map(Self::row_to_workflow).transpose()
    }

    async fn list(&self) -> Result<Vec<WorkflowDefinition>, CoreError> {
        let rows = sqlx::query("SELECT * FROM workflows ORDER BY name")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| CoreError::Persistence(format!("list workflows: {e}")))?;
        rows.iter().map(Self::row_to_workflow).collect()
    }

    async fn set_enabled(&self, id: &str, enabled: bool) -> Result<(), CoreError> {
        sqlx::query("UPDATE workflows SET enabled = ?, updated_at = ? WHERE id = ?")
            .bind(enabled as i64)
            .bind(Self::now())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| CoreError::Persistence(format!("set enabled: {e}")))?;
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), CoreError> {
        sqlx::query("DELETE FROM workflow_runs WHERE workflow_id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| CoreError::Persistence(format!("delete runs: {e}")))?;
        sqlx::query("DELETE FROM workflows WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| CoreError::Persistence(format!("delete workflow: {e}")))?;
        Ok(())
    }

    async fn record_run_start(&self, run: &WorkflowRun) -> Result<(), CoreError> {
        sqlx::query(
            "INSERT INTO workflow_runs (id, workflow_id, status, started_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&run.id)
        .bind(&run.workflow_id)
        .bind(run.status.as_str())
        .bind(run.started_at)
        .execute(&self.pool)
        .await
        .map_err(|e| CoreError::Persistence(format!("record run start: {e}")))?;
        Ok(())
    }

    async fn record_run_finish(
        &self,
        run_id: &str,
        status: RunStatus,
        report: &str,
    ) -> Result<(), CoreError> {
        sqlx::query(
            "UPDATE workflow_runs SET status = ?, report = ?, finished_at = ? WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(report)
        .bind(Self::now())
        .bind(run_id)
        .execute(&self.pool)
        .await
        .map_err(|e| CoreError::Persistence(format!("record run finish: {e}")))?;
        Ok(())
    }

    async fn list_runs(
        &self,
        workflow_id: &str,
        limit: i64,
    ) -> Result<Vec<WorkflowRun>, CoreError> {
        let rows = sqlx::query(
            "SELECT * FROM workflow_runs WHERE workflow_id = ? ORDER BY started_at DESC LIMIT ?",
        )
        .bind(workflow_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| CoreError::Persistence(format!("list runs: {e}")))?;
        Ok(rows.iter().map(Self::row_to_run).collect())
    }
}
