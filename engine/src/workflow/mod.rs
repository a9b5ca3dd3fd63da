//! Saved workflows: named, reusable plans that run outside any
//! conversation, either on demand or on an interval.
//!
//! A workflow's step list passes the same validation as a
//! conversational plan, at save time. Each run starts from a fresh
//! execution context; linked references always resolve within the run.

pub mod store;

pub use store::{Database, SqliteWorkflowStore, WorkflowStore};

use crate::backends::BackendRegistry;
use crate::catalog::ToolCatalog;
use crate::plan::{Plan, PlanExecutor, PlanReport, PlanStep};
use sdk::errors::CoreError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

/// What causes a workflow to run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    /// Runs only when asked
    Manual,
    /// Runs on a fixed interval
    Every { secs: u64 },
}

/// A named, persisted plan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: String,
    pub name: String,
    pub trigger: Trigger,
    pub steps: Vec<PlanStep>,
    pub enabled: bool,
}

impl WorkflowDefinition {
    pub fn new(name: impl Into<String>, trigger: Trigger, steps: Vec<PlanStep>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            trigger,
            steps,
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Decode a stored status; unknown strings read back as `Failed`
    pub fn from_str_lossy(s: &str) -> Self {
        match s {
            "running" => Self::Running,
            "completed" => Self::Completed,
            _ => Self::Failed,
        }
    }
}

/// One recorded execution of a workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: String,
    pub workflow_id: String,
    pub status: RunStatus,
    /// Per-step report JSON, present once the run finishes
    pub report: Option<String>,
    pub started_at: i64,
    pub finished_at: Option<i64>,
}

/// Executes saved workflows against the live tool catalog
pub struct WorkflowRunner {
    store: Arc<dyn WorkflowStore>,
    executor: Arc<PlanExecutor>,
    backends: BackendRegistry,
}

impl WorkflowRunner {
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        executor: Arc<PlanExecutor>,
        backends: BackendRegistry,
    ) -> Self {
        Self {
            store,
            executor,
            backends,
        }
    }

    pub fn store(&self) -> &Arc<dyn WorkflowStore> {
        &self.store
    }

    /// Run one workflow immediately, regardless of its trigger.
    ///
    /// Run bookkeeping failures are logged and swallowed; they never
    /// stop the execution itself.
    pub async fn run_now(&self, workflow_id: &str) -> Result<PlanReport, CoreError> {
        let workflow = self
            .store
            .get(workflow_id)
            .await?
            .ok_or_else(|| CoreError::Persistence(format!("unknown workflow: {workflow_id}")))?;

        // Steps were validated at save time; revalidate anyway so a
        // hand-edited database row cannot reach the executor.
        let plan = Plan::new(workflow.steps.clone())?;

        let run = WorkflowRun {
            id: Uuid::new_v4().to_string(),
            workflow_id: workflow.id.clone(),
            status: RunStatus::Running,
            report: None,
            started_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0),
            finished_at: None,
        };
        if let Err(e) = self.store.record_run_start(&run).await {
            warn!(workflow = %workflow.name, error = %e, "failed to record run start");
        }

        info!(workflow = %workflow.name, run_id = %run.id, "running workflow");
        let catalog = ToolCatalog::fetch(self.backends.all()).await;
        let report = self.executor.execute(&plan, &catalog).await;

        let status = if report.succeeded {
            RunStatus::Completed
        } else {
            RunStatus::Failed
        };
        let report_json =
            serde_json::to_string(&report.per_step).unwrap_or_else(|_| "{}".to_string());
        if let Err(e) = self
            .store
            .record_run_finish(&run.id, status, &report_json)
            .await
        {
            warn!(workflow = %workflow.name, error = %e, "failed to record run finish");
        }

        Ok(report)
    }
}

/// Background loop firing interval-triggered workflows.
///
/// Poll-based: every `poll_interval` it lists enabled workflows and
/// runs those whose interval has elapsed since their last firing. A
/// workflow saved mid-loop is picked up on the next poll. Due runs
/// execute one at a time within the loop; a long run delays later
/// fires rather than stacking concurrent runs of the same workflows.
pub struct Scheduler;

impl Scheduler {
    pub fn spawn(runner: Arc<WorkflowRunner>, poll_interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut last_fired: std::collections::HashMap<String, tokio::time::Instant> =
                std::collections::HashMap::new();
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let workflows = match runner.store.list().await {
                    Ok(workflows) => workflows,
                    Err(e) => {
                        warn!(error = %e, "scheduler failed to list workflows");
                        continue;
                    }
                };
                // Forget firing times of workflows that no longer exist
                last_fired.retain(|id, _| workflows.iter().any(|w| &w.id == id));
                let now = tokio::time::Instant::now();
                for workflow in workflows {
                    let Trigger::Every { secs } = workflow.trigger else {
                        continue;
                    };
                    if !workflow.enabled {
                        continue;
                    }
                    let due = last_fired
                        .get(&workflow.id)
                        .map(|t| now.duration_since(*t) >= Duration::from_secs(secs))
                        .unwrap_or(true);
                    if !due {
                        continue;
                    }
                    last_fired.insert(workflow.id.clone(), now);
                    if let Err(e) = runner.run_now(&workflow.id).await {
                        warn!(workflow = %workflow.name, error = %e, "scheduled run failed");
                    }
                }
            }
        })
    }
}
