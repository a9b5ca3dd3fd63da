//! Plan Executor
//!
//! Runs a validated plan strictly in step order against the tool catalog
//! and the backend registry. Failures are isolated per step: a failing
//! tool is recorded under its step order and execution continues, so one
//! step's error only propagates to the steps that reference its output
//! (as a `LinkResolution` failure at their own resolution time).
//!
//! There is no rollback. Steps with real-world side effects are not
//! undone when a later step fails; callers that need exactness order
//! side-effecting steps last or make them idempotent.

use crate::backends::BackendRegistry;
use crate::catalog::ToolCatalog;
use crate::plan::{resolve_parameters, ExecutionContext, Plan, PlanStep};
use sdk::errors::CoreError;
use sdk::wire::CallToolResult;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Outcome of one step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Ok,
    Error,
}

/// Per-step record in the aggregate report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub tool_name: String,
    pub status: StepStatus,
    /// Recorded outputs; empty for failed steps
    pub outputs: BTreeMap<String, Value>,
    /// Terse error description for failed steps
    pub error: Option<String>,
}

impl StepRecord {
    fn ok(tool_name: &str, outputs: BTreeMap<String, Value>) -> Self {
        Self {
            tool_name: tool_name.to_string(),
            status: StepStatus::Ok,
            outputs,
            error: None,
        }
    }

    fn failed(tool_name: &str, error: &CoreError) -> Self {
        Self {
            tool_name: tool_name.to_string(),
            status: StepStatus::Error,
            outputs: BTreeMap::new(),
            error: Some(error.to_string()),
        }
    }
}

/// Aggregate result of one plan execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanReport {
    pub per_step: BTreeMap<u32, StepRecord>,
    /// True only if every step completed without error
    pub succeeded: bool,
}

impl PlanReport {
    /// One line per step, used by the degraded synthesis fallback
    pub fn summary(&self) -> String {
        self.per_step
            .iter()
            .map(|(order, record)| match record.status {
                StepStatus::Ok => format!("step {} ({}): ok", order, record.tool_name),
                StepStatus::Error => format!(
                    "step {} ({}): failed",
                    order, record.tool_name
                ),
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Executes plans against a tool catalog and backend registry
pub struct PlanExecutor {
    backends: BackendRegistry,
    tool_timeout: Duration,
}

impl PlanExecutor {
    pub fn new(backends: BackendRegistry, tool_timeout: Duration) -> Self {
        Self {
            backends,
            tool_timeout,
        }
    }

    /// Execute all steps of a plan in order.
    ///
    /// The context starts empty and accumulates each successful step's
    /// outputs; it is dropped with the returned report.
    pub async fn execute(&self, plan: &Plan, catalog: &ToolCatalog) -> PlanReport {
        let mut ctx = ExecutionContext::new();
        let mut per_step = BTreeMap::new();
        let mut succeeded = true;

        for step in plan.steps() {
            let record = match self.execute_step(step, catalog, &ctx).await {
                Ok(outputs) => {
                    debug!(
                        step = step.step_order,
                        tool = %step.tool_name,
                        keys = outputs.len(),
                        "step completed"
                    );
                    ctx.record(step.step_order, outputs.clone());
                    StepRecord::ok(&step.tool_name, outputs)
                }
                Err(e) => {
                    warn!(step = step.step_order, tool = %step.tool_name, error = %e, "step failed");
                    succeeded = false;
                    StepRecord::failed(&step.tool_name, &e)
                }
            };
            per_step.insert(step.step_order, record);
        }

        info!(
            steps = plan.len(),
            succeeded,
            "plan execution finished"
        );
        PlanReport {
            per_step,
            succeeded,
        }
    }

    async fn execute_step(
        &self,
        step: &PlanStep,
        catalog: &ToolCatalog,
        ctx: &ExecutionContext,
    ) -> Result<BTreeMap<String, Value>, CoreError> {
        let tool = catalog
            .lookup(step.server_id, &step.tool_name)
            .ok_or_else(|| CoreError::ToolNotFound {
                server_id: step.server_id,
                name: step.tool_name.clone(),
            })?;

        let arguments = resolve_parameters(step, tool, ctx)?;

        let backend = self
            .backends
            .get(step.server_id)
            .ok_or_else(|| CoreError::ToolNotFound {
                server_id: step.server_id,
                name: step.tool_name.clone(),
            })?;

        let call = backend.call_tool(&step.tool_name, arguments);
        let result = match timeout(self.tool_timeout, call).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => return Err(CoreError::ToolExecution(e.to_string())),
            Err(_) => return Err(CoreError::ToolTimeout(self.tool_timeout.as_secs())),
        };

        if result.is_error {
            let detail = result
                .first_text()
                .unwrap_or("backend reported an error")
                .to_string();
            return Err(CoreError::ToolExecution(detail));
        }

        Ok(extract_outputs(&result))
    }
}

/// Turn a tool result into an output map.
///
/// The first text block is parsed as a JSON object when possible and its
/// entries become the step's output keys; non-object text is recorded
/// under `"text"`. A step with no text content records an empty map;
/// later linked references to it then fail with `LinkResolution`.
fn extract_outputs(result: &CallToolResult) -> BTreeMap<String, Value> {
    let mut outputs = BTreeMap::new();
    let Some(text) = result.first_text() else {
        return outputs;
    };
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(map)) => {
            for (key, value) in map {
                outputs.insert(key, value);
            }
        }
        _ => {
            outputs.insert("text".to_string(), Value::String(text.to_string()));
        }
    }
    outputs
}
