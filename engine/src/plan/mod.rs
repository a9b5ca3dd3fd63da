//! Plan types and validation
//!
//! A plan is a non-empty ordered sequence of tool invocations. Parameter
//! values are either literals or back-references to an earlier step's
//! recorded output; forward and self references are rejected at build
//! time, which prevents cyclic step graphs by construction.

pub mod executor;
pub mod resolver;

pub use executor::{PlanExecutor, PlanReport, StepRecord, StepStatus};
pub use resolver::resolve_parameters;

use sdk::errors::CoreError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// A parameter value in a plan step
///
/// `Linked` sources the value from an earlier step's output; the
/// `source_step < current step_order` invariant is enforced by
/// [`Plan::validate`]. `Collection` entries are resolved independently
/// and may mix literals and links.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterValue {
    Literal(Value),
    Linked {
        source_step: u32,
        output_key: String,
    },
    Collection(Vec<ParameterValue>),
}

impl ParameterValue {
    /// Create a literal parameter from anything serializable to JSON
    pub fn literal(value: impl Into<Value>) -> Self {
        Self::Literal(value.into())
    }

    /// Create a linked reference to an earlier step's output key
    pub fn linked(source_step: u32, output_key: impl Into<String>) -> Self {
        Self::Linked {
            source_step,
            output_key: output_key.into(),
        }
    }
}

/// One step of a plan: a tool invocation with parameter mappings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    /// 1-based, unique, strictly increasing within a plan
    pub step_order: u32,
    pub tool_name: String,
    /// Which backend exposes the tool; 0 = built-in
    pub server_id: i64,
    pub parameters: BTreeMap<String, ParameterValue>,
}

/// An ordered, validated sequence of plan steps
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    steps: Vec<PlanStep>,
}

impl Plan {
    /// Build a plan from steps, enforcing the ordering and back-reference
    /// invariants.
    ///
    /// Steps are sorted by `step_order` first (repairing out-of-order
    /// oracle output), then checked: orders must be unique and >= 1, and
    /// every `Linked` parameter must reference a strictly earlier step.
    pub fn new(mut steps: Vec<PlanStep>) -> Result<Self, CoreError> {
        if steps.is_empty() {
            return Err(CoreError::InvalidPlan("plan has no steps".to_string()));
        }

        steps.sort_by_key(|s| s.step_order);

        let mut prev_order = 0u32;
        for step in &steps {
            if step.step_order == 0 {
                return Err(CoreError::InvalidPlan(
                    "step order must be 1-based".to_string(),
                ));
            }
            if step.step_order <= prev_order {
                return Err(CoreError::InvalidPlan(format!(
                    "duplicate step order {}",
                    step.step_order
                )));
            }
            prev_order = step.step_order;

            for (name, value) in &step.parameters {
                check_back_reference(step.step_order, name, value)?;
            }
        }

        Ok(Self { steps })
    }

    /// Steps in execution order
    pub fn steps(&self) -> &[PlanStep] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

fn check_back_reference(
    step_order: u32,
    param: &str,
    value: &ParameterValue,
) -> Result<(), CoreError> {
    match value {
        ParameterValue::Literal(_) => Ok(()),
        ParameterValue::Linked { source_step, .. } => {
            if *source_step >= step_order {
                Err(CoreError::InvalidPlan(format!(
                    "step {step_order} parameter '{param}' references step {source_step} (back-references only)"
                )))
            } else {
                Ok(())
            }
        }
        ParameterValue::Collection(entries) => {
            for entry in entries {
                check_back_reference(step_order, param, entry)?;
            }
            Ok(())
        }
    }
}

/// Outputs accumulated during one plan execution
///
/// Append-only: each executed step records its output map under its
/// `step_order`, and later steps' linked parameters read from it. The
/// context lives exactly as long as one executor run and is never
/// persisted.
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    outputs: BTreeMap<u32, BTreeMap<String, Value>>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a step's outputs. Recording twice for the same step is a
    /// programming error in the executor and panics in debug builds.
    pub fn record(&mut self, step_order: u32, outputs: BTreeMap<String, Value>) {
        debug_assert!(!self.outputs.contains_key(&step_order));
        self.outputs.insert(step_order, outputs);
    }

    /// Look up one output value of an executed step
    pub fn output(&self, step_order: u32, key: &str) -> Option<&Value> {
        self.outputs.get(&step_order).and_then(|m| m.get(key))
    }

    /// True if the given step has recorded outputs (even an empty map)
    pub fn has_step(&self, step_order: u32) -> bool {
        self.outputs.contains_key(&step_order)
    }

    /// All recorded outputs, keyed by step order
    pub fn outputs(&self) -> &BTreeMap<u32, BTreeMap<String, Value>> {
        &self.outputs
    }
}
