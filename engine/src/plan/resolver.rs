//! Parameter resolution
//!
//! Turns a step's declared parameter mappings into the concrete argument
//! map passed to a tool invocation. Pure function of the step, the tool's
//! declared schema, and the accumulated execution context: resolving the
//! same inputs twice yields identical arguments.

use crate::catalog::{ParamType, ToolDefinition};
use crate::plan::{ExecutionContext, ParameterValue, PlanStep};
use sdk::errors::CoreError;
use serde_json::{Map, Value};

/// Resolve a step's parameters against the execution context.
///
/// Literals pass through after primitive coercion against the tool's
/// declared input type. Linked references read the source step's recorded
/// output and fail with `LinkResolution` when the source step has not
/// executed or did not produce the expected key, never substituting a
/// default.
pub fn resolve_parameters(
    step: &PlanStep,
    tool: &ToolDefinition,
    ctx: &ExecutionContext,
) -> Result<Value, CoreError> {
    let mut arguments = Map::new();
    for (name, value) in &step.parameters {
        let declared = tool.input(name).map(|p| p.param_type);
        let resolved = resolve_value(step.step_order, name, value, declared, ctx)?;
        arguments.insert(name.clone(), resolved);
    }
    Ok(Value::Object(arguments))
}

fn resolve_value(
    step_order: u32,
    name: &str,
    value: &ParameterValue,
    declared: Option<ParamType>,
    ctx: &ExecutionContext,
) -> Result<Value, CoreError> {
    match value {
        ParameterValue::Literal(v) => Ok(coerce(v.clone(), declared)),
        ParameterValue::Linked {
            source_step,
            output_key,
        } => {
            // Unreachable for well-formed plans executed in order, but a
            // degenerate source step is still a resolution failure here.
            if !ctx.has_step(*source_step) {
                return Err(CoreError::LinkResolution {
                    source_step: *source_step,
                    output_key: output_key.clone(),
                });
            }
            ctx.output(*source_step, output_key)
                .cloned()
                .ok_or_else(|| CoreError::LinkResolution {
                    source_step: *source_step,
                    output_key: output_key.clone(),
                })
        }
        ParameterValue::Collection(entries) => {
            let mut resolved = Vec::with_capacity(entries.len());
            for entry in entries {
                // Entries are resolved independently; element type is not
                // declared per entry, so no coercion inside collections.
                resolved.push(resolve_value(step_order, name, entry, None, ctx)?);
            }
            Ok(Value::Array(resolved))
        }
    }
}

/// Coerce a literal toward the declared primitive type.
///
/// Only the conversions the schema justifies: numeric strings to numbers,
/// checkbox-like strings/numbers to booleans, numbers to strings. Values
/// that do not convert cleanly pass through unchanged; the backend gets
/// the final say.
fn coerce(value: Value, declared: Option<ParamType>) -> Value {
    let Some(declared) = declared else {
        return value;
    };
    match (declared, &value) {
        (ParamType::Number, Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .unwrap_or(value),
        (ParamType::Integer, Value::String(s)) => s
            .trim()
            .parse::<i64>()
            .map(Value::from)
            .unwrap_or(value),
        (ParamType::Boolean, Value::String(s)) => match s.trim().to_lowercase().as_str() {
            "true" | "yes" | "on" | "1" => Value::Bool(true),
            "false" | "no" | "off" | "0" => Value::Bool(false),
            _ => value,
        },
        (ParamType::Boolean, Value::Number(n)) => {
            if n.as_i64() == Some(0) {
                Value::Bool(false)
            } else if n.as_i64() == Some(1) {
                Value::Bool(true)
            } else {
                value
            }
        }
        (ParamType::String, Value::Number(n)) => Value::String(n.to_string()),
        _ => value,
    }
}
