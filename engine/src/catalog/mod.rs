//! Tool catalog
//!
//! Read-only snapshot of the tools available to the engine, assembled from
//! each backend's `tools/list` response. The snapshot is fetched per turn
//! or per workflow run; the engine never mutates it.

use sdk::backend::ToolBackend;
use sdk::wire::ListedTool;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, warn};

/// Primitive types a tool parameter may declare
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Number,
    Integer,
    Boolean,
    Array,
    Object,
}

impl ParamType {
    fn from_schema_type(s: &str) -> Self {
        match s {
            "number" => Self::Number,
            "integer" => Self::Integer,
            "boolean" => Self::Boolean,
            "array" => Self::Array,
            "object" => Self::Object,
            _ => Self::String,
        }
    }
}

/// One declared input parameter of a tool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    pub param_type: ParamType,
    pub required: bool,
    pub enum_values: Option<Vec<String>>,
}

/// Immutable definition of one available tool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: Option<String>,
    /// Declared inputs in listing order
    pub inputs: Vec<ParamSpec>,
    /// Declared output key names (may be empty for tools with free-form output)
    pub output_keys: BTreeSet<String>,
    pub is_slow: bool,
    /// Which backend exposes this tool; 0 = built-in
    pub server_id: i64,
}

impl ToolDefinition {
    /// Look up a declared input parameter by name
    pub fn input(&self, name: &str) -> Option<&ParamSpec> {
        self.inputs.iter().find(|p| p.name == name)
    }

    /// Names of all required input parameters
    pub fn required_inputs(&self) -> Vec<&str> {
        self.inputs
            .iter()
            .filter(|p| p.required)
            .map(|p| p.name.as_str())
            .collect()
    }

    /// Build a definition from one `tools/list` entry
    pub fn from_listed(tool: &ListedTool, server_id: i64) -> Self {
        let required: BTreeSet<String> = tool
            .input_schema
            .get("required")
            .and_then(|r| r.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default();

        let mut inputs = Vec::new();
        if let Some(props) = tool.input_schema.get("properties").and_then(|p| p.as_object()) {
            for (name, schema) in props {
                let param_type = schema
                    .get("type")
                    .and_then(|t| t.as_str())
                    .map(ParamType::from_schema_type)
                    .unwrap_or(ParamType::String);
                let enum_values = schema.get("enum").and_then(|e| e.as_array()).map(|arr| {
                    arr.iter()
                        .filter_map(|v| v.as_str().map(String::from))
                        .collect()
                });
                inputs.push(ParamSpec {
                    name: name.clone(),
                    param_type,
                    required: required.contains(name),
                    enum_values,
                });
            }
        }

        let output_keys = tool
            .output_schema
            .as_ref()
            .and_then(|s| s.get("properties"))
            .and_then(|p| p.as_object())
            .map(|props| props.keys().cloned().collect())
            .unwrap_or_default();

        Self {
            name: tool.name.clone(),
            description: tool.description.clone(),
            inputs,
            output_keys,
            is_slow: tool.slow,
            server_id,
        }
    }
}

/// Read-only snapshot of all tools visible to one turn or run
#[derive(Debug, Clone, Default)]
pub struct ToolCatalog {
    tools: Vec<ToolDefinition>,
}

impl ToolCatalog {
    /// Create an empty catalog (used by turns that identify zero tools)
    pub fn empty() -> Self {
        Self::default()
    }

    /// Create a catalog directly from definitions
    pub fn from_tools(tools: Vec<ToolDefinition>) -> Self {
        Self { tools }
    }

    /// Fetch a fresh snapshot from the given backends.
    ///
    /// A backend that fails discovery is skipped with a warning; its tools
    /// are simply absent from this snapshot.
    pub async fn fetch(backends: &[Arc<dyn ToolBackend>]) -> Self {
        let mut tools = Vec::new();
        for backend in backends {
            let server_id = backend.server_id();
            match backend.list_tools().await {
                Ok(listed) => {
                    debug!(server_id, count = listed.len(), "discovered tools");
                    for tool in &listed {
                        tools.push(ToolDefinition::from_listed(tool, server_id));
                    }
                }
                Err(e) => {
                    warn!(server_id, error = %e, "tool discovery failed, skipping backend");
                }
            }
        }
        Self { tools }
    }

    /// Look up a tool by backend and name
    pub fn lookup(&self, server_id: i64, name: &str) -> Option<&ToolDefinition> {
        self.tools
            .iter()
            .find(|t| t.server_id == server_id && t.name == name)
    }

    /// Look up a tool by name alone (first match across backends)
    pub fn lookup_by_name(&self, name: &str) -> Option<&ToolDefinition> {
        self.tools.iter().find(|t| t.name == name)
    }

    /// All tools in the snapshot
    pub fn tools(&self) -> &[ToolDefinition] {
        &self.tools
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}
