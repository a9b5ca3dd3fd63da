//! Built-in tool backend
//!
//! Hosts tools implemented natively inside the engine process under the
//! reserved server id 0. Handlers are plain closures over JSON arguments;
//! the engine registers them at startup alongside the tool's advertised
//! schema.

use async_trait::async_trait;
use sdk::backend::{BackendError, ToolBackend};
use sdk::wire::{CallToolResult, ListedTool};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Reserved server id for in-process tools
pub const BUILTIN_SERVER_ID: i64 = 0;

type Handler = Arc<dyn Fn(Value) -> Result<CallToolResult, BackendError> + Send + Sync>;

/// In-process backend for natively implemented tools
#[derive(Default)]
pub struct BuiltinBackend {
    tools: BTreeMap<String, (ListedTool, Handler)>,
}

impl BuiltinBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool with its advertised spec and handler.
    ///
    /// The spec's `name` is the dispatch key; registering the same name
    /// twice replaces the earlier handler.
    pub fn register<F>(&mut self, spec: ListedTool, handler: F)
    where
        F: Fn(Value) -> Result<CallToolResult, BackendError> + Send + Sync + 'static,
    {
        self.tools
            .insert(spec.name.clone(), (spec, Arc::new(handler)));
    }

    /// Convenience for specs without an output schema
    pub fn simple_spec(name: &str, description: &str, input_schema: Value) -> ListedTool {
        ListedTool {
            name: name.to_string(),
            description: Some(description.to_string()),
            input_schema,
            output_schema: None,
            slow: false,
        }
    }
}

#[async_trait]
impl ToolBackend for BuiltinBackend {
    fn server_id(&self) -> i64 {
        BUILTIN_SERVER_ID
    }

    async fn list_tools(&self) -> Result<Vec<ListedTool>, BackendError> {
        Ok(self.tools.values().map(|(spec, _)| spec.clone()).collect())
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<CallToolResult, BackendError> {
        debug!(tool = name, "dispatching builtin tool");
        let (_, handler) = self.tools.get(name).ok_or_else(|| BackendError::Rpc {
            code: -32601,
            message: format!("unknown builtin tool '{name}'"),
        })?;
        handler(arguments)
    }
}

/// Build the default builtin backend shipped with the engine.
///
/// Currently a single `current_time` tool; hosts register their own
/// natives on top of this.
pub fn default_builtins() -> BuiltinBackend {
    let mut backend = BuiltinBackend::new();
    backend.register(
        ListedTool {
            name: "current_time".to_string(),
            description: Some("Current UTC time in RFC 3339 format".to_string()),
            input_schema: json!({"type": "object", "properties": {}}),
            output_schema: Some(json!({"properties": {"timestamp": {}}})),
            slow: false,
        },
        |_args| {
            let now = chrono::Utc::now().to_rfc3339();
            Ok(CallToolResult::text(
                json!({"timestamp": now}).to_string(),
            ))
        },
    );
    backend
}
