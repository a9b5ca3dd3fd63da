//! Tool backend trait
//!
//! A `ToolBackend` is one server exposing tools over the `tools/list` /
//! `tools/call` contract. Server id 0 is reserved for the engine's
//! built-in backend; remote backends get positive ids assigned by the
//! registry that owns them.

use crate::wire::{CallToolResult, ListedTool};
use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

/// Errors from talking to a tool backend
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("Parse error: {0}")]
    Parse(String),
}

/// One server exposing tools to the engine
///
/// Implementations must be cheap to clone behind an `Arc`; the plan
/// executor holds backends for the duration of a run.
#[async_trait]
pub trait ToolBackend: Send + Sync {
    /// Identifier of this backend; 0 means built-in
    fn server_id(&self) -> i64;

    /// Discover the tools this backend exposes (`tools/list`)
    async fn list_tools(&self) -> Result<Vec<ListedTool>, BackendError>;

    /// Invoke a tool by name with resolved arguments (`tools/call`)
    async fn call_tool(&self, name: &str, arguments: Value) -> Result<CallToolResult, BackendError>;
}
