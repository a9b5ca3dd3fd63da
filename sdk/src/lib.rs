//! Maestro SDK
//!
//! Shared library providing the tool-backend contract used by the engine:
//! JSON-RPC wire types for tool discovery and invocation, the `ToolBackend`
//! trait, and the error taxonomy surfaced to callers.

/// Error types and handling
pub mod errors;

/// JSON-RPC wire types for `tools/list` and `tools/call`
pub mod wire;

/// Tool backend trait
pub mod backend;

// Re-export commonly used types
pub use backend::{BackendError, ToolBackend};
pub use errors::{CoreError, ErrorExt};
pub use wire::{
    CallToolResult, ContentBlock, ListToolsResult, ListedTool, RpcError, RpcRequest, RpcResponse,
    ToolCallParams,
};
