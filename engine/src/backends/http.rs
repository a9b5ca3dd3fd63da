//! HTTP JSON-RPC tool backend
//!
//! Talks to a remote tool server that accepts JSON-RPC requests on a
//! single POST endpoint. Every request carries a bounded timeout so a
//! hung backend surfaces as a transport error rather than stalling the
//! executor.

use async_trait::async_trait;
use sdk::backend::{BackendError, ToolBackend};
use sdk::wire::{CallToolResult, ListToolsResult, ListedTool, RpcRequest, RpcResponse, ToolCallParams};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

pub struct HttpToolBackend {
    server_id: i64,
    endpoint: String,
    client: reqwest::Client,
    request_id: AtomicU64,
}

impl HttpToolBackend {
    /// Create a backend for the given JSON-RPC endpoint.
    ///
    /// `timeout` bounds each individual request, discovery and invocation
    /// alike.
    pub fn new(server_id: i64, endpoint: impl Into<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            server_id,
            endpoint: endpoint.into(),
            client,
            request_id: AtomicU64::new(1),
        }
    }

    fn next_request_id(&self) -> u64 {
        self.request_id.fetch_add(1, Ordering::SeqCst)
    }

    async fn send(&self, method: &str, params: Option<Value>) -> Result<Value, BackendError> {
        let id = self.next_request_id();
        let request = RpcRequest::new(id, method, params);
        debug!(server_id = self.server_id, method, id, "sending rpc request");

        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| BackendError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(BackendError::Transport(format!(
                "http status {}",
                response.status()
            )));
        }

        let rpc: RpcResponse = response
            .json()
            .await
            .map_err(|e| BackendError::Parse(e.to_string()))?;

        if let Some(err) = rpc.error {
            return Err(BackendError::Rpc {
                code: err.code,
                message: err.message,
            });
        }

        rpc.result
            .ok_or_else(|| BackendError::Parse("response has neither result nor error".to_string()))
    }
}

#[async_trait]
impl ToolBackend for HttpToolBackend {
    fn server_id(&self) -> i64 {
        self.server_id
    }

    async fn list_tools(&self) -> Result<Vec<ListedTool>, BackendError> {
        let result = self.send("tools/list", None).await?;
        let listed: ListToolsResult =
            serde_json::from_value(result).map_err(|e| BackendError::Parse(e.to_string()))?;
        Ok(listed.tools)
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<CallToolResult, BackendError> {
        let params = ToolCallParams {
            name: name.to_string(),
            arguments,
        };
        let params =
            serde_json::to_value(params).map_err(|e| BackendError::Parse(e.to_string()))?;
        let result = self.send("tools/call", Some(params)).await?;
        serde_json::from_value(result).map_err(|e| BackendError::Parse(e.to_string()))
    }
}
