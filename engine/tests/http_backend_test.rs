//! HTTP backend tests against a mock JSON-RPC tool server.

use maestro_engine::backends::http::HttpToolBackend;
use sdk::backend::{BackendError, ToolBackend};
use serde_json::json;
use std::time::Duration;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn backend_for(server: &MockServer) -> HttpToolBackend {
    HttpToolBackend::new(7, format!("{}/rpc", server.uri()), Duration::from_secs(2))
}

#[tokio::test]
async fn test_list_tools() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/rpc"))
        .and(body_partial_json(json!({"method": "tools/list"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "result": {
                "tools": [{
                    "name": "get_weather",
                    "description": "Weather for a city",
                    "inputSchema": {
                        "type": "object",
                        "properties": {"city": {"type": "string"}},
                        "required": ["city"]
                    },
                    "outputSchema": {"properties": {"forecast": {}}},
                    "slow": true
                }]
            }
        })))
        .mount(&server)
        .await;

    let backend = backend_for(&server);
    let tools = backend.list_tools().await.unwrap();

    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0].name, "get_weather");
    assert!(tools[0].slow);
}

#[tokio::test]
async fn test_call_tool_sends_arguments() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/rpc"))
        .and(body_partial_json(json!({
            "method": "tools/call",
            "params": {"name": "get_weather", "arguments": {"city": "Oslo"}}
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "result": {
                "content": [{"type": "text", "text": "{\"forecast\": \"sunny\"}"}]
            }
        })))
        .mount(&server)
        .await;

    let backend = backend_for(&server);
    let result = backend
        .call_tool("get_weather", json!({"city": "Oslo"}))
        .await
        .unwrap();

    assert_eq!(result.first_text(), Some("{\"forecast\": \"sunny\"}"));
}

#[tokio::test]
async fn test_rpc_error_surfaces_code_and_message() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/rpc"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "error": {"code": -32601, "message": "method not found"}
        })))
        .mount(&server)
        .await;

    let backend = backend_for(&server);
    let err = backend.call_tool("nope", json!({})).await.unwrap_err();

    match err {
        BackendError::Rpc { code, message } => {
            assert_eq!(code, -32601);
            assert_eq!(message, "method not found");
        }
        other => panic!("expected rpc error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_http_error_is_transport() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/rpc"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let backend = backend_for(&server);
    let err = backend.list_tools().await.unwrap_err();
    assert!(matches!(err, BackendError::Transport(_)));
}

#[tokio::test]
async fn test_unreachable_server_is_transport() {
    // Nothing listens on this port
    let backend = HttpToolBackend::new(7, "http://127.0.0.1:9", Duration::from_millis(200));
    let err = backend.list_tools().await.unwrap_err();
    assert!(matches!(err, BackendError::Transport(_)));
}
