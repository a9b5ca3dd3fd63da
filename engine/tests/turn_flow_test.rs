//! End-to-end turn scenarios: gating, clarification and resume, the
//! synchronous reply path, and the detached slow path.

use async_trait::async_trait;
use maestro_engine::backends::builtin::BuiltinBackend;
use maestro_engine::backends::BackendRegistry;
use maestro_engine::config::EngineConfig;
use maestro_engine::oracle::{Message, Oracle, OracleError};
use maestro_engine::turn::{ProcessingOutcome, StopReason, TurnOrchestrator, TurnRequest};
use sdk::backend::{BackendError, ToolBackend};
use sdk::wire::{CallToolResult, ListedTool};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;

/// Replays a queue of canned completions, one per oracle call
struct ScriptedOracle {
    responses: Mutex<VecDeque<String>>,
}

impl ScriptedOracle {
    fn new(responses: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.iter().map(|s| s.to_string()).collect()),
        })
    }
}

#[async_trait]
impl Oracle for ScriptedOracle {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, _messages: &[Message]) -> Result<String, OracleError> {
        self.responses
            .lock()
            .map_err(|_| OracleError::ProviderUnavailable("lock poisoned".to_string()))?
            .pop_front()
            .ok_or_else(|| OracleError::ProviderUnavailable("script exhausted".to_string()))
    }
}

fn weather_backend(slow: bool) -> BackendRegistry {
    let mut backend = BuiltinBackend::new();
    backend.register(
        ListedTool {
            name: "get_weather".to_string(),
            description: Some("Weather for a city".to_string()),
            input_schema: json!({
                "type": "object",
                "properties": {"city": {"type": "string"}},
                "required": ["city"]
            }),
            output_schema: Some(json!({"properties": {"forecast": {}}})),
            slow,
        },
        |args| {
            assert_eq!(args["city"], json!("Oslo"));
            Ok(CallToolResult::text(
                json!({"forecast": "light rain"}).to_string(),
            ))
        },
    );
    let mut registry = BackendRegistry::new();
    registry.register(Arc::new(backend));
    registry
}

/// Slow weather backend whose invocations block until released,
/// keeping a detached turn in flight for as long as a test needs
struct GatedWeatherBackend {
    release: Arc<Notify>,
}

#[async_trait]
impl ToolBackend for GatedWeatherBackend {
    fn server_id(&self) -> i64 {
        0
    }

    async fn list_tools(&self) -> Result<Vec<ListedTool>, BackendError> {
        Ok(vec![ListedTool {
            name: "get_weather".to_string(),
            description: Some("Weather for a city".to_string()),
            input_schema: json!({
                "type": "object",
                "properties": {"city": {"type": "string"}},
                "required": ["city"]
            }),
            output_schema: Some(json!({"properties": {"forecast": {}}})),
            slow: true,
        }])
    }

    async fn call_tool(
        &self,
        _name: &str,
        _arguments: Value,
    ) -> Result<CallToolResult, BackendError> {
        self.release.notified().await;
        Ok(CallToolResult::text(
            json!({"forecast": "light rain"}).to_string(),
        ))
    }
}

fn request(text: &str, addressed: bool) -> TurnRequest {
    TurnRequest {
        conversation_id: "chat-1".to_string(),
        text: text.to_string(),
        attachment: None,
        addressed,
    }
}

#[tokio::test]
async fn test_attachment_only_message_ignored() {
    let oracle = ScriptedOracle::new(&[]);
    let orchestrator =
        TurnOrchestrator::new(oracle, BackendRegistry::new(), &EngineConfig::default());

    let outcome = orchestrator
        .handle_message(TurnRequest {
            conversation_id: "chat-1".to_string(),
            text: String::new(),
            attachment: Some("cat.png".to_string()),
            addressed: false,
        })
        .await;

    assert!(matches!(
        outcome,
        ProcessingOutcome::Stop(StopReason::Ignored)
    ));
}

#[tokio::test]
async fn test_gate_declines_unaddressed_chatter() {
    let oracle = ScriptedOracle::new(&["no"]);
    let orchestrator =
        TurnOrchestrator::new(oracle, weather_backend(false), &EngineConfig::default());

    let outcome = orchestrator
        .handle_message(request("lol same", false))
        .await;

    assert!(matches!(
        outcome,
        ProcessingOutcome::Stop(StopReason::Gatekept)
    ));
}

#[tokio::test]
async fn test_gate_failure_stops_with_internal_error() {
    // Empty script: the very first oracle call fails
    let oracle = ScriptedOracle::new(&[]);
    let orchestrator =
        TurnOrchestrator::new(oracle, weather_backend(false), &EngineConfig::default());

    let outcome = orchestrator
        .handle_message(request("what's the weather?", false))
        .await;

    assert!(matches!(
        outcome,
        ProcessingOutcome::Stop(StopReason::InternalError)
    ));
}

#[tokio::test]
async fn test_addressed_message_skips_gate_and_replies() {
    // identify, extract, plan, synthesize: no gate call for an
    // addressed message
    let oracle = ScriptedOracle::new(&[
        r#"["get_weather"]"#,
        r#"{"get_weather": {"city": "Oslo"}}"#,
        r#"[{"step_order": 1, "tool": "get_weather", "parameters": {"city": "Oslo"}}]"#,
        "Light rain in Oslo today.",
    ]);
    let orchestrator =
        TurnOrchestrator::new(oracle, weather_backend(false), &EngineConfig::default());

    let outcome = orchestrator
        .handle_message(request("@bot weather in Oslo?", true))
        .await;

    match outcome {
        ProcessingOutcome::Proceed {
            acknowledgement,
            plan,
            stream,
        } => {
            assert!(acknowledgement.is_none(), "fast tool needs no ack");
            assert_eq!(plan.map(|p| p.len()), Some(1));
            assert_eq!(stream.collect().await, "Light rain in Oslo today.");
        }
        _ => panic!("expected a reply"),
    }
}

#[tokio::test]
async fn test_clarification_then_resume() {
    let oracle = ScriptedOracle::new(&[
        // turn 1: gate yes, identify, extract misses "city", clarify
        "yes",
        r#"["get_weather"]"#,
        r#"{"get_weather": {}}"#,
        "Which city would you like the weather for?",
        // turn 2: resumes at extraction with the answer in history
        r#"{"get_weather": {"city": "Oslo"}}"#,
        r#"[{"step_order": 1, "tool": "get_weather", "parameters": {"city": "Oslo"}}]"#,
        "Light rain in Oslo today.",
    ]);
    let orchestrator =
        TurnOrchestrator::new(oracle, weather_backend(false), &EngineConfig::default());

    let outcome = orchestrator
        .handle_message(request("what's the weather?", false))
        .await;
    match outcome {
        ProcessingOutcome::Clarify(question) => {
            assert!(question.contains("city"));
        }
        _ => panic!("expected a clarification"),
    }

    // The follow-up answer resumes without a second gate call
    let outcome = orchestrator.handle_message(request("Oslo", false)).await;
    match outcome {
        ProcessingOutcome::Proceed { stream, .. } => {
            assert_eq!(stream.collect().await, "Light rain in Oslo today.");
        }
        _ => panic!("expected a reply after clarification"),
    }
}

#[tokio::test]
async fn test_no_tools_direct_synthesis() {
    let oracle = ScriptedOracle::new(&["yes", "[]", "Hello! How can I help?"]);
    let orchestrator =
        TurnOrchestrator::new(oracle, weather_backend(false), &EngineConfig::default());

    let outcome = orchestrator.handle_message(request("hi there", false)).await;
    match outcome {
        ProcessingOutcome::Proceed { stream, .. } => {
            assert_eq!(stream.collect().await, "Hello! How can I help?");
        }
        _ => panic!("expected a reply"),
    }
}

#[tokio::test]
async fn test_slow_tool_acknowledges_then_streams() {
    let oracle = ScriptedOracle::new(&[
        "yes",
        r#"["get_weather"]"#,
        r#"{"get_weather": {"city": "Oslo"}}"#,
        r#"[{"step_order": 1, "tool": "get_weather", "parameters": {"city": "Oslo"}}]"#,
        "On it, checking the long-range model now.",
        "Light rain in Oslo today.",
    ]);
    let orchestrator =
        TurnOrchestrator::new(oracle, weather_backend(true), &EngineConfig::default());

    let outcome = orchestrator
        .handle_message(request("what's the weather in Oslo?", false))
        .await;

    match outcome {
        ProcessingOutcome::Proceed {
            acknowledgement,
            stream,
            ..
        } => {
            assert_eq!(
                acknowledgement.as_deref(),
                Some("On it, checking the long-range model now.")
            );
            // The reply arrives through the stream after detached
            // execution completes
            assert_eq!(stream.collect().await, "Light rain in Oslo today.");
        }
        _ => panic!("expected an acknowledged reply"),
    }
}

#[tokio::test]
async fn test_synthesis_failure_falls_back_with_step_summary() {
    // Script runs out right at synthesis
    let oracle = ScriptedOracle::new(&[
        "yes",
        r#"["get_weather"]"#,
        r#"{"get_weather": {"city": "Oslo"}}"#,
        r#"[{"step_order": 1, "tool": "get_weather", "parameters": {"city": "Oslo"}}]"#,
    ]);
    let orchestrator =
        TurnOrchestrator::new(oracle, weather_backend(false), &EngineConfig::default());

    let outcome = orchestrator
        .handle_message(request("weather in Oslo?", false))
        .await;
    match outcome {
        ProcessingOutcome::Proceed { stream, .. } => {
            let text = stream.collect().await;
            assert!(text.contains("Sorry"));
            assert!(text.contains("get_weather"));
        }
        _ => panic!("expected a fallback reply"),
    }
}

#[tokio::test]
async fn test_detached_turn_cleanup_spares_newer_turn_state() {
    let release = Arc::new(Notify::new());
    let mut registry = BackendRegistry::new();
    registry.register(Arc::new(GatedWeatherBackend {
        release: Arc::clone(&release),
    }));

    let oracle = ScriptedOracle::new(&[
        // turn A: gates through, plans the slow tool, acknowledges,
        // then blocks inside the tool
        "yes",
        r#"["get_weather"]"#,
        r#"{"get_weather": {"city": "Oslo"}}"#,
        r#"[{"step_order": 1, "tool": "get_weather", "parameters": {"city": "Oslo"}}]"#,
        "Running the long-range model.",
        // turn B arrives in the same conversation while A executes and
        // lands in clarification
        "yes",
        r#"["get_weather"]"#,
        r#"{"get_weather": {}}"#,
        "Which city?",
        // A's detached synthesis once its tool is released
        "A finished.",
        // B's follow-up resumes at extraction
        r#"{"get_weather": {"city": "Bergen"}}"#,
        r#"[{"step_order": 1, "tool": "get_weather", "parameters": {"city": "Bergen"}}]"#,
        "Almost there.",
        "B finished.",
    ]);
    let orchestrator = TurnOrchestrator::new(oracle, registry, &EngineConfig::default());

    let outcome_a = orchestrator
        .handle_message(request("weather in Oslo?", false))
        .await;
    let a_stream = match outcome_a {
        ProcessingOutcome::Proceed {
            acknowledgement,
            stream,
            ..
        } => {
            assert!(acknowledgement.is_some());
            stream
        }
        _ => panic!("expected an acknowledged reply"),
    };

    let outcome_b = orchestrator
        .handle_message(request("what's the weather?", false))
        .await;
    assert!(matches!(outcome_b, ProcessingOutcome::Clarify(_)));
    assert_eq!(orchestrator.states().len().await, 1);

    // A finishes; its cleanup must not touch B's pending clarification
    release.notify_one();
    assert_eq!(a_stream.collect().await, "A finished.");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(orchestrator.states().len().await, 1);

    // B resumes with its answer and gets its own reply
    release.notify_one();
    let outcome = orchestrator.handle_message(request("Bergen", false)).await;
    match outcome {
        ProcessingOutcome::Proceed { stream, .. } => {
            assert_eq!(stream.collect().await, "B finished.");
        }
        _ => panic!("expected a reply after the clarification answer"),
    }
}

#[tokio::test]
async fn test_expired_clarification_starts_fresh_turn() {
    let oracle = ScriptedOracle::new(&[
        // turn 1 ends awaiting clarification
        "yes",
        r#"["get_weather"]"#,
        r#"{"get_weather": {}}"#,
        "Which city?",
        // the follow-up arrives after expiry: gate runs again
        "no",
    ]);
    let mut config = EngineConfig::default();
    config.limits.turn_state_ttl_secs = 0;
    let orchestrator = TurnOrchestrator::new(oracle, weather_backend(false), &config);

    let outcome = orchestrator
        .handle_message(request("what's the weather?", false))
        .await;
    assert!(matches!(outcome, ProcessingOutcome::Clarify(_)));

    // With a zero TTL the pending state is already stale; the reply is
    // triaged and gated as a brand-new turn instead of resuming
    // extraction.
    let outcome = orchestrator.handle_message(request("Oslo", false)).await;
    assert!(matches!(
        outcome,
        ProcessingOutcome::Stop(StopReason::Gatekept)
    ));
}

#[tokio::test]
async fn test_state_cleared_after_reply() {
    let oracle = ScriptedOracle::new(&["yes", "[]", "Hi!"]);
    let orchestrator =
        TurnOrchestrator::new(oracle, BackendRegistry::new(), &EngineConfig::default());

    let outcome = orchestrator.handle_message(request("hello", false)).await;
    if let ProcessingOutcome::Proceed { stream, .. } = outcome {
        stream.collect().await;
    }
    assert!(orchestrator.states().is_empty().await);
}
