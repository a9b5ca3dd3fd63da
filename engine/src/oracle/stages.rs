//! Typed stage calls
//!
//! Each stage of the turn state machine talks to the oracle through one
//! narrow method here: the transcript plus a stage instruction go in, a
//! stage-specific typed result comes out. Each call carries the bounded
//! oracle timeout; malformed output surfaces as `OracleError::Malformed`.

use super::{parse_lenient, Message, Oracle, OracleError};
use crate::catalog::ToolDefinition;
use crate::config::BotProfile;
use crate::plan::{ParameterValue, PlanStep};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Per-tool extraction outcome: parameter values the oracle found, and
/// required parameter names still missing (cross-referenced against each
/// tool's declared schema).
#[derive(Debug, Clone, Default)]
pub struct ExtractedParameters {
    pub found: BTreeMap<String, BTreeMap<String, Value>>,
    pub missing: BTreeMap<String, Vec<String>>,
}

impl ExtractedParameters {
    /// Cross-reference found values against each tool's required inputs
    pub fn from_found(
        found: BTreeMap<String, BTreeMap<String, Value>>,
        tools: &[&ToolDefinition],
    ) -> Self {
        let mut missing = BTreeMap::new();
        for tool in tools {
            let tool_found = found.get(&tool.name);
            let absent: Vec<String> = tool
                .required_inputs()
                .into_iter()
                .filter(|name| {
                    tool_found
                        .and_then(|m| m.get(*name))
                        .map(|v| !v.is_null())
                        != Some(true)
                })
                .map(String::from)
                .collect();
            if !absent.is_empty() {
                missing.insert(tool.name.clone(), absent);
            }
        }
        Self { found, missing }
    }

    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }
}

/// Intermediate deserialization type for oracle plan output
#[derive(Debug, Deserialize)]
struct RawPlanStep {
    #[serde(default)]
    step_order: Option<u32>,
    tool: String,
    #[serde(default)]
    parameters: BTreeMap<String, RawParameterValue>,
}

/// A raw parameter as the oracle writes it: either a link object or a
/// plain literal value.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawParameterValue {
    Link {
        from_step: u32,
        output_key: String,
    },
    Many(Vec<RawParameterValue>),
    Literal(Value),
}

impl RawParameterValue {
    fn into_parameter_value(self) -> ParameterValue {
        match self {
            Self::Link {
                from_step,
                output_key,
            } => ParameterValue::linked(from_step, output_key),
            Self::Many(entries) => ParameterValue::Collection(
                entries
                    .into_iter()
                    .map(RawParameterValue::into_parameter_value)
                    .collect(),
            ),
            Self::Literal(value) => ParameterValue::Literal(value),
        }
    }
}

/// Stage-typed facade over an oracle provider
pub struct StageOracle {
    oracle: Arc<dyn Oracle>,
    timeout: Duration,
}

impl StageOracle {
    pub fn new(oracle: Arc<dyn Oracle>, timeout: Duration) -> Self {
        Self { oracle, timeout }
    }

    async fn call(&self, messages: Vec<Message>) -> Result<String, OracleError> {
        match tokio::time::timeout(self.timeout, self.oracle.complete(&messages)).await {
            Ok(result) => result,
            Err(_) => Err(OracleError::Timeout),
        }
    }

    fn with_instruction(history: &[Message], instruction: String) -> Vec<Message> {
        let mut messages = vec![Message::system(instruction)];
        messages.extend_from_slice(history);
        messages
    }

    /// Gate: should the bot respond to this conversation at all?
    pub async fn gate(&self, history: &[Message]) -> Result<bool, OracleError> {
        let messages = Self::with_instruction(
            history,
            "Decide whether the bot should respond to the latest message in this \
             conversation. Answer with exactly one word: yes or no."
                .to_string(),
        );
        let content = self.call(messages).await?;
        let first = content
            .trim()
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .trim_matches(|c: char| !c.is_alphabetic())
            .to_lowercase();
        match first.as_str() {
            "yes" => Ok(true),
            "no" => Ok(false),
            _ => Err(OracleError::Malformed(format!(
                "gate expected yes/no, got '{}'",
                content.trim()
            ))),
        }
    }

    /// Identify which of the available tools the request calls for.
    /// An empty list is a valid answer.
    pub async fn identify_tools(
        &self,
        history: &[Message],
        tools: &[ToolDefinition],
    ) -> Result<Vec<String>, OracleError> {
        let mut listing = String::new();
        for tool in tools {
            listing.push_str(&format!(
                "- {}: {}\n",
                tool.name,
                tool.description.as_deref().unwrap_or("(no description)")
            ));
        }
        let messages = Self::with_instruction(
            history,
            format!(
                "Available tools:\n{listing}\n\
                 Which tools, if any, are needed to handle the latest message?\n\
                 Output ONLY a JSON array of tool names, e.g. [\"get_weather\"].\n\
                 Output [] if no tool is needed."
            ),
        );
        let content = self.call(messages).await?;
        parse_lenient(&content)
    }

    /// Extract parameter values for the candidate tools from the
    /// conversation.
    pub async fn extract_parameters(
        &self,
        history: &[Message],
        tools: &[&ToolDefinition],
    ) -> Result<ExtractedParameters, OracleError> {
        let mut listing = String::new();
        for tool in tools {
            listing.push_str(&format!("Tool {}:\n", tool.name));
            for input in &tool.inputs {
                listing.push_str(&format!(
                    "  - {} ({:?}{})\n",
                    input.name,
                    input.param_type,
                    if input.required { ", required" } else { "" }
                ));
            }
        }
        let messages = Self::with_instruction(
            history,
            format!(
                "Extract parameter values for these tools from the conversation:\n\
                 {listing}\n\
                 Output ONLY a JSON object mapping tool name to an object of the \
                 parameter values you can determine. Omit parameters you cannot \
                 determine; never invent values.\n\
                 Example: {{\"get_weather\": {{\"city\": \"Oslo\"}}}}"
            ),
        );
        let content = self.call(messages).await?;
        let found: BTreeMap<String, BTreeMap<String, Value>> = parse_lenient(&content)?;
        Ok(ExtractedParameters::from_found(found, tools))
    }

    /// Order the tool calls into a plan with parameter mappings.
    ///
    /// The oracle proposes linked references where one tool's declared
    /// output feeds another's input; the caller validates the
    /// back-reference invariant afterwards.
    pub async fn build_plan(
        &self,
        history: &[Message],
        tools: &[&ToolDefinition],
        extracted: &ExtractedParameters,
    ) -> Result<Vec<PlanStep>, OracleError> {
        let mut listing = String::new();
        for tool in tools {
            let outputs: Vec<&str> = tool.output_keys.iter().map(String::as_str).collect();
            listing.push_str(&format!(
                "- {} (outputs: {})\n",
                tool.name,
                if outputs.is_empty() {
                    "text".to_string()
                } else {
                    outputs.join(", ")
                }
            ));
        }
        let extracted_json =
            serde_json::to_string(&extracted.found).unwrap_or_else(|_| "{}".to_string());
        let messages = Self::with_instruction(
            history,
            format!(
                "Order these tool calls into an execution plan:\n{listing}\n\
                 Known parameter values: {extracted_json}\n\
                 Output ONLY a JSON array of steps. Each step object must have:\n\
                 - \"step_order\": 1-based integer, strictly increasing\n\
                 - \"tool\": tool name\n\
                 - \"parameters\": object mapping parameter name to either a \
                 literal value or {{\"from_step\": N, \"output_key\": \"key\"}} \
                 referencing an EARLIER step's output.\n\
                 Example:\n\
                 [{{\"step_order\":1,\"tool\":\"search\",\"parameters\":{{\"q\":\"cats\"}}}},\
                 {{\"step_order\":2,\"tool\":\"summarize\",\"parameters\":{{\"text\":{{\"from_step\":1,\"output_key\":\"results\"}}}}}}]"
            ),
        );
        let content = self.call(messages).await?;
        let raw_steps: Vec<RawPlanStep> = parse_lenient(&content)?;

        let steps = raw_steps
            .into_iter()
            .enumerate()
            .map(|(i, raw)| {
                let tool = tools
                    .iter()
                    .find(|t| t.name == raw.tool)
                    .ok_or_else(|| {
                        OracleError::Malformed(format!("plan names unknown tool '{}'", raw.tool))
                    })?;
                Ok(PlanStep {
                    step_order: raw.step_order.unwrap_or(i as u32 + 1),
                    tool_name: raw.tool,
                    server_id: tool.server_id,
                    parameters: raw
                        .parameters
                        .into_iter()
                        .map(|(k, v)| (k, v.into_parameter_value()))
                        .collect(),
                })
            })
            .collect::<Result<Vec<_>, OracleError>>()?;

        debug!(steps = steps.len(), "oracle proposed plan");
        Ok(steps)
    }

    /// Produce a clarification question for missing required parameters,
    /// in the bot's voice.
    pub async fn clarify(
        &self,
        history: &[Message],
        profile: &BotProfile,
        missing: &BTreeMap<String, Vec<String>>,
    ) -> Result<String, OracleError> {
        let missing_json = serde_json::to_string(missing).unwrap_or_else(|_| "{}".to_string());
        let messages = Self::with_instruction(
            history,
            format!(
                "You are {}. {}\n\
                 These required details are still missing: {missing_json}\n\
                 Ask the user one short question to get them. Output only the question.",
                profile.name, profile.persona
            ),
        );
        self.call(messages).await
    }

    /// Produce a short wait message before a slow tool runs
    pub async fn acknowledge(
        &self,
        history: &[Message],
        profile: &BotProfile,
    ) -> Result<String, OracleError> {
        let messages = Self::with_instruction(
            history,
            format!(
                "You are {}. {}\n\
                 The request will take a little while to process. Write one short \
                 sentence telling the user you are on it. Output only the sentence.",
                profile.name, profile.persona
            ),
        );
        self.call(messages).await
    }

    /// Produce the final reply from the original request and the step
    /// outputs (if any).
    pub async fn synthesize(
        &self,
        history: &[Message],
        profile: &BotProfile,
        step_outputs: Option<&str>,
    ) -> Result<String, OracleError> {
        let results = match step_outputs {
            Some(outputs) => format!("Tool results:\n{outputs}\n"),
            None => String::new(),
        };
        let messages = Self::with_instruction(
            history,
            format!(
                "You are {}. {}\n{results}\
                 Write the reply to the user's request. Plain text only.",
                profile.name, profile.persona
            ),
        );
        self.call(messages).await
    }

    /// Decide whether the conversation contains a fact worth keeping in
    /// long-term memory. Returns `None` when there is nothing to archive.
    pub async fn archive(&self, history: &[Message]) -> Result<Option<String>, OracleError> {
        let messages = Self::with_instruction(
            history,
            "Does this conversation contain a durable fact about the user or their \
             environment worth remembering for later conversations?\n\
             Output ONLY JSON: {\"fact\": \"the fact\"} or {\"fact\": null}."
                .to_string(),
        );
        let content = self.call(messages).await?;

        #[derive(Deserialize)]
        struct ArchiveDecision {
            fact: Option<String>,
        }
        let decision: ArchiveDecision = parse_lenient(&content)?;
        Ok(decision.fact.filter(|f| !f.trim().is_empty()))
    }
}
