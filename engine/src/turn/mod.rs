//! Turn Orchestrator
//!
//! The per-message state machine: triage, gate, identify tools, extract
//! parameters, clarify or plan, acknowledge slow work, execute, synthesize,
//! archive. One inbound message produces exactly one `ProcessingOutcome`.
//!
//! Fast turns complete before `handle_message` returns, with the reply
//! already buffered in the returned stream. Turns touching a slow tool
//! return immediately after the acknowledgement; execution, synthesis, and
//! archiving continue in a detached task and the caller hears the rest
//! through the stream.

pub mod state;

pub use state::{PendingClarification, TurnState, TurnStateStore};

use crate::backends::BackendRegistry;
use crate::catalog::{ToolCatalog, ToolDefinition};
use crate::config::{BotProfile, EngineConfig};
use crate::oracle::{ExtractedParameters, Message, Oracle, StageOracle};
use crate::plan::{Plan, PlanExecutor, PlanReport};
use async_trait::async_trait;
use sdk::errors::CoreError;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// One inbound message, as delivered by the surrounding application
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub conversation_id: String,
    pub text: String,
    /// Contextual attachment reference, if the message carried one
    pub attachment: Option<String>,
    /// True when the platform layer saw an explicit bot address
    /// (mention, reply, command prefix)
    pub addressed: bool,
}

/// Why a turn stopped without a reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Attachment-only or otherwise empty message
    Ignored,
    /// The gate decided the bot should stay quiet
    Gatekept,
    /// A gating-stage oracle call failed; the engine never guesses
    InternalError,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ignored => "ignored",
            Self::Gatekept => "gatekept",
            Self::InternalError => "internal_error",
        }
    }
}

/// The single outcome of one turn
pub enum ProcessingOutcome {
    Stop(StopReason),
    /// A clarification question; the conversation's next message resumes
    /// at parameter extraction
    Clarify(String),
    /// The turn is answering; text arrives through the stream
    Proceed {
        /// Wait message, present when a slow tool is planned
        acknowledgement: Option<String>,
        /// The executed plan, absent when no tools were involved
        plan: Option<Plan>,
        stream: ReplyStream,
    },
}

/// Consumed-once stream of reply text chunks
pub struct ReplyStream {
    rx: mpsc::UnboundedReceiver<String>,
}

impl ReplyStream {
    fn channel() -> (mpsc::UnboundedSender<String>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self { rx })
    }

    /// Next chunk, or `None` once the reply is complete
    pub async fn next_chunk(&mut self) -> Option<String> {
        self.rx.recv().await
    }

    /// Drain the stream into one string (mostly for tests and batch callers)
    pub async fn collect(mut self) -> String {
        let mut out = String::new();
        while let Some(chunk) = self.next_chunk().await {
            out.push_str(&chunk);
        }
        out
    }
}

/// Long-term memory sink for archived facts.
///
/// Archiving is fire-and-forget: sink errors are logged and swallowed,
/// never surfaced to the requester.
#[async_trait]
pub trait ArchiveSink: Send + Sync {
    async fn store(&self, conversation_id: &str, fact: &str) -> Result<(), CoreError>;
}

/// The per-message orchestration engine
pub struct TurnOrchestrator {
    stages: Arc<StageOracle>,
    backends: BackendRegistry,
    executor: Arc<PlanExecutor>,
    states: Arc<TurnStateStore>,
    profile: BotProfile,
    chunk_chars: usize,
    archive: Option<Arc<dyn ArchiveSink>>,
}

impl TurnOrchestrator {
    pub fn new(
        oracle: Arc<dyn Oracle>,
        backends: BackendRegistry,
        config: &EngineConfig,
    ) -> Self {
        let stages = Arc::new(StageOracle::new(
            oracle,
            Duration::from_secs(config.limits.oracle_timeout_secs),
        ));
        let executor = Arc::new(PlanExecutor::new(
            backends.clone(),
            Duration::from_secs(config.limits.tool_timeout_secs),
        ));
        let states = Arc::new(TurnStateStore::new(Duration::from_secs(
            config.limits.turn_state_ttl_secs,
        )));
        Self {
            stages,
            backends,
            executor,
            states,
            profile: config.profile.clone(),
            chunk_chars: config.limits.stream_chunk_chars.max(1),
            archive: None,
        }
    }

    /// Attach a long-term memory sink for the archive stage
    pub fn with_archive_sink(mut self, sink: Arc<dyn ArchiveSink>) -> Self {
        self.archive = Some(sink);
        self
    }

    /// The store of open turn states (exposed for host-driven sweeps)
    pub fn states(&self) -> Arc<TurnStateStore> {
        Arc::clone(&self.states)
    }

    /// Process one inbound message to its single outcome.
    ///
    /// Stage-level failures come back as `Stop(InternalError)`; the only
    /// other outcomes a caller sees are a clarification question or a
    /// reply stream.
    pub async fn handle_message(&self, req: TurnRequest) -> ProcessingOutcome {
        let conversation_id = req.conversation_id.clone();
        let slot = self.states.acquire(&conversation_id).await;
        let mut state = slot.lock().await;

        let resuming = state.pending.is_some();

        // State 1: cheap deterministic triage. Attachment-only messages
        // are dropped without an oracle call.
        if !resuming && req.text.trim().is_empty() {
            state.retire();
            drop(state);
            self.states.release(&conversation_id, &slot).await;
            return ProcessingOutcome::Stop(StopReason::Ignored);
        }

        state.history.push(incoming_message(&req));
        state.touch();

        // Fresh per-turn snapshot of the available tools
        let catalog = ToolCatalog::fetch(self.backends.all()).await;

        let (tools, prior_found) = if resuming {
            // A clarification answer resumes at extraction with the new
            // message merged into history.
            let pending = state.pending.take().unwrap_or_else(|| PendingClarification {
                tool_names: Vec::new(),
                found: BTreeMap::new(),
            });
            let tools = resolve_candidates(&catalog, &pending.tool_names);
            (tools, pending.found)
        } else {
            // State 2: gate, unless the bot was addressed explicitly
            if !req.addressed {
                match self.stages.gate(&state.history).await {
                    Ok(true) => {}
                    Ok(false) => {
                        debug!(%conversation_id, "gate declined the message");
                        state.retire();
                        drop(state);
                        self.states.release(&conversation_id, &slot).await;
                        return ProcessingOutcome::Stop(StopReason::Gatekept);
                    }
                    Err(e) => {
                        warn!(%conversation_id, error = %e, "gate stage failed");
                        state.retire();
                        drop(state);
                        self.states.release(&conversation_id, &slot).await;
                        return ProcessingOutcome::Stop(StopReason::InternalError);
                    }
                }
            }

            // State 3: identify candidate tools
            let names = match self.stages.identify_tools(&state.history, catalog.tools()).await {
                Ok(names) => names,
                Err(e) => {
                    warn!(%conversation_id, error = %e, "identify stage failed");
                    state.retire();
                    drop(state);
                    self.states.release(&conversation_id, &slot).await;
                    return ProcessingOutcome::Stop(StopReason::InternalError);
                }
            };
            (resolve_candidates(&catalog, &names), BTreeMap::new())
        };

        // No tools: straight to synthesis with empty tool outputs
        if tools.is_empty() {
            let history = state.history.clone();
            state.retire();
            drop(state);
            self.states.release(&conversation_id, &slot).await;
            return self
                .finish_fast(conversation_id, history, None, None)
                .await;
        }

        // State 4: extract parameters, cross-referenced against schemas
        let tool_refs: Vec<&ToolDefinition> = tools.iter().collect();
        let extracted = match self.stages.extract_parameters(&state.history, &tool_refs).await {
            Ok(extracted) => merge_found(prior_found, extracted, &tool_refs),
            Err(e) => {
                warn!(%conversation_id, error = %e, "extract stage failed");
                state.retire();
                drop(state);
                self.states.release(&conversation_id, &slot).await;
                return ProcessingOutcome::Stop(StopReason::InternalError);
            }
        };

        // State 5: missing required parameters drive a clarification
        if !extracted.is_complete() {
            let question = match self
                .stages
                .clarify(&state.history, &self.profile, &extracted.missing)
                .await
            {
                Ok(question) => question,
                Err(e) => {
                    warn!(%conversation_id, error = %e, "clarify stage failed");
                    state.retire();
                    drop(state);
                    self.states.release(&conversation_id, &slot).await;
                    return ProcessingOutcome::Stop(StopReason::InternalError);
                }
            };
            state.history.push(Message::assistant(question.clone()));
            state.pending = Some(PendingClarification {
                tool_names: tools.iter().map(|t| t.name.clone()).collect(),
                found: extracted.found,
            });
            state.touch();
            info!(%conversation_id, "awaiting clarification");
            return ProcessingOutcome::Clarify(question);
        }

        // State 6a: order the calls into a validated plan
        let plan = match self
            .stages
            .build_plan(&state.history, &tool_refs, &extracted)
            .await
            .map_err(|e| CoreError::InvalidPlan(e.to_string()))
            .and_then(Plan::new)
        {
            Ok(plan) => plan,
            Err(e) => {
                warn!(%conversation_id, error = %e, "plan stage failed");
                state.retire();
                drop(state);
                self.states.release(&conversation_id, &slot).await;
                return ProcessingOutcome::Stop(StopReason::InternalError);
            }
        };

        // State 7: acknowledge before slow work. A failed acknowledgement
        // call degrades to a stock wait message; the plan already exists
        // and execution proceeds regardless.
        let any_slow = plan
            .steps()
            .iter()
            .any(|s| {
                catalog
                    .lookup(s.server_id, &s.tool_name)
                    .map(|t| t.is_slow)
                    .unwrap_or(false)
            });
        let acknowledgement = if any_slow {
            Some(
                self.stages
                    .acknowledge(&state.history, &self.profile)
                    .await
                    .unwrap_or_else(|e| {
                        warn!(%conversation_id, error = %e, "acknowledge stage failed");
                        "On it, this may take a moment.".to_string()
                    }),
            )
        } else {
            None
        };

        // The plan is built and the history snapshot taken; the slot has
        // served its purpose. Retiring and releasing it here, before any
        // detached work, means a new turn in this conversation starts
        // fresh immediately and nothing finishing later can touch its
        // state.
        let history = state.history.clone();
        state.retire();
        drop(state);
        self.states.release(&conversation_id, &slot).await;

        if any_slow {
            // States 8-10 run detached; the caller gets control back now
            // and hears the rest through the stream.
            let (tx, stream) = ReplyStream::channel();
            let executed_plan = plan.clone();
            let stages = Arc::clone(&self.stages);
            let executor = Arc::clone(&self.executor);
            let profile = self.profile.clone();
            let archive = self.archive.clone();
            let chunk_chars = self.chunk_chars;
            tokio::spawn(async move {
                let report = executor.execute(&plan, &catalog).await;
                let text = synthesize_or_fallback(
                    &stages,
                    &history,
                    &profile,
                    Some(&report),
                )
                .await;
                stream_text(&tx, &text, chunk_chars);
                drop(tx);
                spawn_archive(stages, archive, conversation_id, history);
            });
            ProcessingOutcome::Proceed {
                acknowledgement,
                plan: Some(executed_plan),
                stream,
            }
        } else {
            // State 8: execute inline, then synthesize
            let report = self.executor.execute(&plan, &catalog).await;
            self.finish_fast(conversation_id, history, Some(plan), Some(report))
                .await
        }
    }

    /// States 6b/9-10 for the synchronous branch: synthesize, buffer the
    /// stream, archive. The caller has already released the turn state.
    async fn finish_fast(
        &self,
        conversation_id: String,
        history: Vec<Message>,
        plan: Option<Plan>,
        report: Option<PlanReport>,
    ) -> ProcessingOutcome {
        let text =
            synthesize_or_fallback(&self.stages, &history, &self.profile, report.as_ref()).await;

        let (tx, stream) = ReplyStream::channel();
        stream_text(&tx, &text, self.chunk_chars);
        drop(tx);

        spawn_archive(
            Arc::clone(&self.stages),
            self.archive.clone(),
            conversation_id,
            history,
        );

        ProcessingOutcome::Proceed {
            acknowledgement: None,
            plan,
            stream,
        }
    }
}

fn incoming_message(req: &TurnRequest) -> Message {
    match &req.attachment {
        Some(attachment) => Message::user(format!("{}\n[attachment: {}]", req.text, attachment)),
        None => Message::user(&req.text),
    }
}

/// Map oracle-proposed tool names onto the catalog snapshot, dropping
/// names the snapshot does not know.
fn resolve_candidates(catalog: &ToolCatalog, names: &[String]) -> Vec<ToolDefinition> {
    let mut tools = Vec::new();
    for name in names {
        match catalog.lookup_by_name(name) {
            Some(tool) => tools.push(tool.clone()),
            None => warn!(tool = %name, "oracle proposed unknown tool, dropping"),
        }
    }
    tools
}

/// Overlay a fresh extraction on top of values found before a
/// clarification; the fresh values win.
fn merge_found(
    prior: BTreeMap<String, BTreeMap<String, Value>>,
    fresh: ExtractedParameters,
    tools: &[&ToolDefinition],
) -> ExtractedParameters {
    if prior.is_empty() {
        return fresh;
    }
    let mut merged = prior;
    for (tool, params) in fresh.found {
        let entry = merged.entry(tool).or_default();
        for (name, value) in params {
            entry.insert(name, value);
        }
    }
    ExtractedParameters::from_found(merged, tools)
}

/// Synthesis never results in silence: a failed final oracle call yields
/// a stock apology, with the per-step status attached when tools ran.
async fn synthesize_or_fallback(
    stages: &StageOracle,
    history: &[Message],
    profile: &BotProfile,
    report: Option<&PlanReport>,
) -> String {
    let outputs_json = report.map(|r| {
        serde_json::to_string_pretty(&r.per_step).unwrap_or_else(|_| r.summary())
    });
    match stages
        .synthesize(history, profile, outputs_json.as_deref())
        .await
    {
        Ok(text) => text,
        Err(e) => {
            warn!(error = %e, "synthesis failed, sending fallback");
            match report {
                Some(report) => format!(
                    "Sorry, I had trouble writing up the result. Here is where things stand:\n{}",
                    report.summary()
                ),
                None => "Sorry, I had trouble putting a reply together. Please try again."
                    .to_string(),
            }
        }
    }
}

fn stream_text(tx: &mpsc::UnboundedSender<String>, text: &str, chunk_chars: usize) {
    let mut chars = text.chars().peekable();
    while chars.peek().is_some() {
        let chunk: String = chars.by_ref().take(chunk_chars).collect();
        if tx.send(chunk).is_err() {
            // Receiver dropped: the caller abandoned the stream
            break;
        }
    }
}

/// State 10: fire-and-forget archive decision. Never blocks the turn and
/// never fails it.
fn spawn_archive(
    stages: Arc<StageOracle>,
    sink: Option<Arc<dyn ArchiveSink>>,
    conversation_id: String,
    history: Vec<Message>,
) {
    let Some(sink) = sink else {
        return;
    };
    tokio::spawn(async move {
        match stages.archive(&history).await {
            Ok(Some(fact)) => {
                debug!(%conversation_id, "archiving fact");
                if let Err(e) = sink.store(&conversation_id, &fact).await {
                    warn!(%conversation_id, error = %e, "archive sink failed");
                }
            }
            Ok(None) => {}
            Err(e) => warn!(%conversation_id, error = %e, "archive decision failed"),
        }
    });
}
