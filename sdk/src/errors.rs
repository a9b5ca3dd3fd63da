//! Error types and handling
//!
//! This module provides the error taxonomy used throughout the Maestro engine.
//! All errors implement the `ErrorExt` trait which provides user-friendly
//! hints and indicates whether errors are recoverable.
//!
//! # Security
//!
//! Hints are safe to display to end users: no backend URLs, no raw oracle
//! output, no internal identifiers. Raw error details stay in logs.

use thiserror::Error;

/// Trait for Maestro error extensions
///
/// Provides additional context for errors, including user-friendly hints
/// and recoverability information. All engine errors implement this trait.
pub trait ErrorExt {
    /// Returns a user-friendly hint for the error
    ///
    /// The hint never contains backend addresses, oracle output, or
    /// internal error identifiers.
    fn user_hint(&self) -> &str;

    /// Returns whether the error is recoverable
    ///
    /// Recoverable errors can be retried or worked around. Non-recoverable
    /// errors typically require operator intervention.
    fn is_recoverable(&self) -> bool;
}

/// Main engine error type
///
/// Each variant corresponds to one failure class of the orchestration
/// pipeline. Stage-level failures (gate, identify, extract, plan) abort a
/// turn; step-level failures (tool not found, link resolution, execution)
/// are recorded per step and isolated from sibling steps.
#[derive(Debug, Error)]
pub enum CoreError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    // Stage-level oracle errors. The turn aborts rather than guessing a default
    #[error("Gate decision failed: {0}")]
    GateDecision(String),

    #[error("Tool identification failed: {0}")]
    ToolIdentification(String),

    #[error("Parameter extraction failed: {0}")]
    ParameterExtraction(String),

    // Expected condition, drives the clarification branch
    #[error("Missing required parameters for '{tool}': {missing:?}")]
    MissingParameter { tool: String, missing: Vec<String> },

    // Plan construction errors
    #[error("Invalid plan: {0}")]
    InvalidPlan(String),

    // Step-level errors, recorded per step
    #[error("Tool not found: {name} (server {server_id})")]
    ToolNotFound { server_id: i64, name: String },

    #[error("Link resolution failed: step {source_step} output '{output_key}' unavailable")]
    LinkResolution { source_step: u32, output_key: String },

    #[error("Tool execution failed: {0}")]
    ToolExecution(String),

    #[error("Tool execution timed out after {0}s")]
    ToolTimeout(u64),

    // Synthesis never results in silence; this records why a fallback fired
    #[error("Synthesis failed: {0}")]
    Synthesis(String),

    // Archiving and workflow bookkeeping errors are logged and swallowed
    #[error("Persistence error: {0}")]
    Persistence(String),
}

impl ErrorExt for CoreError {
    fn user_hint(&self) -> &str {
        match self {
            Self::Config(_) => "Check the engine config file for errors",

            Self::GateDecision(_)
            | Self::ToolIdentification(_)
            | Self::ParameterExtraction(_) => {
                "I couldn't work out what to do with that message. Try rephrasing it"
            }

            Self::MissingParameter { .. } => "Some required details are still missing",

            Self::InvalidPlan(_) => "I couldn't put together a valid sequence of actions",

            Self::ToolNotFound { .. } => "A requested capability is not available right now",
            Self::LinkResolution { .. } => "An earlier step didn't produce the expected result",
            Self::ToolExecution(_) => "One of the actions failed while running",
            Self::ToolTimeout(_) => "One of the actions took too long and was cancelled",

            Self::Synthesis(_) => "I had trouble writing up the result",

            Self::Persistence(_) => "Saving the record failed. The result itself is unaffected",
        }
    }

    fn is_recoverable(&self) -> bool {
        match self {
            Self::Config(_) => false,
            Self::InvalidPlan(_) => false,
            // Everything else is transient: retry the turn or the run
            _ => true,
        }
    }
}
