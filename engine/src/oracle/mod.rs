//! Decision Oracle Abstraction Layer
//!
//! The oracle is the text-completion service the turn orchestrator
//! consults at fixed points of the state machine. This module defines the
//! role-tagged transcript types, the `Oracle` trait every provider
//! implements, and the lenient JSON extraction helpers used by the stage
//! decoders: model output arrives as prose, fenced blocks, or bare JSON,
//! and malformed output is always a typed error, never a guessed default.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

pub mod openai;
pub mod stages;

pub use stages::{ExtractedParameters, StageOracle};

/// Result type for oracle operations
pub type Result<T> = std::result::Result<T, OracleError>;

/// Errors that can occur during oracle calls
#[derive(Debug, thiserror::Error)]
pub enum OracleError {
    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Timeout")]
    Timeout,

    #[error("Malformed output: {0}")]
    Malformed(String),
}

/// Message in a conversation transcript
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    /// Role of the message sender
    pub role: MessageRole,

    /// Content of the message
    pub content: String,
}

impl Message {
    /// Create a new user message
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    /// Create a new assistant message
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }

    /// Create a new system message
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }
}

/// Role of a message sender
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

impl fmt::Display for MessageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
            MessageRole::System => write!(f, "system"),
        }
    }
}

/// Oracle trait that all providers must implement
///
/// The engine sends a role-tagged transcript with a stage-specific
/// instruction and receives raw text back; the stage layer decodes it
/// into the typed result each stage expects.
#[async_trait]
pub trait Oracle: Send + Sync {
    /// Returns the name of the provider
    fn name(&self) -> &str;

    /// Generate a completion for the given transcript
    async fn complete(&self, messages: &[Message]) -> Result<String>;

    /// Check if the provider is currently healthy and available.
    /// Default implementation returns true.
    async fn check_health(&self) -> bool {
        true
    }
}

/// Extract the body of the first markdown code fence in the text.
///
/// Works even when there is trailing prose after the closing ```.
/// Returns `None` if no fenced block is found.
pub(crate) fn extract_fenced(content: &str) -> Option<&str> {
    let fence_start = content.find("```")?;
    let after_opening = &content[fence_start + 3..];

    // Skip the language tag line (e.g. "json\n")
    let body_start_rel = after_opening.find('\n')? + 1;
    let body_start = fence_start + 3 + body_start_rel;

    let closing = content[body_start..].find("```")?;
    let body_end = body_start + closing;

    if body_start >= body_end {
        return None;
    }

    Some(&content[body_start..body_end])
}

/// Extract a balanced JSON object or array starting at the first opening
/// delimiter in `s`.
///
/// Counts delimiter depth, respecting string literals, to find the
/// matching close. Used to pull structured output out of prose.
pub(crate) fn extract_balanced(s: &str, open: char, close: char) -> Option<&str> {
    let start = s.find(open)?;
    let candidate = &s[start..];

    let mut depth = 0i32;
    let mut in_string = false;
    let mut escape_next = false;

    for (i, ch) in candidate.char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }
        match ch {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            c if c == open && !in_string => depth += 1,
            c if c == close && !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&candidate[..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Parse a JSON value of type `T` out of free-form model output.
///
/// Tries, in order: the whole trimmed content, the first fenced block,
/// the first balanced object, the first balanced array.
pub(crate) fn parse_lenient<T: serde::de::DeserializeOwned>(content: &str) -> Result<T> {
    let trimmed = content.trim();

    if let Ok(value) = serde_json::from_str::<T>(trimmed) {
        return Ok(value);
    }

    if let Some(inner) = extract_fenced(trimmed) {
        if let Ok(value) = serde_json::from_str::<T>(inner.trim()) {
            return Ok(value);
        }
    }

    if let Some(obj) = extract_balanced(trimmed, '{', '}') {
        if let Ok(value) = serde_json::from_str::<T>(obj) {
            return Ok(value);
        }
    }

    if let Some(arr) = extract_balanced(trimmed, '[', ']') {
        if let Ok(value) = serde_json::from_str::<T>(arr) {
            return Ok(value);
        }
    }

    Err(OracleError::Malformed(format!(
        "no parseable JSON in output: {}",
        truncate(trimmed, 120)
    )))
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
