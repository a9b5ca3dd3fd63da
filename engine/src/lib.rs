//! Maestro Engine Library
//!
//! The core of the Maestro orchestration engine: the per-message turn
//! state machine, plan validation and execution, the tool catalog, and
//! the workflow scheduler. It is used by embedding applications and by
//! the integration tests.

/// Configuration management module
pub mod config;

/// Logging and tracing setup
pub mod telemetry;

/// Decision oracle abstraction and staged prompting
pub mod oracle;

/// Tool catalog built from backend listings
pub mod catalog;

/// Tool backend transports
pub mod backends;

/// Plan validation, parameter resolution, and execution
pub mod plan;

/// The per-message turn state machine
pub mod turn;

/// Saved workflows, persistence, and scheduling
pub mod workflow;
