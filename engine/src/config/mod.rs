//! Configuration management
//!
//! Engine configuration is TOML, loaded from an explicit path or from
//! `~/.maestro/config.toml`. Every section has working defaults so a
//! missing file yields a usable local setup.
//!
//! # Configuration Sections
//!
//! - **core**: data directory, log level
//! - **oracle**: completion endpoint, model, API key env var, timeout
//! - **limits**: tool timeout, turn-state TTL, stream chunk size
//! - **profile**: the bot's name and persona used by the clarify,
//!   acknowledge, and synthesize stages

use sdk::errors::CoreError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Core engine settings
    #[serde(default)]
    pub core: CoreConfig,

    /// Decision oracle settings
    #[serde(default)]
    pub oracle: OracleConfig,

    /// Timeouts and bounds
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Bot personality
    #[serde(default)]
    pub profile: BotProfile,
}

/// Core engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Data directory for the workflow database
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_level: default_log_level(),
        }
    }
}

/// Decision oracle provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OracleConfig {
    /// OpenAI-compatible chat-completions base URL
    #[serde(default = "default_oracle_base_url")]
    pub base_url: String,

    /// Model name
    #[serde(default = "default_oracle_model")]
    pub model: String,

    /// Environment variable holding the API key; None for keyless local
    /// servers
    #[serde(default)]
    pub api_key_env: Option<String>,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            base_url: default_oracle_base_url(),
            model: default_oracle_model(),
            api_key_env: None,
        }
    }
}

/// Timeouts and bounds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Timeout for each oracle call in seconds
    #[serde(default = "default_oracle_timeout")]
    pub oracle_timeout_secs: u64,

    /// Timeout for each tool invocation in seconds
    #[serde(default = "default_tool_timeout")]
    pub tool_timeout_secs: u64,

    /// Inactivity expiry for a turn awaiting clarification, in seconds
    #[serde(default = "default_turn_state_ttl")]
    pub turn_state_ttl_secs: u64,

    /// Size of streamed reply chunks, in characters
    #[serde(default = "default_stream_chunk")]
    pub stream_chunk_chars: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            oracle_timeout_secs: default_oracle_timeout(),
            tool_timeout_secs: default_tool_timeout(),
            turn_state_ttl_secs: default_turn_state_ttl(),
            stream_chunk_chars: default_stream_chunk(),
        }
    }
}

/// Bot personality used by the user-facing oracle stages
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotProfile {
    #[serde(default = "default_bot_name")]
    pub name: String,

    /// One or two sentences describing tone and style
    #[serde(default = "default_persona")]
    pub persona: String,
}

impl Default for BotProfile {
    fn default() -> Self {
        Self {
            name: default_bot_name(),
            persona: default_persona(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".maestro")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_oracle_base_url() -> String {
    "http://localhost:11434/v1".to_string()
}

fn default_oracle_model() -> String {
    "llama3.1:8b".to_string()
}

fn default_oracle_timeout() -> u64 {
    60
}

fn default_tool_timeout() -> u64 {
    30
}

fn default_turn_state_ttl() -> u64 {
    900
}

fn default_stream_chunk() -> usize {
    256
}

fn default_bot_name() -> String {
    "Maestro".to_string()
}

fn default_persona() -> String {
    "Helpful, concise, and direct.".to_string()
}

impl EngineConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self, CoreError> {
        let content = fs::read_to_string(path)
            .map_err(|e| CoreError::Config(format!("cannot read {}: {e}", path.display())))?;
        toml::from_str(&content)
            .map_err(|e| CoreError::Config(format!("invalid TOML in {}: {e}", path.display())))
    }

    /// Load configuration from a path, falling back to defaults when the
    /// file does not exist. A present-but-broken file is still an error.
    pub fn load_or_default(path: &Path) -> Result<Self, CoreError> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Default config file location (`~/.maestro/config.toml`)
    pub fn default_path() -> PathBuf {
        default_data_dir().join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.core.log_level, "info");
        assert_eq!(config.limits.tool_timeout_secs, 30);
        assert_eq!(config.limits.turn_state_ttl_secs, 900);
        assert_eq!(config.profile.name, "Maestro");
        assert!(config.oracle.api_key_env.is_none());
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let parsed: EngineConfig = toml::from_str(
            r#"
            [oracle]
            base_url = "https://api.example.com/v1"
            model = "gpt-4o-mini"
            api_key_env = "EXAMPLE_API_KEY"

            [profile]
            name = "Piper"
            "#,
        )
        .unwrap();
        assert_eq!(parsed.oracle.model, "gpt-4o-mini");
        assert_eq!(parsed.oracle.api_key_env.as_deref(), Some("EXAMPLE_API_KEY"));
        assert_eq!(parsed.profile.name, "Piper");
        // Unspecified sections keep defaults
        assert_eq!(parsed.limits.oracle_timeout_secs, 60);
        assert_eq!(parsed.profile.persona, "Helpful, concise, and direct.");
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let config =
            EngineConfig::load_or_default(Path::new("/nonexistent/maestro.toml")).unwrap();
        assert_eq!(config.core.log_level, "info");
    }

    #[test]
    fn test_load_broken_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "not [valid toml").unwrap();
        assert!(matches!(
            EngineConfig::load_or_default(&path),
            Err(CoreError::Config(_))
        ));
    }

    #[test]
    fn test_round_trip() {
        let config = EngineConfig::default();
        let encoded = toml::to_string(&config).unwrap();
        let decoded: EngineConfig = toml::from_str(&encoded).unwrap();
        assert_eq!(decoded.limits.stream_chunk_chars, config.limits.stream_chunk_chars);
    }
}
