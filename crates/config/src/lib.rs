//! Configuration loading, validation, and management for Anjia.
//!
//! Loads configuration from `~/.anjia/config.toml` with environment
//! variable overrides. Validates all settings at startup.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Hard upper bound for per-turn iterations accepted from clients.
pub const ITERATION_CEILING: u32 = 30;

/// The root configuration structure.
///
/// Maps directly to `~/.anjia/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Model backend configuration
    #[serde(default)]
    pub model: ModelConfig,

    /// Agent loop limits and retry policy
    #[serde(default)]
    pub agent: AgentConfig,

    /// Session store bounds
    #[serde(default)]
    pub sessions: SessionsConfig,

    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// API key for the model backend
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Base URL of an OpenAI-compatible API
    #[serde(default = "default_api_url")]
    pub api_url: String,

    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Max tokens per model response
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

fn default_api_url() -> String {
    "https://api.openai.com/v1".into()
}
fn default_model() -> String {
    "Qwen3-Max".into()
}
fn default_temperature() -> f32 {
    0.7
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_url: default_api_url(),
            model: default_model(),
            temperature: default_temperature(),
            max_tokens: None,
        }
    }
}

/// Redact a secret string for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

impl std::fmt::Debug for ModelConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelConfig")
            .field("api_key", &redact(&self.api_key))
            .field("api_url", &self.api_url)
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Iterations per turn when the request does not say
    #[serde(default = "default_max_iterations")]
    pub default_max_iterations: u32,

    /// Largest `max_iterations` a request may ask for
    #[serde(default = "default_iterations_cap")]
    pub max_iterations_cap: u32,

    #[serde(default = "default_tool_timeout")]
    pub tool_timeout_secs: u64,

    #[serde(default = "default_gateway_timeout")]
    pub gateway_timeout_secs: u64,

    /// Tool invocations allowed to run at once within one turn
    #[serde(default = "default_parallel_tools")]
    pub max_parallel_tools: usize,

    /// Most recent messages sent to the model each iteration
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,

    /// Overrides the built-in advisor prompt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,

    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_max_iterations() -> u32 {
    15
}
fn default_iterations_cap() -> u32 {
    ITERATION_CEILING
}
fn default_tool_timeout() -> u64 {
    30
}
fn default_gateway_timeout() -> u64 {
    120
}
fn default_parallel_tools() -> usize {
    8
}
fn default_history_limit() -> usize {
    200
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            default_max_iterations: default_max_iterations(),
            max_iterations_cap: default_iterations_cap(),
            tool_timeout_secs: default_tool_timeout(),
            gateway_timeout_secs: default_gateway_timeout(),
            max_parallel_tools: default_parallel_tools(),
            history_limit: default_history_limit(),
            system_prompt: None,
            retry: RetryConfig::default(),
        }
    }
}

impl AgentConfig {
    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs)
    }

    pub fn gateway_timeout(&self) -> Duration {
        Duration::from_secs(self.gateway_timeout_secs)
    }
}

/// Backoff for retryable model gateway failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_base_delay() -> u64 {
    500
}
fn default_max_delay() -> u64 {
    8000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay(),
            max_delay_ms: default_max_delay(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionsConfig {
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,

    /// Idle conversations older than this are dropped
    #[serde(default = "default_idle_ttl")]
    pub idle_ttl_secs: u64,
}

fn default_max_sessions() -> usize {
    1000
}
fn default_idle_ttl() -> u64 {
    3600
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            max_sessions: default_max_sessions(),
            idle_ttl_secs: default_idle_ttl(),
        }
    }
}

impl SessionsConfig {
    pub fn idle_ttl(&self) -> Duration {
        Duration::from_secs(self.idle_ttl_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".into()
}
fn default_port() -> u16 {
    8000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl AppConfig {
    /// Load configuration from the default path (~/.anjia/config.toml).
    ///
    /// Also checks environment variables:
    /// - `ANJIA_API_KEY` (highest priority), then `OPENAI_API_KEY`
    /// - `OPENAI_API_BASE_URL`, `OPENAI_MODEL`
    /// - `ANJIA_PORT`
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Apply environment overrides through `lookup`.
    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(key) = lookup("ANJIA_API_KEY").or_else(|| lookup("OPENAI_API_KEY")) {
            self.model.api_key = Some(key);
        }
        if let Some(url) = lookup("OPENAI_API_BASE_URL") {
            self.model.api_url = url;
        }
        if let Some(model) = lookup("OPENAI_MODEL") {
            self.model.model = model;
        }
        if let Some(port) = lookup("ANJIA_PORT") {
            match port.parse() {
                Ok(port) => self.server.port = port,
                Err(_) => tracing::warn!(value = %port, "Ignoring invalid ANJIA_PORT"),
            }
        }
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".anjia")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=2.0).contains(&self.model.temperature) {
            return Err(ConfigError::ValidationError(
                "model.temperature must be between 0.0 and 2.0".into(),
            ));
        }

        let agent = &self.agent;
        if agent.max_iterations_cap == 0 || agent.max_iterations_cap > ITERATION_CEILING {
            return Err(ConfigError::ValidationError(format!(
                "agent.max_iterations_cap must be between 1 and {ITERATION_CEILING}"
            )));
        }
        if agent.default_max_iterations == 0
            || agent.default_max_iterations > agent.max_iterations_cap
        {
            return Err(ConfigError::ValidationError(
                "agent.default_max_iterations must be between 1 and agent.max_iterations_cap".into(),
            ));
        }
        if agent.tool_timeout_secs == 0 || agent.gateway_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "agent timeouts must be greater than zero".into(),
            ));
        }
        if agent.max_parallel_tools == 0 {
            return Err(ConfigError::ValidationError(
                "agent.max_parallel_tools must be at least 1".into(),
            ));
        }
        if agent.history_limit == 0 {
            return Err(ConfigError::ValidationError(
                "agent.history_limit must be at least 1".into(),
            ));
        }
        if agent.retry.max_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "agent.retry.max_attempts must be at least 1".into(),
            ));
        }
        if agent.retry.base_delay_ms > agent.retry.max_delay_ms {
            return Err(ConfigError::ValidationError(
                "agent.retry.base_delay_ms must not exceed max_delay_ms".into(),
            ));
        }

        if self.sessions.max_sessions == 0 {
            return Err(ConfigError::ValidationError(
                "sessions.max_sessions must be at least 1".into(),
            ));
        }

        Ok(())
    }

    /// Check if an API key is available (from config or environment).
    pub fn has_api_key(&self) -> bool {
        self.model.api_key.is_some()
    }

    /// Generate a default config TOML string (for the `config` command).
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}
