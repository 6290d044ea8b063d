//! Configuration management for the advisor relay.
//!
//! The relay reads an optional JSON file at `~/.mortgage-advisor/config.json`
//! (or the path in `ADVISOR_CONFIG`) and then applies environment overrides.
//!
//! # Configuration Priority
//!
//! 1. Environment variables
//! 2. Explicit config file values
//! 3. Default values
//!
//! # Environment Variable Mapping
//!
//! - `PORT` → network.port
//! - `ADVISOR_BIND_ADDRESS` → network.bind
//! - `GEMINI_API_KEY` (or `GOOGLE_API_KEY`) → secrets.gemini_api_key
//! - `GEMINI_MODEL` → llm.model
//! - `GEMINI_BASE_URL` → llm.base_url
//! - `ADVISOR_MAX_SESSIONS` → sessions.max_sessions
//! - `ADVISOR_SESSION_TTL_SECS` → sessions.idle_ttl_secs (accepts "30m", "2h", ...)
//! - `ADVISOR_LOG_LEVEL` → observability.log_level
//! - `ADVISOR_LOG_FORMAT` → observability.log_format

use crate::error::{Error, Result, ResultExt};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Environment variable naming an explicit config file.
pub const CONFIG_PATH_ENV: &str = "ADVISOR_CONFIG";

/// Get the configuration directory path.
pub fn config_dir() -> PathBuf {
    directories::UserDirs::new().map_or_else(
        || PathBuf::from(".mortgage-advisor"),
        |dirs| dirs.home_dir().join(".mortgage-advisor"),
    )
}

/// Get the configuration file path.
pub fn config_path() -> PathBuf {
    std::env::var(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| config_dir().join("config.json"))
}

// ============================================================================
// Network Configuration
// ============================================================================

/// Listen address for the relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Bind address. Default: "0.0.0.0"
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Listen port. Default: 5013
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_port(),
        }
    }
}

fn default_bind_address() -> String {
    "0.0.0.0".into()
}

fn default_port() -> u16 {
    5013
}

// ============================================================================
// Secrets
// ============================================================================

/// Credentials. Never serialized back out when empty.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecretsConfig {
    /// Google Generative Language API key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gemini_api_key: Option<String>,
}

// ============================================================================
// LLM Configuration
// ============================================================================

/// Upstream model configuration shared by every session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Model name, with or without the `models/` prefix
    #[serde(default = "default_model")]
    pub model: String,

    /// API base URL (no trailing slash)
    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default = "default_temperature")]
    pub temperature: f64,

    /// Nucleus sampling threshold
    #[serde(default = "default_top_p")]
    pub top_p: f64,

    #[serde(default = "default_top_k")]
    pub top_k: u32,

    /// Threshold applied to every harm category
    #[serde(default = "default_safety_threshold")]
    pub safety_threshold: String,

    /// Longest silence allowed between two reads of a response stream
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            base_url: default_base_url(),
            temperature: default_temperature(),
            top_p: default_top_p(),
            top_k: default_top_k(),
            safety_threshold: default_safety_threshold(),
            read_timeout_secs: default_read_timeout(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

fn default_model() -> String {
    "gemini-1.5-flash".into()
}

fn default_base_url() -> String {
    "https://generativelanguage.googleapis.com/v1beta".into()
}

fn default_temperature() -> f64 {
    0.7
}

fn default_top_p() -> f64 {
    0.95
}

fn default_top_k() -> u32 {
    40
}

fn default_safety_threshold() -> String {
    "BLOCK_NONE".into()
}

fn default_read_timeout() -> u64 {
    120
}

fn default_connect_timeout() -> u64 {
    10
}

// ============================================================================
// Sessions
// ============================================================================

/// Bounds for the in-memory session registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionsConfig {
    /// Maximum live sessions; the least recently used one is evicted beyond this
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,

    /// Sessions idle longer than this are dropped
    #[serde(default = "default_idle_ttl")]
    pub idle_ttl_secs: u64,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            max_sessions: default_max_sessions(),
            idle_ttl_secs: default_idle_ttl(),
        }
    }
}

fn default_max_sessions() -> usize {
    1024
}

fn default_idle_ttl() -> u64 {
    3600
}

// ============================================================================
// Observability
// ============================================================================

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level", alias = "level")]
    pub log_level: String,

    /// Log format (json, pretty)
    #[serde(default = "default_log_format", alias = "format")]
    pub log_format: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "pretty".into()
}

// ============================================================================
// Root
// ============================================================================

/// Root configuration structure for the relay.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub network: NetworkConfig,

    #[serde(default)]
    pub secrets: SecretsConfig,

    #[serde(default)]
    pub llm: LlmConfig,

    #[serde(default)]
    pub sessions: SessionsConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Config {
    /// Load configuration from the default path, falling back to defaults.
    pub fn load() -> Result<Self> {
        let path = config_path();
        if !path.exists() {
            tracing::debug!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }
        Self::load_from(&path)
    }

    /// Load configuration from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .context(format!("Failed to read config from {}", path.display()))?;

        serde_json::from_str(&content)
            .context(format!("Failed to parse config from {}", path.display()))
    }

    /// Load configuration and apply environment overrides.
    pub fn load_with_env() -> Result<Self> {
        let mut config = Self::load()?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply overrides from the process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary variable lookup.
    ///
    /// Values that fail to parse are ignored and the existing setting is kept.
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup("PORT").and_then(|p| p.trim().parse().ok()) {
            self.network.port = port;
        }
        if let Some(bind) = lookup("ADVISOR_BIND_ADDRESS") {
            self.network.bind = bind;
        }

        if let Some(key) = lookup("GEMINI_API_KEY").or_else(|| lookup("GOOGLE_API_KEY")) {
            if !key.trim().is_empty() {
                self.secrets.gemini_api_key = Some(key);
            }
        }

        if let Some(model) = lookup("GEMINI_MODEL") {
            self.llm.model = model;
        }
        if let Some(base_url) = lookup("GEMINI_BASE_URL") {
            self.llm.base_url = base_url.trim_end_matches('/').to_string();
        }

        if let Some(max) = lookup("ADVISOR_MAX_SESSIONS").and_then(|v| v.trim().parse().ok()) {
            self.sessions.max_sessions = max;
        }
        if let Some(ttl) = lookup("ADVISOR_SESSION_TTL_SECS")
            .and_then(|v| crate::util::parse_duration_secs(&v).ok())
        {
            self.sessions.idle_ttl_secs = ttl;
        }

        if let Some(level) = lookup("ADVISOR_LOG_LEVEL") {
            self.observability.log_level = level;
        }
        if let Some(format) = lookup("ADVISOR_LOG_FORMAT") {
            self.observability.log_format = format;
        }
    }

    /// Return the API credential or fail with a configuration error.
    pub fn require_api_key(&self) -> Result<&str> {
        self.secrets
            .gemini_api_key
            .as_deref()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| Error::Config("GEMINI_API_KEY environment variable not set".into()))
    }

    /// Socket address string for the listener.
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.network.bind, self.network.port)
    }
}
