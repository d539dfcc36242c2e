//! Configuration management for the advisor services.
//!
//! The chat service reads an optional JSON file at `~/.advisor/config.json`.
//!
//! # Configuration Priority
//!
//! 1. Environment variables (credential and listen port only)
//! 2. Explicit config file values
//! 3. Default values
//!
//! # Environment Variable Mapping
//!
//! - `GEMINI_API_KEY` → llm.api_key
//! - `GOOGLE_API_KEY` → llm.api_key (when `GEMINI_API_KEY` is unset)
//! - `PORT` → network.port

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};

/// Get the configuration directory path.
pub fn config_dir() -> PathBuf {
    directories::UserDirs::new().map_or_else(
        || PathBuf::from(".advisor"),
        |dirs| dirs.home_dir().join(".advisor"),
    )
}

/// Get the configuration file path.
pub fn config_path() -> PathBuf {
    config_dir().join("config.json")
}

// ============================================================================
// Network Configuration
// ============================================================================

/// Listen address for the HTTP service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Bind address.
    /// Default: "127.0.0.1" (local only, the browser dev server proxies to it)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Listen port. Overridden by `PORT`.
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
    "127.0.0.1".into()
}

fn default_port() -> u16 {
    5000
}

// ============================================================================
// LLM Configuration
// ============================================================================

/// Settings for the hosted generative model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Model identifier, e.g. "gemini-2.0-flash"
    #[serde(default = "default_llm_model")]
    pub model: String,

    /// API credential. Usually supplied through `GEMINI_API_KEY`.
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,

    /// API base URL (no trailing path)
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,

    /// Sampling temperature; the model default is used when unset
    #[serde(default)]
    pub temperature: Option<f64>,

    /// Upper bound on one model call, from request to the last streamed fragment
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,

    /// Retries for opening the reply stream before giving up
    #[serde(default = "default_llm_retries")]
    pub max_retries: u32,

    /// Base backoff delay in milliseconds (doubles with each retry)
    #[serde(default = "default_llm_base_backoff_ms")]
    pub base_backoff_ms: u64,

    /// Maximum backoff delay in milliseconds
    #[serde(default = "default_llm_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: default_llm_model(),
            api_key: None,
            base_url: default_llm_base_url(),
            temperature: None,
            timeout_secs: default_llm_timeout(),
            max_retries: default_llm_retries(),
            base_backoff_ms: default_llm_base_backoff_ms(),
            max_backoff_ms: default_llm_max_backoff_ms(),
        }
    }
}

fn default_llm_model() -> String {
    "gemini-2.0-flash".into()
}

fn default_llm_base_url() -> String {
    "https://generativelanguage.googleapis.com".into()
}

fn default_llm_timeout() -> u64 {
    60
}

fn default_llm_retries() -> u32 {
    2
}

fn default_llm_base_backoff_ms() -> u64 {
    250
}

fn default_llm_max_backoff_ms() -> u64 {
    4_000
}

// ============================================================================
// Chat Configuration
// ============================================================================

/// Conversation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    /// File holding the system instruction. Parts are separated by lines
    /// containing only `---`. The built-in advisor instruction is used when unset.
    #[serde(default)]
    pub instruction_path: Option<PathBuf>,

    /// Synthetic first user message sent when a client opens a conversation
    /// without saying anything yet. Recorded in history, never typed by the user.
    #[serde(default = "default_opening_utterance")]
    pub opening_utterance: String,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            instruction_path: None,
            opening_utterance: default_opening_utterance(),
        }
    }
}

fn default_opening_utterance() -> String {
    "Hello".into()
}

// ============================================================================
// Observability Configuration
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

    /// Additional module targets to hold at `warn`.
    #[serde(default)]
    pub excluded_targets: Vec<String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
            excluded_targets: Vec::new(),
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

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub network: NetworkConfig,

    #[serde(default)]
    pub llm: LlmConfig,

    #[serde(default)]
    pub chat: ChatConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Config {
    /// Load configuration from the default path.
    pub fn load() -> Result<Self> {
        let path = config_path();
        if !path.exists() {
            tracing::info!("Config file not found, using defaults");
            return Ok(Self::default());
        }

        Self::load_from(&path)
    }

    /// Load configuration from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))
    }

    /// Load configuration with environment variable overrides applied.
    pub fn load_with_env() -> Result<Self> {
        let mut config = Self::load()?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|name| std::env::var(name).ok());
    }

    /// Apply overrides from an arbitrary variable source.
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(key) = lookup("GEMINI_API_KEY").or_else(|| lookup("GOOGLE_API_KEY")) {
            if !key.trim().is_empty() {
                self.llm.api_key = Some(key);
            }
        }

        if let Some(port) = lookup("PORT") {
            match port.trim().parse() {
                Ok(p) => self.network.port = p,
                Err(_) => tracing::warn!(value = %port, "Ignoring unparseable PORT override"),
            }
        }
    }

    /// Socket address the HTTP listener binds to.
    pub fn listen_address(&self) -> Result<SocketAddr> {
        let ip: IpAddr = self
            .network
            .bind
            .parse()
            .with_context(|| format!("Invalid bind address: {}", self.network.bind))?;
        Ok(SocketAddr::new(ip, self.network.port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.network.port, 5000);
        assert_eq!(config.network.bind, "127.0.0.1");
        assert_eq!(config.llm.model, "gemini-2.0-flash");
        assert_eq!(config.llm.timeout_secs, 60);
        assert!(config.llm.api_key.is_none());
        assert_eq!(config.chat.opening_utterance, "Hello");
        assert_eq!(config.listen_address().unwrap().to_string(), "127.0.0.1:5000");
    }

    #[test]
    fn test_listen_address_accepts_ipv6_and_rejects_hostnames() {
        let mut config = Config::default();
        config.network.bind = "::1".to_string();
        config.network.port = 8080;
        assert_eq!(config.listen_address().unwrap().to_string(), "[::1]:8080");

        config.network.bind = "localhost".to_string();
        let err = config.listen_address().unwrap_err();
        assert!(err.to_string().contains("Invalid bind address"));
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let parsed: Config =
            serde_json::from_str(r#"{"llm": {"model": "gemini-1.5-pro"}, "network": {"port": 8080}}"#)
                .unwrap();
        assert_eq!(parsed.llm.model, "gemini-1.5-pro");
        assert_eq!(parsed.llm.max_retries, 2);
        assert_eq!(parsed.network.port, 8080);
        assert_eq!(parsed.network.bind, "127.0.0.1");
        assert_eq!(parsed.observability.log_format, "pretty");
    }

    #[test]
    fn test_api_key_is_not_written_back() {
        let mut config = Config::default();
        config.llm.api_key = Some("secret".into());
        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("secret"));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config.apply_overrides_from(lookup(&[("GEMINI_API_KEY", "g-key"), ("PORT", "7001")]));
        assert_eq!(config.llm.api_key.as_deref(), Some("g-key"));
        assert_eq!(config.network.port, 7001);
    }

    #[test]
    fn test_google_key_fallback() {
        let mut config = Config::default();
        config.apply_overrides_from(lookup(&[("GOOGLE_API_KEY", "google-key")]));
        assert_eq!(config.llm.api_key.as_deref(), Some("google-key"));
    }

    #[test]
    fn test_bad_port_override_is_ignored() {
        let mut config = Config::default();
        config.apply_overrides_from(lookup(&[("PORT", "not-a-port")]));
        assert_eq!(config.network.port, 5000);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r#"{"chat": {"opening_utterance": "Hi there"}, "observability": {"format": "json"}}"#,
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.chat.opening_utterance, "Hi there");
        assert_eq!(config.observability.log_format, "json");
    }

    #[test]
    fn test_load_from_malformed_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{not json").unwrap();

        let err = Config::load_from(&path).unwrap_err();
        assert!(err.to_string().contains("Failed to parse config"));
    }
}
