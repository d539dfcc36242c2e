//! Configuration validation.
//!
//! Checks that required values are present and within valid ranges before
//! the service starts accepting traffic.

use std::net::IpAddr;
use thiserror::Error;

use crate::config::{ChatConfig, Config, LlmConfig, NetworkConfig, ObservabilityConfig};

/// Configuration validation error.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Invalid port {port}: must be between 1 and 65535")]
    InvalidPort { port: u16, field: String },

    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Multiple validation errors: {0:?}")]
    Multiple(Vec<ValidationError>),
}

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Trait for validatable configuration sections.
pub trait Validate {
    /// Validate this configuration section.
    fn validate(&self) -> ValidationResult<()>;
}

impl Config {
    /// Validate the entire configuration.
    pub fn validate(&self) -> ValidationResult<()> {
        let mut errors: Vec<ValidationError> = [
            self.network.validate(),
            self.llm.validate(),
            self.chat.validate(),
            self.observability.validate(),
        ]
        .into_iter()
        .filter_map(Result::err)
        .collect();

        if errors.is_empty() {
            Ok(())
        } else if errors.len() == 1 {
            Err(errors.remove(0))
        } else {
            Err(ValidationError::Multiple(errors))
        }
    }

    /// Load, apply environment overrides and validate.
    pub fn load_and_validate() -> anyhow::Result<Self> {
        let config = Self::load_with_env()?;
        config.validate().map_err(|e| anyhow::anyhow!("{}", e))?;
        Ok(config)
    }
}

impl Validate for NetworkConfig {
    fn validate(&self) -> ValidationResult<()> {
        if self.port == 0 {
            return Err(ValidationError::InvalidPort {
                port: self.port,
                field: "network.port".into(),
            });
        }

        if self.bind.parse::<IpAddr>().is_err() {
            return Err(ValidationError::InvalidValue {
                field: "network.bind".into(),
                reason: format!("not an IP address: {}", self.bind),
            });
        }

        Ok(())
    }
}

impl Validate for LlmConfig {
    fn validate(&self) -> ValidationResult<()> {
        if self.model.trim().is_empty() {
            return Err(ValidationError::MissingField {
                field: "llm.model".into(),
            });
        }

        if self.api_key.as_deref().map_or(true, |k| k.trim().is_empty()) {
            return Err(ValidationError::MissingField {
                field: "llm.api_key (set GEMINI_API_KEY)".into(),
            });
        }

        if self.timeout_secs == 0 {
            return Err(ValidationError::InvalidValue {
                field: "llm.timeout_secs".into(),
                reason: "must be greater than 0".into(),
            });
        }

        if let Some(t) = self.temperature {
            if !(0.0..=2.0).contains(&t) {
                return Err(ValidationError::InvalidValue {
                    field: "llm.temperature".into(),
                    reason: "must be between 0.0 and 2.0".into(),
                });
            }
        }

        if self.base_backoff_ms > self.max_backoff_ms {
            return Err(ValidationError::InvalidValue {
                field: "llm.base_backoff_ms".into(),
                reason: "must not exceed llm.max_backoff_ms".into(),
            });
        }

        Ok(())
    }
}

impl Validate for ChatConfig {
    fn validate(&self) -> ValidationResult<()> {
        if self.opening_utterance.trim().is_empty() {
            return Err(ValidationError::MissingField {
                field: "chat.opening_utterance".into(),
            });
        }

        Ok(())
    }
}

impl Validate for ObservabilityConfig {
    fn validate(&self) -> ValidationResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.to_lowercase().as_str()) {
            return Err(ValidationError::InvalidValue {
                field: "observability.log_level".into(),
                reason: format!("must be one of: {}", valid_levels.join(", ")),
            });
        }

        let valid_formats = ["json", "pretty"];
        if !valid_formats.contains(&self.log_format.to_lowercase().as_str()) {
            return Err(ValidationError::InvalidValue {
                field: "observability.log_format".into(),
                reason: format!("must be one of: {}", valid_formats.join(", ")),
            });
        }

        Ok(())
    }
}
