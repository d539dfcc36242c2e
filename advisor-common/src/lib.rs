//! Advisor Common - Shared configuration, validation and logging.
//!
//! This crate provides:
//! - Configuration types and loading
//! - Configuration validation
//! - Logging setup and request span helpers

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod config;
pub mod logging;
pub mod validation;

pub use config::{ChatConfig, Config, LlmConfig, NetworkConfig, ObservabilityConfig};
pub use validation::{Validate, ValidationError, ValidationResult};
