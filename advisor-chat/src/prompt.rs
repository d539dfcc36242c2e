//! System instruction loading.
//!
//! The instruction is plain text data. Parts are separated by lines holding
//! only `---` and are sent to the model as separate instruction parts.

use anyhow::{Context, Result};
use std::path::Path;

/// Built-in advisor instruction.
const BUILTIN_INSTRUCTION: &str = include_str!("../prompts/insurance_advisor.txt");

/// Ordered parts of the system instruction sent with every model call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemInstruction {
    parts: Vec<String>,
}

impl SystemInstruction {
    /// Parse instruction text into parts.
    pub fn parse(text: &str) -> Result<Self> {
        let mut parts = Vec::new();
        let mut current = Vec::new();

        for line in text.lines() {
            if line.trim_end() == "---" {
                push_part(&mut parts, &mut current);
            } else {
                current.push(line);
            }
        }
        push_part(&mut parts, &mut current);

        if parts.is_empty() {
            anyhow::bail!("system instruction has no content");
        }
        Ok(Self { parts })
    }

    /// The compiled-in insurance advisor instruction.
    pub fn builtin() -> Self {
        // The bundled file is non-empty, so parsing cannot fail.
        Self::parse(BUILTIN_INSTRUCTION).unwrap_or_else(|_| Self {
            parts: vec![BUILTIN_INSTRUCTION.to_string()],
        })
    }

    /// Load from a file.
    pub fn load_from(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read system instruction from {}", path.display()))?;
        Self::parse(&text)
            .with_context(|| format!("Invalid system instruction in {}", path.display()))
    }

    /// Load from `path` if given, otherwise use the built-in instruction.
    pub fn resolve(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load_from(path),
            None => Ok(Self::builtin()),
        }
    }

    pub fn parts(&self) -> &[String] {
        &self.parts
    }
}

fn push_part(parts: &mut Vec<String>, current: &mut Vec<&str>) {
    let part = current.join("\n").trim().to_string();
    if !part.is_empty() {
        parts.push(part);
    }
    current.clear();
}
