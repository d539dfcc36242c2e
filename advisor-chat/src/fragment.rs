//! Streamed reply fragments.
//!
//! A model reply arrives as a sequence of JSON chunks. Each chunk is decoded
//! into one of a closed set of shapes, and text is extracted from them in a
//! fixed order: a top-level `text` field first, then the nested
//! `candidates[0].content.parts[*].text` path.

use serde::Deserialize;
use serde_json::Value;

/// One incremental piece of a streamed model reply.
#[derive(Debug, Clone, PartialEq)]
pub enum Fragment {
    /// Text carried directly in a top-level `text` field.
    Plain(String),
    /// Text nested inside response candidates.
    Candidates(Vec<Candidate>),
    /// Accounting-only chunk (usage metadata, no candidates). Carries no text.
    Metadata,
    /// Anything else, kept for logging.
    Unrecognized(Value),
}

/// A response candidate as it appears in a streamed chunk.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct Candidate {
    #[serde(default)]
    pub content: Option<CandidateContent>,
    #[serde(rename = "finishReason", default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct CandidateContent {
    #[serde(default)]
    pub parts: Vec<ContentPart>,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct ContentPart {
    #[serde(default)]
    pub text: Option<String>,
}

impl Fragment {
    /// Classify a decoded chunk.
    pub fn from_value(value: Value) -> Self {
        if let Some(text) = value.get("text").and_then(Value::as_str) {
            return Self::Plain(text.to_string());
        }

        if let Some(candidates) = value.get("candidates") {
            return match Vec::<Candidate>::deserialize(candidates) {
                Ok(candidates) => Self::Candidates(candidates),
                Err(_) => Self::Unrecognized(value),
            };
        }

        if value.get("usageMetadata").is_some() {
            return Self::Metadata;
        }

        Self::Unrecognized(value)
    }

    /// Classify a raw payload string. Payloads that are not JSON are kept as
    /// an unrecognized string value.
    pub fn from_payload(payload: &str) -> Self {
        match serde_json::from_str::<Value>(payload) {
            Ok(value) => Self::from_value(value),
            Err(_) => Self::Unrecognized(Value::String(payload.to_string())),
        }
    }

    /// Text contributed by this fragment, or `None` when no known shape
    /// yields any.
    ///
    /// A candidate that only reports a finish reason contributes `""`.
    pub fn text(&self) -> Option<String> {
        match self {
            Self::Plain(text) => Some(text.clone()),
            Self::Candidates(candidates) => {
                let first = candidates.first()?;
                let texts: Vec<&str> = first
                    .content
                    .iter()
                    .flat_map(|c| c.parts.iter())
                    .filter_map(|p| p.text.as_deref())
                    .collect();

                if !texts.is_empty() {
                    Some(texts.concat())
                } else if first.finish_reason.is_some() {
                    Some(String::new())
                } else {
                    None
                }
            }
            Self::Metadata => Some(String::new()),
            Self::Unrecognized(_) => None,
        }
    }
}
