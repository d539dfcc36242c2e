//! Google Gemini streaming provider.
//!
//! Calls `models/{model}:streamGenerateContent?alt=sse` and turns each SSE
//! `data:` payload into a [`Fragment`].

use super::{classify_failure, ChatModel, FragmentStream, ModelRequest, ProviderError, ProviderErrorKind};
use crate::fragment::Fragment;
use crate::session::Role;
use async_trait::async_trait;
use eventsource_stream::{EventStreamError, Eventsource};
use futures_util::{future, Stream, StreamExt, TryStreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const PROVIDER: &str = "gemini";

/// Gemini provider authenticated with an API key.
pub struct GeminiProvider {
    api_key: String,
    base_url: String,
    client: Client,
}

// ══════════════════════════════════════════════════════════════════════════════
// API REQUEST/RESPONSE TYPES
// ══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest {
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'static str>,
    parts: Vec<Part>,
}

#[derive(Debug, Serialize)]
struct Part {
    text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    response_mime_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ApiError,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    code: Option<u16>,
    #[serde(default)]
    message: String,
    #[serde(default)]
    status: Option<String>,
}

impl GeminiProvider {
    /// Create a provider against `base_url`, e.g.
    /// `https://generativelanguage.googleapis.com`.
    pub fn new(api_key: impl Into<String>, base_url: impl Into<String>) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| {
                ProviderError::new(
                    PROVIDER,
                    "",
                    ProviderErrorKind::Transport,
                    format!("Failed to build HTTP client: {e}"),
                )
            })?;

        Ok(Self {
            api_key: api_key.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    fn endpoint(&self, model: &str) -> String {
        let model_name = if model.starts_with("models/") {
            model.to_string()
        } else {
            format!("models/{model}")
        };
        format!(
            "{}/v1beta/{model_name}:streamGenerateContent?alt=sse",
            self.base_url
        )
    }

    fn build_body(request: &ModelRequest) -> GenerateContentRequest {
        let system_instruction = if request.system_instruction.is_empty() {
            None
        } else {
            Some(Content {
                role: None,
                parts: request
                    .system_instruction
                    .iter()
                    .map(|text| Part { text: text.clone() })
                    .collect(),
            })
        };

        let contents = request
            .contents()
            .into_iter()
            .map(|turn| Content {
                role: Some(match turn.role {
                    Role::User => "user",
                    Role::Assistant => "model",
                }),
                parts: vec![Part { text: turn.text }],
            })
            .collect();

        GenerateContentRequest {
            contents,
            system_instruction,
            generation_config: GenerationConfig {
                response_mime_type: "text/plain",
                temperature: request.temperature,
            },
        }
    }
}

/// Turn an API error object into a provider error.
fn api_error(model: &str, status: Option<u16>, err: ApiError) -> ProviderError {
    let status = status.or(err.code);
    let detail = match err.status {
        Some(s) => format!("{s}: {}", err.message),
        None => err.message,
    };
    let mut error = ProviderError::new(PROVIDER, model, classify_failure(status, &detail), detail);
    error.status_code = status;
    error
}

fn transport_error(model: &str, e: &reqwest::Error) -> ProviderError {
    let kind = if e.is_timeout() {
        ProviderErrorKind::Timeout
    } else {
        ProviderErrorKind::Transport
    };
    ProviderError::new(PROVIDER, model, kind, format!("Request failed: {e}"))
}

/// Decode one SSE payload. An `error` object becomes a stream error.
fn decode_payload(model: &str, payload: &str) -> Result<Fragment, ProviderError> {
    if let Ok(envelope) = serde_json::from_str::<ErrorEnvelope>(payload) {
        return Err(api_error(model, None, envelope.error));
    }
    Ok(Fragment::from_payload(payload))
}

// ══════════════════════════════════════════════════════════════════════════════
// SSE STREAM
// ══════════════════════════════════════════════════════════════════════════════

fn stream_error(model: &str, err: EventStreamError<ProviderError>) -> ProviderError {
    match err {
        EventStreamError::Transport(e) => e,
        other => ProviderError::new(
            PROVIDER,
            model,
            ProviderErrorKind::Transport,
            format!("Malformed event stream: {other}"),
        ),
    }
}

/// Decode an SSE byte stream into fragments. The stream ends after the first
/// error it yields.
fn fragment_stream<S, B>(bytes: S, model: String) -> FragmentStream
where
    S: Stream<Item = Result<B, ProviderError>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
{
    bytes
        .eventsource()
        .scan(false, move |failed, item| {
            if *failed {
                return future::ready(None);
            }
            let fragment = match item {
                Ok(event) => decode_payload(&model, &event.data),
                Err(e) => Err(stream_error(&model, e)),
            };
            *failed = fragment.is_err();
            future::ready(Some(fragment))
        })
        .boxed()
}

#[async_trait]
impl ChatModel for GeminiProvider {
    fn name(&self) -> &str {
        PROVIDER
    }

    async fn stream_reply(&self, request: ModelRequest) -> Result<FragmentStream, ProviderError> {
        let body = Self::build_body(&request);
        let url = self.endpoint(&request.model);

        tracing::debug!(
            model = %request.model,
            contents = body.contents.len(),
            "Opening Gemini reply stream"
        );

        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error(&request.model, &e))?;

        let status = response.status();
        if !status.is_success() {
            let code = status.as_u16();
            let error_text = response.text().await.unwrap_or_default();
            return Err(match serde_json::from_str::<ErrorEnvelope>(&error_text) {
                Ok(envelope) => api_error(&request.model, Some(code), envelope.error),
                Err(_) => ProviderError::new(
                    PROVIDER,
                    request.model.as_str(),
                    classify_failure(Some(code), &error_text),
                    format!("API error ({code}): {error_text}"),
                )
                .with_status(code),
            });
        }

        let model = request.model;
        let bytes = {
            let model = model.clone();
            response
                .bytes_stream()
                .map_err(move |e| transport_error(&model, &e))
        };
        Ok(fragment_stream(bytes, model))
    }
}
