//! Retry wrapper for opening reply streams.
//!
//! Only the call that opens a stream is retried. Once fragments have started
//! flowing a failure is final, since part of the reply has already been
//! consumed.

use super::{ChatModel, FragmentStream, ModelRequest, ProviderError};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retries after the first attempt.
    pub max_retries: u32,
    /// Base backoff delay in milliseconds (doubles with each retry).
    pub base_backoff_ms: u64,
    /// Maximum backoff delay in milliseconds.
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_backoff_ms: 250,
            max_backoff_ms: 4_000,
        }
    }
}

impl From<&advisor_common::LlmConfig> for RetryConfig {
    fn from(llm: &advisor_common::LlmConfig) -> Self {
        Self {
            max_retries: llm.max_retries,
            base_backoff_ms: llm.base_backoff_ms,
            max_backoff_ms: llm.max_backoff_ms,
        }
    }
}

/// A model that retries retryable failures with exponential backoff.
pub struct RetryingModel {
    inner: Arc<dyn ChatModel>,
    config: RetryConfig,
}

impl RetryingModel {
    pub fn new(inner: Arc<dyn ChatModel>, config: RetryConfig) -> Self {
        Self { inner, config }
    }

    /// Calculate backoff delay for a given attempt.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let delay_ms = self
            .config
            .base_backoff_ms
            .saturating_mul(2_u64.saturating_pow(attempt))
            .min(self.config.max_backoff_ms);
        Duration::from_millis(delay_ms)
    }
}

#[async_trait]
impl ChatModel for RetryingModel {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn stream_reply(&self, request: ModelRequest) -> Result<FragmentStream, ProviderError> {
        let provider_name = self.inner.name();
        let mut attempt = 0;

        loop {
            match self.inner.stream_reply(request.clone()).await {
                Ok(stream) => {
                    if attempt > 0 {
                        tracing::info!(
                            provider = provider_name,
                            attempt = attempt + 1,
                            "Provider recovered after retries"
                        );
                    }
                    return Ok(stream);
                }
                Err(e) if e.is_retryable() && attempt < self.config.max_retries => {
                    let delay = self.backoff_delay(attempt);
                    tracing::warn!(
                        provider = provider_name,
                        attempt = attempt + 1,
                        max_retries = self.config.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Provider call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
