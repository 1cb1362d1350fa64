//! Provider gateways for chat completions and embeddings.
//!
//! Everything above this module sees only the [`ChatGateway`] and
//! [`EmbeddingGateway`] contracts; retries, pacing, and usage recording live
//! here, transports live in [`openai`].

pub mod error;
pub mod openai;
pub mod types;
pub mod usage;

use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;

use openai::{ChatProvider, EmbedProvider, OpenAiCompatAdapter};
use usage::{CallStatus, ProviderCallRecord, UsageSink as UsageSinkTrait};

pub use error::{ErrorContext, ProviderError, RateLimitSource};
pub use types::*;
pub use usage::{NoopUsageSink, UsageSink};

/// Chat capability consumed by the engine. One implementation wraps the HTTP
/// adapter; tests substitute scripted gateways.
#[async_trait::async_trait]
pub trait ChatGateway: Send + Sync {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError>;
}

/// Embedding capability consumed by recall, the vector indexes, and the
/// novelty checker.
#[async_trait::async_trait]
pub trait EmbeddingGateway: Send + Sync {
    /// Embed a batch of texts. Dimension is fixed per model; inputs are
    /// truncated at 2000 chars by the transport.
    async fn embed(&self, req: EmbedRequest) -> Result<EmbedResponse, ProviderError>;

    /// Identifier used to key persisted index directories.
    fn model_profile(&self) -> String;
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    /// Fixed sleep on rate limits from the embedding endpoint.
    pub embed_sleep: Duration,
    pub embed_max_retries: u32,
    /// Maximum texts per embedding request; larger batches are split.
    pub embed_batch_size: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            retry_base_delay: Duration::from_secs(1),
            embed_sleep: Duration::from_secs(2),
            embed_max_retries: 3,
            embed_batch_size: 16,
        }
    }
}

/// Retrying gateway over an OpenAI-compatible adapter, recording every call
/// through a [`UsageSink`].
pub struct ProviderGateway {
    adapter: OpenAiCompatAdapter,
    embed_model: String,
    usage_sink: Arc<dyn UsageSinkTrait>,
    config: GatewayConfig,
}

#[async_trait::async_trait]
impl ChatGateway for ProviderGateway {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
        ProviderGateway::chat(self, req).await
    }
}

#[async_trait::async_trait]
impl EmbeddingGateway for ProviderGateway {
    async fn embed(&self, req: EmbedRequest) -> Result<EmbedResponse, ProviderError> {
        ProviderGateway::embed(self, req).await
    }

    fn model_profile(&self) -> String {
        self.embed_model.replace('/', "-")
    }
}

impl ProviderGateway {
    pub fn from_env(
        embed_model: impl Into<String>,
        usage_sink: Arc<dyn UsageSinkTrait>,
    ) -> Result<Self, ProviderError> {
        let adapter = OpenAiCompatAdapter::from_env()?;
        Ok(Self {
            adapter,
            embed_model: embed_model.into(),
            usage_sink,
            config: GatewayConfig::default(),
        })
    }

    pub fn with_config(
        adapter: OpenAiCompatAdapter,
        embed_model: impl Into<String>,
        usage_sink: Arc<dyn UsageSinkTrait>,
        config: GatewayConfig,
    ) -> Self {
        Self {
            adapter,
            embed_model: embed_model.into(),
            usage_sink,
            config,
        }
    }

    pub async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
        let mut last_error: Option<ProviderError> = None;

        for attempt in 0..=self.config.max_retries {
            let result = self.adapter.chat(&req).await;
            match result {
                Ok(resp) => {
                    self.record_chat(&req, &resp, CallStatus::Success, None).await;
                    return Ok(resp);
                }
                Err(err) => {
                    let code = err.code().to_string();
                    self.record_chat(&req, &ChatResponse::empty(), CallStatus::Error, Some(code))
                        .await;

                    if !err.is_retryable() || attempt == self.config.max_retries {
                        return Err(err);
                    }

                    let delay = backoff_delay(self.config.retry_base_delay, attempt);
                    last_error = Some(err);
                    sleep(delay).await;
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| ProviderError::provider("openai_compat", "unknown error", false)))
    }

    /// Embed with batch splitting and rate-limit pacing: 429s sleep a fixed
    /// interval and retry up to `embed_max_retries`; other retryable errors
    /// back off exponentially under the same attempt budget.
    pub async fn embed(&self, req: EmbedRequest) -> Result<EmbedResponse, ProviderError> {
        let mut all = Vec::with_capacity(req.texts.len());
        let mut tokens = 0u32;
        let mut latency = Duration::from_millis(0);

        for batch in req.texts.chunks(self.config.embed_batch_size.max(1)) {
            let batch_req = EmbedRequest::new(
                self.embed_model.clone(),
                batch.to_vec(),
                req.attribution.clone(),
            );
            let resp = self.embed_batch(&batch_req).await?;
            tokens = tokens.saturating_add(resp.tokens);
            latency += resp.latency;
            all.extend(resp.embeddings);
        }

        Ok(EmbedResponse {
            embeddings: all,
            tokens,
            latency,
        })
    }

    async fn embed_batch(&self, req: &EmbedRequest) -> Result<EmbedResponse, ProviderError> {
        let mut last_error: Option<ProviderError> = None;

        for attempt in 0..=self.config.embed_max_retries {
            match self.adapter.embed(req).await {
                Ok(resp) => {
                    self.record_embed(req, Some(&resp), None).await;
                    return Ok(resp);
                }
                Err(err) => {
                    self.record_embed(req, None, Some(err.code().to_string())).await;

                    if !err.is_retryable() || attempt == self.config.embed_max_retries {
                        return Err(err);
                    }

                    let delay = if err.is_rate_limit() {
                        self.config.embed_sleep
                    } else {
                        backoff_delay(self.config.retry_base_delay, attempt)
                    };
                    last_error = Some(err);
                    sleep(delay).await;
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| ProviderError::provider("openai_compat", "unknown error", false)))
    }

    async fn record_chat(
        &self,
        req: &ChatRequest,
        resp: &ChatResponse,
        status: CallStatus,
        error_code: Option<String>,
    ) {
        let record = ProviderCallRecord::new(
            "openai_compat",
            "chat/completions",
            req.model.clone(),
            req.attribution.caller,
        )
        .tokens(resp.input_tokens as i32, resp.output_tokens as i32)
        .run(req.attribution.run_id.clone())
        .latency(resp.latency.as_millis() as i32);

        let record = if status == CallStatus::Error {
            record.error(error_code.unwrap_or_else(|| "provider_error".to_string()))
        } else {
            record
        };

        self.usage_sink.record(record).await;
    }

    async fn record_embed(
        &self,
        req: &EmbedRequest,
        resp: Option<&EmbedResponse>,
        error_code: Option<String>,
    ) {
        let mut record = ProviderCallRecord::new(
            "openai_compat",
            "embeddings",
            req.model.clone(),
            req.attribution.caller,
        )
        .run(req.attribution.run_id.clone());

        if let Some(resp) = resp {
            record = record
                .tokens(resp.tokens as i32, 0)
                .latency(resp.latency.as_millis() as i32);
        }
        if let Some(code) = error_code {
            record = record.error(code);
        }

        self.usage_sink.record(record).await;
    }
}

fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let multiplier = 2u64.pow(attempt.min(5));
    base * multiplier as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_saturates() {
        let base = Duration::from_secs(1);
        assert_eq!(backoff_delay(base, 0), Duration::from_secs(1));
        assert_eq!(backoff_delay(base, 1), Duration::from_secs(2));
        assert_eq!(backoff_delay(base, 3), Duration::from_secs(8));
        assert_eq!(backoff_delay(base, 9), Duration::from_secs(32));
    }
}
