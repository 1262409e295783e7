//! Embedding client.
//!
//! Wraps one or more OpenAI-compatible `/embeddings` endpoints behind a
//! single `embed` operation. Endpoints are tried in configured order; the
//! first success wins. Connection problems, timeouts and malformed answers
//! fall through to the next endpoint, while a well-formed API rejection is
//! fatal for the whole call.

use std::sync::Arc;
use std::time::Duration;

use async_openai::{config::OpenAIConfig, types::CreateEmbeddingRequestArgs, Client};
use async_trait::async_trait;

use crate::config::EmbeddingConfig;
use crate::error::{Error, Result};

/// Inputs longer than this are truncated before the request is sent.
const MAX_INPUT_CHARS: usize = 8_000;

/// One embedding endpoint's failure, classified for the fallback loop.
#[derive(Debug)]
pub enum BackendError {
    /// Worth trying the next endpoint: connect error, timeout, 5xx,
    /// unparseable response.
    Transient(String),
    /// The request itself was rejected; no endpoint can succeed.
    Fatal(String),
}

/// A single embeddings-capable backend.
#[async_trait]
pub trait EmbeddingsService: Send + Sync + 'static {
    /// Identifier used in logs when this backend fails over.
    fn name(&self) -> &str;

    async fn create_embedding(
        &self,
        model: &str,
        input: &str,
    ) -> std::result::Result<Vec<f32>, BackendError>;
}

/// Client that fans over an ordered list of backends.
#[derive(Clone)]
pub struct EmbeddingsClient {
    model: String,
    dimension: usize,
    timeout: Duration,
    services: Vec<Arc<dyn EmbeddingsService>>,
}

impl EmbeddingsClient {
    pub fn new(
        model: impl Into<String>,
        dimension: usize,
        timeout: Duration,
        services: Vec<Arc<dyn EmbeddingsService>>,
    ) -> Self {
        Self {
            model: model.into(),
            dimension,
            timeout,
            services,
        }
    }

    /// Build a client from configuration, one OpenAI-compatible backend per
    /// configured endpoint.
    pub fn from_config(config: &EmbeddingConfig) -> Self {
        let services = config
            .endpoints
            .iter()
            .map(|endpoint| {
                Arc::new(OpenAiEmbeddings::new(endpoint.as_str())) as Arc<dyn EmbeddingsService>
            })
            .collect();
        Self::new(
            &config.model,
            config.dimension,
            Duration::from_secs(config.timeout_secs),
            services,
        )
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Embed a single input, trying endpoints in order.
    pub async fn embed(&self, input: &str) -> Result<Vec<f32>> {
        let input = truncate_input(input);
        if input.is_empty() {
            return Err(Error::InvalidRequest("cannot embed empty text".into()));
        }

        let mut last_error = String::from("no embedding endpoints configured");
        for service in &self.services {
            let attempt = tokio::time::timeout(
                self.timeout,
                service.create_embedding(&self.model, &input),
            )
            .await;

            match attempt {
                Ok(Ok(vector)) => {
                    if vector.len() != self.dimension {
                        tracing::warn!(
                            backend = service.name(),
                            expected = self.dimension,
                            got = vector.len(),
                            "embedding dimension mismatch, trying next endpoint"
                        );
                        last_error = format!(
                            "{}: dimension mismatch (expected {}, got {})",
                            service.name(),
                            self.dimension,
                            vector.len()
                        );
                        continue;
                    }
                    return Ok(vector);
                }
                Ok(Err(BackendError::Fatal(message))) => {
                    return Err(Error::EmbeddingUnavailable(format!(
                        "{}: {}",
                        service.name(),
                        message
                    )));
                }
                Ok(Err(BackendError::Transient(message))) => {
                    tracing::warn!(
                        backend = service.name(),
                        error = %message,
                        "embedding endpoint failed, trying next"
                    );
                    last_error = format!("{}: {}", service.name(), message);
                }
                Err(_) => {
                    tracing::warn!(
                        backend = service.name(),
                        timeout_secs = self.timeout.as_secs(),
                        "embedding endpoint timed out, trying next"
                    );
                    last_error = format!("{}: timed out", service.name());
                }
            }
        }

        Err(Error::EmbeddingUnavailable(last_error))
    }
}

fn truncate_input(input: &str) -> &str {
    match input.char_indices().nth(MAX_INPUT_CHARS) {
        Some((idx, _)) => &input[..idx],
        None => input,
    }
}

/// Backend speaking the OpenAI embeddings API against a self-hosted endpoint.
pub struct OpenAiEmbeddings {
    endpoint: String,
    client: Client<OpenAIConfig>,
}

impl OpenAiEmbeddings {
    pub fn new(endpoint: impl Into<String>) -> Self {
        let endpoint = endpoint.into();
        let config = OpenAIConfig::new()
            .with_api_base(&endpoint)
            .with_api_key("not-needed");
        Self {
            endpoint,
            client: Client::with_config(config),
        }
    }
}

#[async_trait]
impl EmbeddingsService for OpenAiEmbeddings {
    fn name(&self) -> &str {
        &self.endpoint
    }

    async fn create_embedding(
        &self,
        model: &str,
        input: &str,
    ) -> std::result::Result<Vec<f32>, BackendError> {
        let request = CreateEmbeddingRequestArgs::default()
            .model(model)
            .input(input)
            .build()
            .map_err(|e| BackendError::Fatal(format!("bad embedding request: {}", e)))?;

        let response = self
            .client
            .embeddings()
            .create(request)
            .await
            .map_err(|e| match e {
                // A parsed API error body means the service understood the
                // request and rejected it; everything else (connect errors,
                // timeouts, 5xx HTML pages) is worth a fallback attempt.
                async_openai::error::OpenAIError::ApiError(api) => {
                    BackendError::Fatal(api.message)
                }
                other => BackendError::Transient(other.to_string()),
            })?;

        response
            .data
            .into_iter()
            .next()
            .map(|item| item.embedding)
            .ok_or_else(|| BackendError::Transient("empty embeddings response".into()))
    }
}
