//! Embedding providers.
//!
//! The ranker only sees [`EmbeddingProvider`]; [`OllamaEmbedder`] is the HTTP
//! implementation used in production.

use std::time::Duration;

use async_trait::async_trait;
use reportflow_shared::{EmbeddingsConfig, ReportflowError, Result};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

/// User-Agent string for embedding requests.
const USER_AGENT: &str = concat!("reportflow/", env!("CARGO_PKG_VERSION"));

/// First retry delay; doubles per attempt.
const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(2);

/// Upper bound on a single retry delay.
const MAX_DELAY: Duration = Duration::from_secs(10);

/// Turns text into fixed-length vectors.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed each text. The output has one vector per input, in order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Length of every vector this provider returns.
    fn dimension(&self) -> usize;
}

// ---------------------------------------------------------------------------
// OllamaEmbedder
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

/// Failure of one HTTP attempt.
enum AttemptError {
    /// Worth retrying: rate limits, 5xx gateways, connect failures, timeouts.
    Transient(ReportflowError),
    Permanent(ReportflowError),
}

/// Calls `POST {base_url}/api/embed` on an Ollama server.
pub struct OllamaEmbedder {
    client: Client,
    endpoint: Url,
    model: String,
    dimension: usize,
    max_attempts: u32,
    base_delay: Duration,
}

impl OllamaEmbedder {
    /// Build an embedder from the `[embeddings]` config section.
    pub fn new(config: &EmbeddingsConfig) -> Result<Self> {
        let mut base = config.base_url.clone();
        if !base.ends_with('/') {
            base.push('/');
        }
        let endpoint = Url::parse(&base)
            .and_then(|u| u.join("api/embed"))
            .map_err(|e| ReportflowError::config(format!("invalid embeddings base_url {base:?}: {e}")))?;

        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ReportflowError::Embedding(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint,
            model: config.model.clone(),
            dimension: config.dimension,
            max_attempts: config.max_attempts.max(1),
            base_delay: DEFAULT_BASE_DELAY,
        })
    }

    /// Override the first retry delay.
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(MAX_DELAY)
    }

    async fn send_once(&self, texts: &[String]) -> std::result::Result<Vec<Vec<f32>>, AttemptError> {
        let request = EmbedRequest {
            model: &self.model,
            input: texts,
        };
        let response = self
            .client
            .post(self.endpoint.clone())
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                let err = ReportflowError::Embedding(format!("{}: {e}", self.endpoint));
                if e.is_connect() || e.is_timeout() {
                    AttemptError::Transient(err)
                } else {
                    AttemptError::Permanent(err)
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let err = ReportflowError::Embedding(format!("{}: HTTP {status}", self.endpoint));
            return Err(if is_transient_status(status) {
                AttemptError::Transient(err)
            } else {
                AttemptError::Permanent(err)
            });
        }

        let body: EmbedResponse = response.json().await.map_err(|e| {
            AttemptError::Permanent(ReportflowError::Embedding(format!(
                "{}: invalid response body: {e}",
                self.endpoint
            )))
        })?;
        Ok(body.embeddings)
    }

    fn check_shape(&self, texts: &[String], vectors: &[Vec<f32>]) -> Result<()> {
        if vectors.len() != texts.len() {
            return Err(ReportflowError::Embedding(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                vectors.len()
            )));
        }
        if let Some(bad) = vectors.iter().find(|v| v.len() != self.dimension) {
            return Err(ReportflowError::Embedding(format!(
                "embedding dimension mismatch: expected {}, got {}",
                self.dimension,
                bad.len()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let mut attempt = 1;
        loop {
            match self.send_once(texts).await {
                Ok(vectors) => {
                    self.check_shape(texts, &vectors)?;
                    debug!(count = vectors.len(), model = %self.model, "embedded texts");
                    return Ok(vectors);
                }
                Err(AttemptError::Transient(err)) if attempt < self.max_attempts => {
                    let delay = self.backoff(attempt);
                    warn!(attempt, ?delay, error = %err, "embedding request failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(AttemptError::Transient(err)) | Err(AttemptError::Permanent(err)) => {
                    return Err(err);
                }
            }
        }
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

fn is_transient_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::TOO_MANY_REQUESTS
            | StatusCode::INTERNAL_SERVER_ERROR
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}
