
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use super::{EmbedError, Embedder, EmbeddingVector};
use crate::config::EmbeddingConfig;

const ENCODING_FORMAT: &str = "float";
const MAX_ERROR_BODY_CHARS: usize = 512;

/// Client for an OpenAI-compatible `/embeddings` endpoint with bearer-token auth
#[derive(Debug, Clone)]
pub struct EmbeddingClient {
    endpoint: Option<Url>,
    token: Option<String>,
    model: String,
    dimension: usize,
    agent: ureq::Agent,
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a str,
    encoding_format: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

impl EmbeddingClient {
    #[inline]
    pub fn new(config: &EmbeddingConfig) -> Result<Self, EmbedError> {
        let endpoint = config
            .url
            .as_deref()
            .map(|url| {
                Url::parse(url).map_err(|e| {
                    EmbedError::ConfigMissing(format!("invalid endpoint URL '{}': {}", url, e))
                })
            })
            .transpose()?;

        Ok(Self {
            endpoint,
            token: config.token.clone(),
            model: config.model.clone(),
            dimension: config.dimension as usize,
            agent: build_agent(config.timeout()),
        })
    }

    #[inline]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.agent = build_agent(timeout);
        self
    }

    #[inline]
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Issue one embedding request on the current thread
    #[inline]
    pub fn embed_blocking(&self, text: &str) -> Result<EmbeddingVector, EmbedError> {
        if text.trim().is_empty() {
            return Err(EmbedError::InvalidInput);
        }

        let (endpoint, token) = match (&self.endpoint, &self.token) {
            (Some(endpoint), Some(token)) if !token.is_empty() => (endpoint, token),
            (None, _) => return Err(EmbedError::ConfigMissing("endpoint URL".to_string())),
            _ => return Err(EmbedError::ConfigMissing("API token".to_string())),
        };

        debug!("Generating embedding for text (length: {})", text.len());

        let request = EmbeddingRequest {
            model: &self.model,
            input: text,
            encoding_format: ENCODING_FORMAT,
        };
        let request_json = serde_json::to_string(&request)
            .map_err(|e| EmbedError::Decode(format!("failed to serialize request: {}", e)))?;

        let mut response = self
            .agent
            .post(endpoint.as_str())
            .header("Authorization", format!("Bearer {}", token))
            .header("Content-Type", "application/json")
            .send(&request_json)
            .map_err(|e| match e {
                ureq::Error::Timeout(_) => {
                    EmbedError::Transport(format!("request to {} timed out", endpoint))
                }
                other => EmbedError::Transport(other.to_string()),
            })?;

        let status = response.status().as_u16();
        let body = response
            .body_mut()
            .read_to_string()
            .map_err(|e| EmbedError::Transport(format!("failed to read response: {}", e)))?;

        if status != 200 {
            warn!("Embedding service returned HTTP {}", status);
            return Err(EmbedError::Upstream {
                status,
                body: body.chars().take(MAX_ERROR_BODY_CHARS).collect(),
            });
        }

        self.decode(&body)
    }

    fn decode(&self, body: &str) -> Result<EmbeddingVector, EmbedError> {
        let response: EmbeddingResponse =
            serde_json::from_str(body).map_err(|e| EmbedError::Decode(e.to_string()))?;

        let embedding = response
            .data
            .into_iter()
            .next()
            .map(|data| data.embedding)
            .ok_or_else(|| EmbedError::Decode("response contained no embeddings".to_string()))?;

        if embedding.len() != self.dimension {
            return Err(EmbedError::Decode(format!(
                "expected {} dimensions, got {}",
                self.dimension,
                embedding.len()
            )));
        }

        debug!("Generated embedding with {} dimensions", embedding.len());
        Ok(embedding)
    }
}

#[async_trait]
impl Embedder for EmbeddingClient {
    #[inline]
    async fn embed(&self, text: &str) -> Result<EmbeddingVector, EmbedError> {
        if text.trim().is_empty() {
            return Err(EmbedError::InvalidInput);
        }

        let client = self.clone();
        let text = text.to_string();
        tokio::task::spawn_blocking(move || client.embed_blocking(&text))
            .await
            .map_err(|e| EmbedError::Transport(format!("embedding task failed: {}", e)))?
    }

    #[inline]
    fn dimension(&self) -> usize {
        self.dimension
    }
}

fn build_agent(timeout: Duration) -> ureq::Agent {
    ureq::Agent::config_builder()
        .timeout_global(Some(timeout))
        .http_status_as_error(false)
        .build()
        .into()
}
