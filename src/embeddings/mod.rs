// Embeddings module
// Turns schema definitions and natural-language queries into dense vectors

pub mod remote;

use async_trait::async_trait;
use thiserror::Error;

pub use remote::EmbeddingClient;

/// Fixed-length dense vector produced by the embedding service
pub type EmbeddingVector = Vec<f32>;

#[derive(Debug, Error)]
pub enum EmbedError {
    #[error("Embedding service is not configured: {0}")]
    ConfigMissing(String),

    #[error("Cannot embed empty text")]
    InvalidInput,

    #[error("Embedding request failed: {0}")]
    Transport(String),

    #[error("Embedding service returned HTTP {status}: {body}")]
    Upstream { status: u16, body: String },

    #[error("Failed to decode embedding response: {0}")]
    Decode(String),
}

/// Source of embeddings. One call per text, no retries.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<EmbeddingVector, EmbedError>;

    /// Number of dimensions every returned vector has
    fn dimension(&self) -> usize;
}
