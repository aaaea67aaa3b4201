// Vector module
// Client side of the remote similarity-search service holding schema embeddings

pub mod milvus;

use async_trait::async_trait;
use std::fmt;
use thiserror::Error;

use crate::embeddings::EmbeddingVector;

pub use milvus::MilvusClient;

#[derive(Debug, Error)]
pub enum VectorError {
    #[error("Invalid vector request: {0}")]
    InvalidInput(String),

    #[error("Vector service request failed: {0}")]
    Transport(String),

    #[error("Timed out waiting for {operation}")]
    Timeout { operation: String },

    #[error("Vector service returned error {code}: {message}")]
    Upstream { code: i64, message: String },

    #[error("Failed to decode vector service response: {0}")]
    Decode(String),
}

/// One nearest-neighbour match with the schema text stored alongside it
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub text: String,
    /// Cosine similarity, higher is closer
    pub score: f32,
}

/// Lifecycle of the collection as driven by the indexer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionState {
    Absent,
    Creating,
    IndexBuilding,
    Loaded,
}

impl fmt::Display for CollectionState {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Absent => "absent",
            Self::Creating => "creating",
            Self::IndexBuilding => "index building",
            Self::Loaded => "loaded",
        };
        f.write_str(name)
    }
}

/// A named collection of `(schema text, embedding)` records in a remote vector store.
///
/// `create_index` and `load_collection` return only once the service reports the
/// index as built and the collection as loaded; searches against an unloaded
/// collection are not reliable.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn collection_exists(&self) -> Result<bool, VectorError>;

    /// Define the collection schema: auto-id primary key, vector field, text field
    async fn create_collection(&self) -> Result<(), VectorError>;

    /// Build the cosine similarity index and wait for it to finish
    async fn create_index(&self) -> Result<(), VectorError>;

    /// Load the collection for search and wait until it is queryable
    async fn load_collection(&self) -> Result<(), VectorError>;

    /// Insert parallel slices of texts and vectors, returning the stored count
    async fn insert(
        &self,
        texts: &[String],
        vectors: &[EmbeddingVector],
    ) -> Result<usize, VectorError>;

    /// Up to `k` nearest records by cosine similarity
    async fn search(&self, query: &[f32], k: usize) -> Result<Vec<SearchHit>, VectorError>;

    async fn row_count(&self) -> Result<u64, VectorError>;
}

/// Check the preconditions shared by every `insert` implementation
pub(crate) fn check_insert(
    texts: &[String],
    vectors: &[EmbeddingVector],
    dimension: usize,
) -> Result<(), VectorError> {
    if texts.len() != vectors.len() {
        return Err(VectorError::InvalidInput(format!(
            "{} texts but {} vectors",
            texts.len(),
            vectors.len()
        )));
    }

    if let Some(vector) = vectors.iter().find(|v| v.len() != dimension) {
        return Err(VectorError::InvalidInput(format!(
            "vector has {} dimensions, collection expects {}",
            vector.len(),
            dimension
        )));
    }

    Ok(())
}

/// Check the preconditions shared by every `search` implementation
pub(crate) fn check_search(query: &[f32], k: usize, dimension: usize) -> Result<(), VectorError> {
    if k == 0 {
        return Err(VectorError::InvalidInput("k must be at least 1".to_string()));
    }
    if query.len() != dimension {
        return Err(VectorError::InvalidInput(format!(
            "query has {} dimensions, collection expects {}",
            query.len(),
            dimension
        )));
    }
    Ok(())
}
