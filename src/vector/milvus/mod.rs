
use async_trait::async_trait;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::time::{Duration, Instant};
use tracing::{debug, info};
use url::Url;

use super::{SearchHit, VectorError, VectorIndex, check_insert, check_search};
use crate::config::VectorConfig;
use crate::embeddings::EmbeddingVector;

const PRIMARY_FIELD: &str = "my_id";
const VECTOR_FIELD: &str = "vector";
const TEXT_FIELD: &str = "schema";
const TEXT_MAX_LENGTH: u32 = 10240;
const INDEX_NAME: &str = "vector";
const MAX_ERROR_BODY_CHARS: usize = 512;
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Milvus client speaking the RESTful v2 API (`/v2/vectordb/...`)
#[derive(Debug, Clone)]
pub struct MilvusClient {
    base_url: Url,
    collection: String,
    token: Option<String>,
    dimension: usize,
    agent: ureq::Agent,
    ready_timeout: Duration,
    poll_interval: Duration,
}

/// Every v2 response is wrapped in this envelope; `code` is 0 on success
#[derive(Debug, Deserialize)]
struct Envelope {
    code: i64,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    data: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct HasCollection {
    has: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IndexDescription {
    #[serde(default)]
    index_state: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoadState {
    load_state: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InsertResult {
    insert_count: usize,
}

#[derive(Debug, Deserialize)]
struct SearchRecord {
    distance: f32,
    #[serde(default)]
    schema: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CollectionStats {
    row_count: Count,
}

/// Row counts arrive as a number or as a decimal string depending on the server version
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Count {
    Number(u64),
    Text(String),
}

#[derive(Debug, Clone, Copy)]
enum Readiness {
    IndexBuilt,
    Loaded,
}

impl Readiness {
    fn describe(self) -> &'static str {
        match self {
            Self::IndexBuilt => "index build",
            Self::Loaded => "collection load",
        }
    }
}

impl MilvusClient {
    #[inline]
    pub fn new(config: &VectorConfig, dimension: usize) -> Result<Self, VectorError> {
        let base_url = config
            .base_url()
            .map_err(|e| VectorError::InvalidInput(e.to_string()))?;
        let collection = config
            .collection
            .clone()
            .filter(|name| !name.trim().is_empty())
            .ok_or_else(|| VectorError::InvalidInput("collection name is not set".to_string()))?;

        Ok(Self {
            base_url,
            collection,
            token: config.token.clone().filter(|t| !t.is_empty()),
            dimension,
            agent: build_agent(config.timeout()),
            ready_timeout: config.ready_timeout(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        })
    }

    #[inline]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    #[inline]
    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// POST `body` to `path` and unwrap the response envelope
    fn post_blocking(&self, path: &str, body: &Value) -> Result<Value, VectorError> {
        let url = self
            .base_url
            .join(path)
            .map_err(|e| VectorError::InvalidInput(format!("invalid endpoint {}: {}", path, e)))?;

        let request = self
            .agent
            .post(url.as_str())
            .header("Content-Type", "application/json");
        let request = match &self.token {
            Some(token) => request.header("Authorization", format!("Bearer {}", token)),
            None => request,
        };

        let mut response = request.send(&body.to_string()).map_err(|e| match e {
            ureq::Error::Timeout(_) => VectorError::Timeout {
                operation: format!("response from {}", path),
            },
            other => VectorError::Transport(other.to_string()),
        })?;

        let status = response.status().as_u16();
        let text = response
            .body_mut()
            .read_to_string()
            .map_err(|e| VectorError::Transport(format!("failed to read response: {}", e)))?;

        if status != 200 {
            return Err(VectorError::Upstream {
                code: i64::from(status),
                message: text.chars().take(MAX_ERROR_BODY_CHARS).collect(),
            });
        }

        let envelope: Envelope =
            serde_json::from_str(&text).map_err(|e| VectorError::Decode(e.to_string()))?;
        if envelope.code != 0 {
            return Err(VectorError::Upstream {
                code: envelope.code,
                message: envelope.message.unwrap_or_default(),
            });
        }

        Ok(envelope.data.unwrap_or(Value::Null))
    }

    /// Run one request on the blocking pool and decode its `data` payload
    async fn call<T>(&self, path: &'static str, body: Value) -> Result<T, VectorError>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let client = self.clone();
        let data = tokio::task::spawn_blocking(move || client.post_blocking(path, &body))
            .await
            .map_err(|e| VectorError::Transport(format!("request task failed: {}", e)))??;

        serde_json::from_value(data)
            .map_err(|e| VectorError::Decode(format!("{}: {}", path, e)))
    }

    async fn is_ready(&self, readiness: Readiness) -> Result<bool, VectorError> {
        match readiness {
            Readiness::IndexBuilt => {
                let indexes: Vec<IndexDescription> = self
                    .call(
                        "/v2/vectordb/indexes/describe",
                        json!({ "collectionName": self.collection, "indexName": INDEX_NAME }),
                    )
                    .await?;
                Ok(indexes
                    .first()
                    .and_then(|index| index.index_state.as_deref())
                    .is_some_and(|state| state == "Finished"))
            }
            Readiness::Loaded => {
                let state: LoadState = self
                    .call(
                        "/v2/vectordb/collections/get_load_state",
                        json!({ "collectionName": self.collection }),
                    )
                    .await?;
                Ok(state.load_state == "LoadStateLoaded")
            }
        }
    }

    /// Poll until `readiness` holds or the ready timeout elapses
    async fn await_ready(&self, readiness: Readiness) -> Result<(), VectorError> {
        let deadline = Instant::now() + self.ready_timeout;

        loop {
            if self.is_ready(readiness).await? {
                debug!("{} complete for {}", readiness.describe(), self.collection);
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(VectorError::Timeout {
                    operation: format!("{} of {}", readiness.describe(), self.collection),
                });
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

#[async_trait]
impl VectorIndex for MilvusClient {
    #[inline]
    async fn collection_exists(&self) -> Result<bool, VectorError> {
        let result: HasCollection = self
            .call(
                "/v2/vectordb/collections/has",
                json!({ "collectionName": self.collection }),
            )
            .await?;
        Ok(result.has)
    }

    #[inline]
    async fn create_collection(&self) -> Result<(), VectorError> {
        info!("Creating collection {}", self.collection);

        let body = json!({
            "collectionName": self.collection,
            "schema": {
                "autoId": true,
                "enableDynamicField": false,
                "fields": [
                    { "fieldName": PRIMARY_FIELD, "dataType": "Int64", "isPrimary": true },
                    {
                        "fieldName": VECTOR_FIELD,
                        "dataType": "FloatVector",
                        "elementTypeParams": { "dim": self.dimension.to_string() }
                    },
                    {
                        "fieldName": TEXT_FIELD,
                        "dataType": "VarChar",
                        "elementTypeParams": { "max_length": TEXT_MAX_LENGTH }
                    }
                ]
            }
        });

        let _: Value = self.call("/v2/vectordb/collections/create", body).await?;
        Ok(())
    }

    #[inline]
    async fn create_index(&self) -> Result<(), VectorError> {
        let body = json!({
            "collectionName": self.collection,
            "indexParams": [{
                "fieldName": VECTOR_FIELD,
                "indexName": INDEX_NAME,
                "metricType": "COSINE",
                "indexType": "AUTOINDEX"
            }]
        });

        let _: Value = self.call("/v2/vectordb/indexes/create", body).await?;
        self.await_ready(Readiness::IndexBuilt).await
    }

    #[inline]
    async fn load_collection(&self) -> Result<(), VectorError> {
        let _: Value = self
            .call(
                "/v2/vectordb/collections/load",
                json!({ "collectionName": self.collection }),
            )
            .await?;
        self.await_ready(Readiness::Loaded).await
    }

    #[inline]
    async fn insert(
        &self,
        texts: &[String],
        vectors: &[EmbeddingVector],
    ) -> Result<usize, VectorError> {
        check_insert(texts, vectors, self.dimension)?;
        if texts.is_empty() {
            return Ok(0);
        }

        let data: Vec<Value> = texts
            .iter()
            .zip(vectors)
            .map(|(text, vector)| json!({ VECTOR_FIELD: vector, TEXT_FIELD: text }))
            .collect();

        let result: InsertResult = self
            .call(
                "/v2/vectordb/entities/insert",
                json!({ "collectionName": self.collection, "data": data }),
            )
            .await?;

        info!(
            "Inserted {} records into {}",
            result.insert_count, self.collection
        );
        Ok(result.insert_count)
    }

    #[inline]
    async fn search(&self, query: &[f32], k: usize) -> Result<Vec<SearchHit>, VectorError> {
        check_search(query, k, self.dimension)?;

        // A collection with no rows may never have been loaded
        if self.row_count().await? == 0 {
            debug!("Collection {} is empty, loading before search", self.collection);
            self.load_collection().await?;
        }

        let body = json!({
            "collectionName": self.collection,
            "data": [query],
            "annsField": VECTOR_FIELD,
            "limit": k,
            "outputFields": [TEXT_FIELD]
        });
        let records: Vec<SearchRecord> = self.call("/v2/vectordb/entities/search", body).await?;

        let hits: Vec<SearchHit> = records
            .into_iter()
            .filter_map(|record| {
                record.schema.map(|text| SearchHit {
                    text,
                    score: record.distance,
                })
            })
            .collect();

        debug!(
            "Search returned {} hits, scores: {:?}",
            hits.len(),
            hits.iter().map(|hit| hit.score).collect::<Vec<_>>()
        );
        Ok(hits)
    }

    #[inline]
    async fn row_count(&self) -> Result<u64, VectorError> {
        let stats: CollectionStats = self
            .call(
                "/v2/vectordb/collections/get_stats",
                json!({ "collectionName": self.collection }),
            )
            .await?;

        match stats.row_count {
            Count::Number(count) => Ok(count),
            Count::Text(text) => text
                .parse()
                .map_err(|_| VectorError::Decode(format!("invalid row count: {}", text))),
        }
    }
}

fn build_agent(timeout: Duration) -> ureq::Agent {
    ureq::Agent::config_builder()
        .timeout_global(Some(timeout))
        .http_status_as_error(false)
        .build()
        .into()
}
