// In-process doubles for the external collaborators, shared by unit tests

use async_trait::async_trait;
use serde_json::json;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{Notify, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::database::{ExecOutcome, JsonRow, RelationalSource, SourceError};
use crate::embeddings::{EmbedError, Embedder, EmbeddingVector};
use crate::vector::{SearchHit, VectorError, VectorIndex, check_insert, check_search};

pub(crate) const KEYWORDS: [&str; 8] = [
    "user", "order", "product", "payment", "email", "price", "address", "review",
];
pub(crate) const TEST_DIMENSION: usize = KEYWORDS.len();

pub(crate) fn ddl(table: &str) -> String {
    format!("CREATE TABLE {table} (id INT PRIMARY KEY)")
}

/// Relational source over a fixed table list that counts every call
#[derive(Default)]
pub(crate) struct FakeSource {
    tables: Mutex<Vec<(String, String)>>,
    failing: HashSet<String>,
    cancel_after: Option<(usize, CancellationToken)>,
    pub describe_calls: AtomicUsize,
    pub statement_calls: AtomicUsize,
}

impl FakeSource {
    pub fn with_tables(tables: &[(&str, &str)]) -> Self {
        Self {
            tables: Mutex::new(
                tables
                    .iter()
                    .map(|(name, ddl)| ((*name).to_string(), (*ddl).to_string()))
                    .collect(),
            ),
            ..Self::default()
        }
    }

    pub fn failing(mut self, table: &str) -> Self {
        self.failing.insert(table.to_string());
        self
    }

    /// Cancel `token` once `describes` tables have been fetched
    pub fn cancel_after(mut self, describes: usize, token: CancellationToken) -> Self {
        self.cancel_after = Some((describes, token));
        self
    }

    pub fn add_table(&self, name: &str, definition: &str) {
        if let Ok(mut tables) = self.tables.lock() {
            tables.push((name.to_string(), definition.to_string()));
        }
    }

    pub fn describes(&self) -> usize {
        self.describe_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RelationalSource for FakeSource {
    async fn list_tables(&self) -> Result<Vec<String>, SourceError> {
        let tables = self.tables.lock().expect("tables lock");
        Ok(tables.iter().map(|(name, _)| name.clone()).collect())
    }

    async fn describe_table(&self, table: &str) -> Result<String, SourceError> {
        let calls = self.describe_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some((limit, token)) = &self.cancel_after {
            if calls >= *limit {
                token.cancel();
            }
        }

        if self.failing.contains(table) {
            return Err(SourceError::TableNotFound(table.to_string()));
        }

        let tables = self.tables.lock().expect("tables lock");
        tables
            .iter()
            .find(|(name, _)| name == table)
            .map(|(_, ddl)| ddl.clone())
            .ok_or_else(|| SourceError::TableNotFound(table.to_string()))
    }

    async fn query_rows(&self, _sql: &str) -> Result<Vec<JsonRow>, SourceError> {
        self.statement_calls.fetch_add(1, Ordering::SeqCst);
        let row = json!({ "1": 1 });
        Ok(row.as_object().cloned().into_iter().collect())
    }

    async fn execute(&self, _sql: &str) -> Result<ExecOutcome, SourceError> {
        self.statement_calls.fetch_add(1, Ordering::SeqCst);
        Ok(ExecOutcome {
            rows_affected: 1,
            last_insert_id: 0,
        })
    }

    async fn close(&self) {}
}

/// Blocks every embed call until the test releases it
pub(crate) struct EmbedGate {
    pub started: Notify,
    pub release: Semaphore,
}

impl EmbedGate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            started: Notify::new(),
            release: Semaphore::new(0),
        })
    }

    pub fn open(&self) {
        self.release.add_permits(Semaphore::MAX_PERMITS / 2);
    }
}

/// Bag-of-keywords embedder: one dimension per entry in `KEYWORDS`
#[derive(Default)]
pub(crate) struct KeywordEmbedder {
    pub calls: AtomicUsize,
    pub seen: Mutex<Vec<String>>,
    failing: HashSet<String>,
    gate: Option<Arc<EmbedGate>>,
}

impl KeywordEmbedder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail any text containing `needle`
    pub fn failing_on(mut self, needle: &str) -> Self {
        self.failing.insert(needle.to_string());
        self
    }

    pub fn gated(mut self, gate: Arc<EmbedGate>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn seen_texts(&self) -> Vec<String> {
        self.seen.lock().expect("seen lock").clone()
    }

    pub fn vector_for(text: &str) -> EmbeddingVector {
        let lower = text.to_lowercase();
        KEYWORDS
            .iter()
            .map(|keyword| lower.matches(keyword).count() as f32 + 0.01)
            .collect()
    }
}

#[async_trait]
impl Embedder for KeywordEmbedder {
    async fn embed(&self, text: &str) -> Result<EmbeddingVector, EmbedError> {
        if text.trim().is_empty() {
            return Err(EmbedError::InvalidInput);
        }
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().expect("seen lock").push(text.to_string());

        if let Some(gate) = &self.gate {
            gate.started.notify_one();
            gate.release.acquire().await.expect("gate open").forget();
        }

        if self.failing.iter().any(|needle| text.contains(needle.as_str())) {
            return Err(EmbedError::Upstream {
                status: 500,
                body: "embedding backend unavailable".to_string(),
            });
        }

        Ok(Self::vector_for(text))
    }

    fn dimension(&self) -> usize {
        TEST_DIMENSION
    }
}

/// Cosine-similarity index held in memory
#[derive(Default)]
pub(crate) struct MemoryIndex {
    records: Mutex<Vec<(String, EmbeddingVector)>>,
    exists: AtomicBool,
    fail_inserts: AtomicBool,
    pub create_calls: AtomicUsize,
    pub load_calls: AtomicUsize,
    pub insert_calls: AtomicUsize,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn existing() -> Self {
        let index = Self::default();
        index.exists.store(true, Ordering::SeqCst);
        index
    }

    pub fn fail_inserts(&self, fail: bool) {
        self.fail_inserts.store(fail, Ordering::SeqCst);
    }

    pub fn texts(&self) -> Vec<String> {
        let records = self.records.lock().expect("records lock");
        records.iter().map(|(text, _)| text.clone()).collect()
    }

    pub fn seed(&self, texts: &[String]) {
        let mut records = self.records.lock().expect("records lock");
        records.extend(
            texts
                .iter()
                .map(|text| (text.clone(), KeywordEmbedder::vector_for(text))),
        );
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

#[async_trait]
impl VectorIndex for MemoryIndex {
    async fn collection_exists(&self) -> Result<bool, VectorError> {
        Ok(self.exists.load(Ordering::SeqCst))
    }

    async fn create_collection(&self) -> Result<(), VectorError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        self.exists.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn create_index(&self) -> Result<(), VectorError> {
        Ok(())
    }

    async fn load_collection(&self) -> Result<(), VectorError> {
        self.load_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn insert(
        &self,
        texts: &[String],
        vectors: &[EmbeddingVector],
    ) -> Result<usize, VectorError> {
        check_insert(texts, vectors, TEST_DIMENSION)?;
        self.insert_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_inserts.load(Ordering::SeqCst) {
            return Err(VectorError::Upstream {
                code: 65535,
                message: "insert rejected".to_string(),
            });
        }

        let mut records = self.records.lock().expect("records lock");
        records.extend(texts.iter().cloned().zip(vectors.iter().cloned()));
        Ok(texts.len())
    }

    async fn search(&self, query: &[f32], k: usize) -> Result<Vec<SearchHit>, VectorError> {
        check_search(query, k, TEST_DIMENSION)?;
        let records = self.records.lock().expect("records lock");

        let mut hits: Vec<SearchHit> = records
            .iter()
            .map(|(text, vector)| SearchHit {
                text: text.clone(),
                score: cosine(query, vector),
            })
            .collect();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(k);
        Ok(hits)
    }

    async fn row_count(&self) -> Result<u64, VectorError> {
        let records = self.records.lock().expect("records lock");
        Ok(records.len() as u64)
    }
}
