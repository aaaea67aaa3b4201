// Database module
// Read-only catalog access and ad-hoc statement execution against the relational source


pub mod mysql;
pub mod sqlite;

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

use crate::config::DatabaseConfig;

pub use mysql::MySqlSource;
pub use sqlite::SqliteSource;

/// One result row, keyed by column name in select-list order
pub type JsonRow = Map<String, Value>;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Failed to connect to database: {0}")]
    Connect(String),

    #[error("Unsupported database URL scheme: {0}")]
    UnsupportedUrl(String),

    #[error("Table not found: {0}")]
    TableNotFound(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Failed to encode result value: {0}")]
    Encode(String),
}

/// Name and DDL text of one table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    pub name: String,
    pub definition: String,
}

/// Result of a statement that does not return rows
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecOutcome {
    pub rows_affected: u64,
    /// Zero when the statement generated no identifier
    pub last_insert_id: u64,
}

/// A connected relational database. Implementations own a connection pool and
/// are shared between the indexer and the query facade.
#[async_trait]
pub trait RelationalSource: Send + Sync {
    /// Names of all tables in the connected schema
    async fn list_tables(&self) -> Result<Vec<String>, SourceError>;

    /// Full `CREATE TABLE` text for `table`
    async fn describe_table(&self, table: &str) -> Result<String, SourceError>;

    /// Run a row-returning statement and materialize every row
    async fn query_rows(&self, sql: &str) -> Result<Vec<JsonRow>, SourceError>;

    /// Run a statement for its side effects
    async fn execute(&self, sql: &str) -> Result<ExecOutcome, SourceError>;

    async fn close(&self);
}

/// Open a pooled source for `url`, choosing the driver from its scheme.
/// The pool is verified with one live connection before returning.
#[inline]
pub async fn connect(
    url: &str,
    settings: &DatabaseConfig,
) -> Result<Arc<dyn RelationalSource>, SourceError> {
    let scheme = url.split_once(':').map(|(scheme, _)| scheme).unwrap_or_default();

    let source: Arc<dyn RelationalSource> = match scheme {
        "mysql" | "mariadb" => Arc::new(MySqlSource::connect(url, settings).await?),
        "sqlite" => Arc::new(SqliteSource::connect(url, settings).await?),
        other => return Err(SourceError::UnsupportedUrl(other.to_string())),
    };

    info!("Connected to {} database", scheme);
    Ok(source)
}

/// Bound a database round-trip by `limit`
pub(crate) async fn with_timeout<T, F>(limit: Duration, operation: F) -> Result<T, SourceError>
where
    F: Future<Output = Result<T, sqlx::Error>>,
{
    with_timeout_mapped(limit, operation, |e| SourceError::Query(e.to_string())).await
}

/// Like [`with_timeout`], with driver errors classified by `map_err` while the
/// structured `sqlx::Error` is still available
pub(crate) async fn with_timeout_mapped<T, F, M>(
    limit: Duration,
    operation: F,
    map_err: M,
) -> Result<T, SourceError>
where
    F: Future<Output = Result<T, sqlx::Error>>,
    M: FnOnce(sqlx::Error) -> SourceError,
{
    match tokio::time::timeout(limit, operation).await {
        Ok(result) => result.map_err(map_err),
        Err(_) => Err(SourceError::Query(format!(
            "statement timed out after {}s",
            limit.as_secs()
        ))),
    }
}

/// JSON number for a float column; non-finite values become null
pub(crate) fn float_value(value: f64) -> Value {
    serde_json::Number::from_f64(value).map_or(Value::Null, Value::Number)
}

/// Leading keyword of a statement, uppercased, with leading comments and whitespace ignored
pub(crate) fn leading_keyword(sql: &str) -> String {
    let mut rest = sql.trim_start();
    loop {
        if let Some(after) = rest.strip_prefix("--") {
            rest = after.split_once('\n').map_or("", |(_, tail)| tail).trim_start();
        } else if let Some(after) = rest.strip_prefix("/*") {
            rest = after.split_once("*/").map_or("", |(_, tail)| tail).trim_start();
        } else {
            break;
        }
    }

    rest.chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .collect::<String>()
        .to_ascii_uppercase()
}
