// Query module
// The two operations exposed to tool clients: table lookup and SQL execution


use itertools::Itertools;
use std::sync::Arc;
use tracing::debug;

use crate::database::RelationalSource;
use crate::embeddings::Embedder;
use crate::vector::VectorIndex;
use crate::{Result, SchemaMcpError};

/// Number of schema texts returned by a table lookup
pub const RELEVANT_TABLE_LIMIT: usize = 3;

const SCHEMA_SEPARATOR: &str = "\n\n";
const READ_PREFIXES: [&str; 4] = ["select", "show", "describe", "explain"];

/// Read-only view of the vector index plus direct access to the relational source.
/// Never writes to the index and never touches the ledger.
#[derive(Clone)]
pub struct QueryService {
    source: Arc<dyn RelationalSource>,
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
}

impl QueryService {
    #[inline]
    pub fn new(
        source: Arc<dyn RelationalSource>,
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorIndex>,
    ) -> Self {
        Self {
            source,
            embedder,
            index,
        }
    }

    /// Schema texts of the tables closest to `query`, best match first
    #[inline]
    pub async fn find_relevant_tables(&self, query: &str) -> Result<String> {
        let vector = self.embedder.embed(query).await?;
        let hits = self.index.search(&vector, RELEVANT_TABLE_LIMIT).await?;

        debug!("Found {} relevant tables for query", hits.len());
        Ok(hits.iter().map(|hit| hit.text.as_str()).join(SCHEMA_SEPARATOR))
    }

    /// Run `statement`. Reads return a JSON array of row objects; anything else
    /// returns a summary of affected rows.
    #[inline]
    pub async fn execute_sql(&self, statement: &str) -> Result<String> {
        if statement.trim().is_empty() {
            return Err(SchemaMcpError::InvalidInput(
                "SQL statement cannot be empty".to_string(),
            ));
        }

        if is_read_statement(statement) {
            let rows = self.source.query_rows(statement).await?;
            debug!("Read statement returned {} rows", rows.len());
            return serde_json::to_string_pretty(&rows)
                .map_err(|e| SchemaMcpError::Decode(e.to_string()));
        }

        let outcome = self.source.execute(statement).await?;
        let summary = if outcome.last_insert_id > 0 {
            format!(
                "Query executed successfully. Rows affected: {}, Last insert ID: {}",
                outcome.rows_affected, outcome.last_insert_id
            )
        } else {
            format!(
                "Query executed successfully. Rows affected: {}",
                outcome.rows_affected
            )
        };
        Ok(summary)
    }
}

/// Case-insensitive prefix check, ignoring leading whitespace
#[inline]
pub fn is_read_statement(statement: &str) -> bool {
    let trimmed = statement.trim_start();
    READ_PREFIXES.iter().any(|prefix| {
        trimmed
            .get(..prefix.len())
            .is_some_and(|head| head.eq_ignore_ascii_case(prefix))
    })
}
