use async_trait::async_trait;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Column, Row, TypeInfo, ValueRef};
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

use super::{
    ExecOutcome, JsonRow, RelationalSource, SourceError, float_value, leading_keyword,
    with_timeout,
};
use crate::config::DatabaseConfig;

#[cfg(test)]
mod tests;

/// SQLite source, mainly for local development and tests
#[derive(Debug, Clone)]
pub struct SqliteSource {
    pool: SqlitePool,
    query_timeout: Duration,
}

impl SqliteSource {
    #[inline]
    pub async fn connect(url: &str, settings: &DatabaseConfig) -> Result<Self, SourceError> {
        let options =
            SqliteConnectOptions::from_str(url).map_err(|e| SourceError::Connect(e.to_string()))?;

        let pool = SqlitePoolOptions::new()
            .max_connections(settings.max_connections)
            .max_lifetime(settings.max_lifetime())
            .idle_timeout(settings.idle_timeout())
            .acquire_timeout(settings.connect_timeout())
            .connect_with(options)
            .await
            .map_err(|e| SourceError::Connect(e.to_string()))?;

        debug!("SQLite pool ready for {}", url);

        Ok(Self::from_pool(pool, settings.query_timeout()))
    }

    #[inline]
    pub fn from_pool(pool: SqlitePool, query_timeout: Duration) -> Self {
        Self {
            pool,
            query_timeout,
        }
    }

    #[inline]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl RelationalSource for SqliteSource {
    #[inline]
    async fn list_tables(&self) -> Result<Vec<String>, SourceError> {
        with_timeout(
            self.query_timeout,
            sqlx::query_scalar::<_, String>(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
            )
            .fetch_all(&self.pool),
        )
        .await
    }

    #[inline]
    async fn describe_table(&self, table: &str) -> Result<String, SourceError> {
        let definition = with_timeout(
            self.query_timeout,
            sqlx::query_scalar::<_, Option<String>>(
                "SELECT sql FROM sqlite_master WHERE type = 'table' AND name = ?",
            )
            .bind(table)
            .fetch_optional(&self.pool),
        )
        .await?;

        definition
            .flatten()
            .ok_or_else(|| SourceError::TableNotFound(table.to_string()))
    }

    #[inline]
    async fn query_rows(&self, sql: &str) -> Result<Vec<JsonRow>, SourceError> {
        let rows = with_timeout(self.query_timeout, sqlx::raw_sql(sql).fetch_all(&self.pool))
            .await?;
        rows.iter().map(row_to_json).collect()
    }

    #[inline]
    async fn execute(&self, sql: &str) -> Result<ExecOutcome, SourceError> {
        let result = with_timeout(self.query_timeout, sqlx::raw_sql(sql).execute(&self.pool))
            .await?;

        // last_insert_rowid is sticky per connection, so only trust it right after an insert
        let generates_id = matches!(leading_keyword(sql).as_str(), "INSERT" | "REPLACE");
        let last_insert_id = if generates_id {
            u64::try_from(result.last_insert_rowid()).unwrap_or(0)
        } else {
            0
        };

        Ok(ExecOutcome {
            rows_affected: result.rows_affected(),
            last_insert_id,
        })
    }

    #[inline]
    async fn close(&self) {
        self.pool.close().await;
    }
}

fn row_to_json(row: &SqliteRow) -> Result<JsonRow, SourceError> {
    let encode_err = |e: sqlx::Error| SourceError::Encode(e.to_string());
    let mut object = JsonRow::new();

    for column in row.columns() {
        let index = column.ordinal();
        let raw = row.try_get_raw(index).map_err(encode_err)?;

        let value = if raw.is_null() {
            Value::Null
        } else {
            match raw.type_info().name() {
                "INTEGER" => {
                    Value::from(row.try_get_unchecked::<i64, _>(index).map_err(encode_err)?)
                }
                "REAL" => float_value(row.try_get_unchecked::<f64, _>(index).map_err(encode_err)?),
                "BLOB" => {
                    let bytes: Vec<u8> = row.try_get_unchecked(index).map_err(encode_err)?;
                    Value::String(String::from_utf8_lossy(&bytes).into_owned())
                }
                _ => Value::String(row.try_get_unchecked::<String, _>(index).map_err(encode_err)?),
            }
        };

        object.insert(column.name().to_string(), value);
    }

    Ok(object)
}
