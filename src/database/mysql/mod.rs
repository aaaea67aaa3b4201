use async_trait::async_trait;
use serde_json::Value;
use sqlx::mysql::{
    MySqlConnectOptions, MySqlDatabaseError, MySqlPool, MySqlPoolOptions, MySqlRow,
};
use sqlx::{Column, Row, TypeInfo};
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

use super::{
    ExecOutcome, JsonRow, RelationalSource, SourceError, float_value, with_timeout,
    with_timeout_mapped,
};
use crate::config::DatabaseConfig;

/// MySQL / MariaDB source. Statements go over the text protocol so that
/// catalog commands and arbitrary user SQL are accepted alike.
#[derive(Debug, Clone)]
pub struct MySqlSource {
    pool: MySqlPool,
    query_timeout: Duration,
}

impl MySqlSource {
    #[inline]
    pub async fn connect(url: &str, settings: &DatabaseConfig) -> Result<Self, SourceError> {
        let options =
            MySqlConnectOptions::from_str(url).map_err(|e| SourceError::Connect(e.to_string()))?;

        // sqlx has no idle-count cap; idle connections are reclaimed by idle_timeout instead
        let pool = MySqlPoolOptions::new()
            .max_connections(settings.max_connections)
            .max_lifetime(settings.max_lifetime())
            .idle_timeout(settings.idle_timeout())
            .acquire_timeout(settings.connect_timeout())
            .connect_with(options)
            .await
            .map_err(|e| SourceError::Connect(e.to_string()))?;

        debug!(
            "MySQL pool ready (max {} connections)",
            settings.max_connections
        );

        Ok(Self {
            pool,
            query_timeout: settings.query_timeout(),
        })
    }

    #[inline]
    pub fn pool(&self) -> &MySqlPool {
        &self.pool
    }
}

#[async_trait]
impl RelationalSource for MySqlSource {
    #[inline]
    async fn list_tables(&self) -> Result<Vec<String>, SourceError> {
        let rows = with_timeout(
            self.query_timeout,
            sqlx::raw_sql("SHOW TABLES").fetch_all(&self.pool),
        )
        .await?;

        rows.iter().map(|row| text_at(row, 0)).collect()
    }

    #[inline]
    async fn describe_table(&self, table: &str) -> Result<String, SourceError> {
        let statement = format!("SHOW CREATE TABLE {}", quote_identifier(table));
        let rows = with_timeout_mapped(
            self.query_timeout,
            sqlx::raw_sql(&statement).fetch_all(&self.pool),
            |e| {
                let server_error = e
                    .as_database_error()
                    .and_then(|d| d.try_downcast_ref::<MySqlDatabaseError>());
                if server_error.is_some_and(|d| is_missing_table(d.number(), d.code())) {
                    SourceError::TableNotFound(table.to_string())
                } else {
                    SourceError::Query(e.to_string())
                }
            },
        )
        .await?;
        let row = rows
            .into_iter()
            .next()
            .ok_or_else(|| SourceError::TableNotFound(table.to_string()))?;

        // Column 0 is the table name, column 1 the DDL
        text_at(&row, 1)
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
        Ok(ExecOutcome {
            rows_affected: result.rows_affected(),
            last_insert_id: result.last_insert_id(),
        })
    }

    #[inline]
    async fn close(&self) {
        self.pool.close().await;
    }
}

/// Backtick-quote an identifier, doubling embedded backticks
pub(crate) fn quote_identifier(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

fn text_at(row: &MySqlRow, index: usize) -> Result<String, SourceError> {
    let bytes: Vec<u8> = row
        .try_get_unchecked(index)
        .map_err(|e| SourceError::Encode(e.to_string()))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// `ER_NO_SUCH_TABLE`, or its SQLSTATE when the server number is not reported
fn is_missing_table(number: u16, sqlstate: Option<&str>) -> bool {
    const ER_NO_SUCH_TABLE: u16 = 1146;
    number == ER_NO_SUCH_TABLE || sqlstate == Some("42S02")
}

fn row_to_json(row: &MySqlRow) -> Result<JsonRow, SourceError> {
    let mut object = JsonRow::new();

    for column in row.columns() {
        let raw: Option<Vec<u8>> = row
            .try_get_unchecked(column.ordinal())
            .map_err(|e| SourceError::Encode(e.to_string()))?;
        let value = column_value(column.type_info().name(), raw.as_deref());
        object.insert(column.name().to_string(), value);
    }

    Ok(object)
}

/// JSON value for one text-protocol column. Integer and float columns become
/// numbers; everything else, including DECIMAL and binary data, becomes text.
fn column_value(type_name: &str, raw: Option<&[u8]>) -> Value {
    let Some(bytes) = raw else {
        return Value::Null;
    };
    let text = String::from_utf8_lossy(bytes);

    let number = match type_name {
        "BOOLEAN" | "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "BIGINT" | "YEAR" => {
            text.parse::<i64>().ok().map(Value::from)
        }
        name if name.ends_with(" UNSIGNED") && !name.starts_with("DECIMAL") => {
            text.parse::<u64>().ok().map(Value::from)
        }
        "FLOAT" | "DOUBLE" => text.parse::<f64>().ok().map(float_value),
        _ => None,
    };

    number.unwrap_or_else(|| Value::String(text.into_owned()))
}
