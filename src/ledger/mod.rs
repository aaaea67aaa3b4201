// Ledger module
// Local record of which tables are already embedded, so restarts skip them


use chrono::NaiveDateTime;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{QueryBuilder, Sqlite};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

/// Stay well below SQLite's bound-parameter limit
const MAX_NAMES_PER_STATEMENT: usize = 500;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Failed to open ledger at {path}: {message}")]
    Open { path: PathBuf, message: String },

    #[error("Failed to migrate ledger schema: {0}")]
    Migrate(String),

    #[error("Ledger query failed: {0}")]
    Query(String),
}

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct LedgerEntry {
    pub id: i64,
    pub table_name: String,
    pub indexed_at: NaiveDateTime,
}

/// Embedded SQLite store with one row per indexed table name.
///
/// The file and its table are created on first use; every later call reuses the
/// same single connection.
#[derive(Debug)]
pub struct DedupLedger {
    path: PathBuf,
    pool: OnceCell<SqlitePool>,
}

impl DedupLedger {
    #[inline]
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            pool: OnceCell::new(),
        }
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open the store now instead of on first use
    #[inline]
    pub async fn initialize(&self) -> Result<(), LedgerError> {
        self.pool().await.map(|_| ())
    }

    async fn pool(&self) -> Result<&SqlitePool, LedgerError> {
        self.pool.get_or_try_init(|| self.open()).await
    }

    async fn open(&self) -> Result<SqlitePool, LedgerError> {
        let open_err = |message: String| LedgerError::Open {
            path: self.path.clone(),
            message,
        };

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| open_err(e.to_string()))?;
        }

        let options = SqliteConnectOptions::new()
            .filename(&self.path)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| open_err(e.to_string()))?;

        sqlx::migrate!("src/ledger/migrations")
            .run(&pool)
            .await
            .map_err(|e| LedgerError::Migrate(e.to_string()))?;

        info!("Opened dedup ledger at {}", self.path.display());
        Ok(pool)
    }

    /// Record `names` as indexed. Names already present are left untouched.
    #[inline]
    pub async fn insert(&self, names: &BTreeSet<String>) -> Result<(), LedgerError> {
        if names.is_empty() {
            return Ok(());
        }
        let pool = self.pool().await?;

        let names: Vec<&String> = names.iter().collect();
        for chunk in names.chunks(MAX_NAMES_PER_STATEMENT) {
            let mut builder: QueryBuilder<'_, Sqlite> =
                QueryBuilder::new("INSERT OR IGNORE INTO indexed_tables (table_name) ");
            builder.push_values(chunk, |mut row, name| {
                row.push_bind(name.to_string());
            });

            builder
                .build()
                .execute(pool)
                .await
                .map_err(|e| LedgerError::Query(e.to_string()))?;
        }

        debug!("Recorded {} table names in ledger", names.len());
        Ok(())
    }

    /// Subset of `names` with no ledger entry.
    ///
    /// Fails only if the store cannot be opened. A failed lookup is logged and
    /// every name is reported as unseen, so a later pass can retry them.
    #[inline]
    pub async fn filter_unseen(
        &self,
        names: &BTreeSet<String>,
    ) -> Result<BTreeSet<String>, LedgerError> {
        if names.is_empty() {
            return Ok(BTreeSet::new());
        }
        let pool = self.pool().await?;

        match Self::lookup_seen(pool, names).await {
            Ok(seen) => Ok(names.difference(&seen).cloned().collect()),
            Err(e) => {
                warn!("Ledger lookup failed, treating all {} tables as unseen: {}", names.len(), e);
                Ok(names.clone())
            }
        }
    }

    async fn lookup_seen(
        pool: &SqlitePool,
        names: &BTreeSet<String>,
    ) -> Result<BTreeSet<String>, sqlx::Error> {
        let mut seen = BTreeSet::new();

        let names: Vec<&String> = names.iter().collect();
        for chunk in names.chunks(MAX_NAMES_PER_STATEMENT) {
            let mut builder: QueryBuilder<'_, Sqlite> =
                QueryBuilder::new("SELECT table_name FROM indexed_tables WHERE table_name IN (");
            let mut separated = builder.separated(", ");
            for name in chunk {
                separated.push_bind(name.to_string());
            }
            separated.push_unseparated(")");

            let found = builder
                .build_query_scalar::<String>()
                .fetch_all(pool)
                .await?;
            seen.extend(found);
        }

        Ok(seen)
    }

    /// Most recently indexed entries, newest first
    #[inline]
    pub async fn recent(&self, limit: u32) -> Result<Vec<LedgerEntry>, LedgerError> {
        let pool = self.pool().await?;
        sqlx::query_as::<_, LedgerEntry>(
            "SELECT id, table_name, indexed_at FROM indexed_tables ORDER BY id DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(pool)
        .await
        .map_err(|e| LedgerError::Query(e.to_string()))
    }

    #[inline]
    pub async fn count(&self) -> Result<i64, LedgerError> {
        let pool = self.pool().await?;
        sqlx::query_scalar("SELECT COUNT(*) FROM indexed_tables")
            .fetch_one(pool)
            .await
            .map_err(|e| LedgerError::Query(e.to_string()))
    }

    /// Release the shared connection if it was ever opened
    #[inline]
    pub async fn close(&self) {
        if let Some(pool) = self.pool.get() {
            pool.close().await;
            debug!("Closed dedup ledger");
        }
    }
}
