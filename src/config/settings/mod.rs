
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;

pub const CONFIG_DIR_ENV: &str = "SCHEMA_MCP_CONFIG_DIR";
pub const DEFAULT_EMBEDDING_DIMENSION: u32 = 1024;

const REDACTED: &str = "********";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub vector: VectorConfig,
    #[serde(default)]
    pub indexer: IndexerConfig,
    #[serde(skip)]
    pub base_dir: PathBuf,
}

/// Relational source settings. Either `url` or the individual parts must be set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DatabaseConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<String>,
    pub max_connections: u32,
    pub max_lifetime_secs: u64,
    pub idle_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub query_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            user: None,
            password: None,
            host: None,
            port: 3306,
            name: None,
            params: None,
            max_connections: 10,
            max_lifetime_secs: 300,
            idle_timeout_secs: 120,
            connect_timeout_secs: 10,
            query_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EmbeddingConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    pub model: String,
    pub dimension: u32,
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            url: None,
            token: None,
            model: "BAAI/bge-m3".to_string(),
            dimension: DEFAULT_EMBEDDING_DIMENSION,
            timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VectorConfig {
    pub protocol: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub collection: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    pub timeout_secs: u64,
    /// Upper bound for waiting on index builds and collection loads
    pub ready_timeout_secs: u64,
}

impl Default for VectorConfig {
    fn default() -> Self {
        Self {
            protocol: "http".to_string(),
            host: None,
            port: 19530,
            collection: None,
            token: None,
            timeout_secs: 30,
            ready_timeout_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IndexerConfig {
    pub concurrency: usize,
    pub batch_size: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reindex_interval_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ledger_path: Option<PathBuf>,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            batch_size: 10,
            reindex_interval_secs: None,
            ledger_path: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration directory not found or could not be created")]
    DirectoryError,
    #[error("Missing required settings: {}", .0.join(", "))]
    MissingFields(Vec<String>),
    #[error("Invalid value for {key}: {value}")]
    InvalidEnvValue { key: String, value: String },
    #[error("Invalid URL format: {0}")]
    InvalidUrl(String),
    #[error("Invalid port for {0}: must be between 1 and 65535")]
    InvalidPort(&'static str),
    #[error("Invalid protocol: {0} (must be 'http' or 'https')")]
    InvalidProtocol(String),
    #[error("Invalid model name: {0} (cannot be empty)")]
    InvalidModel(String),
    #[error("Invalid embedding dimension: {0} (must be between 64 and 4096)")]
    InvalidEmbeddingDimension(u32),
    #[error("Invalid indexer concurrency: {0} (must be between 1 and 64)")]
    InvalidConcurrency(usize),
    #[error("Invalid indexer batch size: {0} (must be between 1 and 1000)")]
    InvalidBatchSize(usize),
    #[error("Invalid re-index interval: {0} seconds (must be at least 10)")]
    InvalidReindexInterval(u64),
    #[error("Invalid connection pool size: {0} (must be between 1 and 100)")]
    InvalidPoolSize(u32),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

impl Config {
    /// Load configuration from the default config directory and the process environment
    #[inline]
    pub fn load() -> Result<Self> {
        let config_dir = Self::config_dir().context("Failed to resolve config directory")?;
        Self::load_from(config_dir, |key| std::env::var(key).ok())
    }

    /// Load configuration from `config_dir/config.toml` (if present), then apply
    /// overrides from `lookup` and validate the result
    #[inline]
    pub fn load_from<P, F>(config_dir: P, lookup: F) -> Result<Self>
    where
        P: AsRef<Path>,
        F: Fn(&str) -> Option<String>,
    {
        let config_path = config_dir.as_ref().join("config.toml");

        let mut config = if config_path.exists() {
            let content = fs::read_to_string(&config_path).with_context(|| {
                format!("Failed to read config file: {}", config_path.display())
            })?;
            toml::from_str::<Config>(&content).with_context(|| {
                format!("Failed to parse config file: {}", config_path.display())
            })?
        } else {
            Self::default()
        };
        config.base_dir = config_dir.as_ref().to_path_buf();

        config
            .apply_env_with(lookup)
            .context("Invalid environment override")?;

        config
            .validate()
            .with_context(|| "Configuration validation failed")?;

        Ok(config)
    }

    #[inline]
    pub fn config_dir() -> Result<PathBuf, ConfigError> {
        if let Some(dir) = std::env::var_os(CONFIG_DIR_ENV) {
            return Ok(PathBuf::from(dir));
        }
        dirs::config_dir()
            .map(|dir| dir.join("schema-mcp"))
            .ok_or(ConfigError::DirectoryError)
    }

    /// Overlay environment-style settings onto the current values
    #[inline]
    pub fn apply_env_with<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(url) = get("DATABASE_URL") {
            self.database.url = Some(url);
        }
        if let Some(user) = get("DB_USER") {
            self.database.user = Some(user);
        }
        if let Some(password) = lookup("DB_PASSWORD") {
            self.database.password = Some(password);
        }
        if let Some(host) = get("DB_HOST") {
            self.database.host = Some(host);
        }
        if let Some(port) = get("DB_PORT") {
            self.database.port = parse_env("DB_PORT", &port)?;
        }
        if let Some(name) = get("DB_NAME") {
            self.database.name = Some(name);
        }
        if let Some(params) = get("DB_PARAMS") {
            self.database.params = Some(params);
        }

        if let Some(url) = get("EMBEDDING_URL") {
            self.embedding.url = Some(url);
        }
        if let Some(token) = get("EMBEDDING_TOKEN") {
            self.embedding.token = Some(token);
        }
        if let Some(model) = get("EMBEDDING_MODEL") {
            self.embedding.model = model;
        }

        if let Some(host) = get("MILVUS_HOST") {
            self.vector.host = Some(host);
        }
        if let Some(port) = get("MILVUS_PORT") {
            self.vector.port = parse_env("MILVUS_PORT", &port)?;
        }
        if let Some(collection) = get("MILVUS_COLLECTION") {
            self.vector.collection = Some(collection);
        }
        if let Some(token) = get("MILVUS_TOKEN") {
            self.vector.token = Some(token);
        }

        if let Some(concurrency) = get("INDEX_CONCURRENCY") {
            self.indexer.concurrency = parse_env("INDEX_CONCURRENCY", &concurrency)?;
        }
        if let Some(interval) = get("REINDEX_INTERVAL_SECS") {
            let secs: u64 = parse_env("REINDEX_INTERVAL_SECS", &interval)?;
            self.indexer.reindex_interval_secs = (secs > 0).then_some(secs);
        }
        if let Some(path) = get("LEDGER_PATH") {
            self.indexer.ledger_path = Some(PathBuf::from(path));
        }

        Ok(())
    }

    /// Validate the configuration, reporting every missing required field at once
    #[inline]
    pub fn validate(&self) -> Result<(), ConfigError> {
        let missing = self.missing_fields();
        if !missing.is_empty() {
            return Err(ConfigError::MissingFields(missing));
        }

        if self.database.port == 0 {
            return Err(ConfigError::InvalidPort("DB_PORT"));
        }
        if !(1..=100).contains(&self.database.max_connections) {
            return Err(ConfigError::InvalidPoolSize(self.database.max_connections));
        }
        self.connection_url()?;

        self.embedding.validate()?;
        self.vector.validate()?;
        self.indexer.validate()?;

        Ok(())
    }

    fn missing_fields(&self) -> Vec<String> {
        let mut missing = Vec::new();
        let is_unset =
            |value: &Option<String>| value.as_deref().is_none_or(|v| v.trim().is_empty());

        if is_unset(&self.database.url) {
            if is_unset(&self.database.user) {
                missing.push("DB_USER".to_string());
            }
            if is_unset(&self.database.host) {
                missing.push("DB_HOST".to_string());
            }
            if is_unset(&self.database.name) {
                missing.push("DB_NAME".to_string());
            }
        }
        if is_unset(&self.embedding.url) {
            missing.push("EMBEDDING_URL".to_string());
        }
        if is_unset(&self.embedding.token) {
            missing.push("EMBEDDING_TOKEN".to_string());
        }
        if is_unset(&self.vector.host) {
            missing.push("MILVUS_HOST".to_string());
        }
        if is_unset(&self.vector.collection) {
            missing.push("MILVUS_COLLECTION".to_string());
        }

        missing
    }

    /// Connection string for the relational source, either given verbatim or
    /// assembled from the individual parts as a MySQL URL
    #[inline]
    pub fn connection_url(&self) -> Result<String, ConfigError> {
        self.database.connection_url()
    }

    #[inline]
    pub fn vector_url(&self) -> Result<Url, ConfigError> {
        self.vector.base_url()
    }

    /// Get the base directory for the application
    #[inline]
    pub fn get_base_dir(&self) -> &Path {
        &self.base_dir
    }

    #[inline]
    pub fn config_file_path(&self) -> PathBuf {
        self.get_base_dir().join("config.toml")
    }

    /// Get the path for the dedup ledger SQLite file
    #[inline]
    pub fn ledger_path(&self) -> PathBuf {
        self.indexer
            .ledger_path
            .clone()
            .unwrap_or_else(|| self.get_base_dir().join("schema.db"))
    }

    #[inline]
    pub fn reindex_interval(&self) -> Option<Duration> {
        self.indexer.reindex_interval_secs.map(Duration::from_secs)
    }

    /// Copy of the configuration with credentials masked, for display
    #[inline]
    pub fn redacted(&self) -> Self {
        let mut config = self.clone();
        let mask = |value: &mut Option<String>| {
            if value.is_some() {
                *value = Some(REDACTED.to_string());
            }
        };
        mask(&mut config.database.password);
        mask(&mut config.embedding.token);
        mask(&mut config.vector.token);
        if let Some(url) = config.database.url.as_deref().and_then(|u| Url::parse(u).ok()) {
            if url.password().is_some() {
                let mut masked = url;
                let _ = masked.set_password(Some(REDACTED));
                config.database.url = Some(masked.to_string());
            }
        }
        config
    }

    #[inline]
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }
}

impl DatabaseConfig {
    #[inline]
    pub fn connection_url(&self) -> Result<String, ConfigError> {
        if let Some(url) = self.url.as_deref().filter(|u| !u.trim().is_empty()) {
            return Ok(url.to_string());
        }

        let host = self.host.as_deref().unwrap_or_default();
        let name = self.name.as_deref().unwrap_or_default();
        let base = format!("mysql://{}:{}/{}", host, self.port, name);
        let mut url = Url::parse(&base).map_err(|_| ConfigError::InvalidUrl(base.clone()))?;

        if let Some(user) = self.user.as_deref() {
            url.set_username(user)
                .map_err(|()| ConfigError::InvalidUrl(base.clone()))?;
        }
        if let Some(password) = self.password.as_deref().filter(|p| !p.is_empty()) {
            url.set_password(Some(password))
                .map_err(|()| ConfigError::InvalidUrl(base.clone()))?;
        }
        url.set_query(self.params.as_deref());

        Ok(url.into())
    }

    #[inline]
    pub fn max_lifetime(&self) -> Duration {
        Duration::from_secs(self.max_lifetime_secs)
    }

    #[inline]
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    #[inline]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    #[inline]
    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }
}

impl EmbeddingConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(url) = self.url.as_deref() {
            Url::parse(url).map_err(|_| ConfigError::InvalidUrl(url.to_string()))?;
        }

        if self.model.trim().is_empty() {
            return Err(ConfigError::InvalidModel(self.model.clone()));
        }

        if !(64..=4096).contains(&self.dimension) {
            return Err(ConfigError::InvalidEmbeddingDimension(self.dimension));
        }

        Ok(())
    }

    #[inline]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl VectorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.protocol != "http" && self.protocol != "https" {
            return Err(ConfigError::InvalidProtocol(self.protocol.clone()));
        }

        if self.port == 0 {
            return Err(ConfigError::InvalidPort("MILVUS_PORT"));
        }

        self.base_url()?;
        Ok(())
    }

    pub fn base_url(&self) -> Result<Url, ConfigError> {
        let host = self.host.as_deref().unwrap_or("localhost");
        let url_str = format!("{}://{}:{}", self.protocol, host, self.port);
        Url::parse(&url_str).map_err(|_| ConfigError::InvalidUrl(url_str))
    }

    #[inline]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    #[inline]
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }
}

impl IndexerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=64).contains(&self.concurrency) {
            return Err(ConfigError::InvalidConcurrency(self.concurrency));
        }

        if !(1..=1000).contains(&self.batch_size) {
            return Err(ConfigError::InvalidBatchSize(self.batch_size));
        }

        if let Some(secs) = self.reindex_interval_secs {
            if secs < 10 {
                return Err(ConfigError::InvalidReindexInterval(secs));
            }
        }

        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidEnvValue {
            key: key.to_string(),
            value: value.to_string(),
        })
}
