use thiserror::Error;

use crate::config::ConfigError;
use crate::database::SourceError;
use crate::embeddings::EmbedError;
use crate::ledger::LedgerError;
use crate::mcp::McpError;
use crate::vector::VectorError;

pub type Result<T> = std::result::Result<T, SchemaMcpError>;

#[derive(Error, Debug)]
pub enum SchemaMcpError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Connectivity error: {0}")]
    Connectivity(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("MCP error: {0}")]
    Mcp(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl From<ConfigError> for SchemaMcpError {
    #[inline]
    fn from(error: ConfigError) -> Self {
        Self::Config(error.to_string())
    }
}

impl From<EmbedError> for SchemaMcpError {
    #[inline]
    fn from(error: EmbedError) -> Self {
        match error {
            EmbedError::ConfigMissing(_) => Self::Config(error.to_string()),
            EmbedError::InvalidInput => Self::InvalidInput(error.to_string()),
            EmbedError::Transport(_) => Self::Connectivity(error.to_string()),
            EmbedError::Upstream { .. } => Self::Upstream(error.to_string()),
            EmbedError::Decode(_) => Self::Decode(error.to_string()),
        }
    }
}

impl From<VectorError> for SchemaMcpError {
    #[inline]
    fn from(error: VectorError) -> Self {
        match error {
            VectorError::InvalidInput(_) => Self::InvalidInput(error.to_string()),
            VectorError::Transport(_) | VectorError::Timeout { .. } => {
                Self::Connectivity(error.to_string())
            }
            VectorError::Upstream { .. } => Self::Upstream(error.to_string()),
            VectorError::Decode(_) => Self::Decode(error.to_string()),
        }
    }
}

impl From<SourceError> for SchemaMcpError {
    #[inline]
    fn from(error: SourceError) -> Self {
        match error {
            SourceError::Connect(_) => Self::Connectivity(error.to_string()),
            SourceError::UnsupportedUrl(_) => Self::Config(error.to_string()),
            SourceError::TableNotFound(_) | SourceError::Query(_) => {
                Self::Database(error.to_string())
            }
            SourceError::Encode(_) => Self::Decode(error.to_string()),
        }
    }
}

impl From<LedgerError> for SchemaMcpError {
    #[inline]
    fn from(error: LedgerError) -> Self {
        Self::Database(error.to_string())
    }
}

impl From<McpError> for SchemaMcpError {
    #[inline]
    fn from(error: McpError) -> Self {
        Self::Mcp(error.to_string())
    }
}

pub mod commands;
pub mod config;
pub mod database;
pub mod embeddings;
pub mod indexer;
pub mod ledger;
pub mod mcp;
pub mod query;
pub mod schema;
#[cfg(test)]
pub(crate) mod test_support;
pub mod vector;
