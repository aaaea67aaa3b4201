// Configuration management module
// Settings are read from an optional TOML file and overridden by the environment

pub mod settings;

pub use settings::{
    Config, ConfigError, DatabaseConfig, EmbeddingConfig, IndexerConfig, VectorConfig,
};

/// Get the configuration directory path
#[inline]
pub fn get_config_dir() -> Result<std::path::PathBuf, ConfigError> {
    Config::config_dir()
}
