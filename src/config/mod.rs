//! Configuration management.
//!
//! Layered configuration loaded from:
//! 1. Default values (embedded in structs)
//! 2. TOML configuration file
//! 3. Environment variables (highest priority)
//!
//! By default the configuration is read from `config/fetchd.toml`; the path
//! can be overridden with the `FETCHD_CONFIG` environment variable. Any key
//! can be overridden with `FETCHD__<section>__<key>`, e.g.
//! `FETCHD__SERVER__BIND_ADDR=0.0.0.0:9000` or
//! `FETCHD__DOWNLOADS__MAX_RETRIES=5`.

mod models;
mod sources;

pub use models::{CallbacksConfig, Config, DownloadsConfig, ServerConfig};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    LoadError(#[from] config::ConfigError),
}

impl Config {
    /// Load configuration from all sources (file + environment).
    pub fn load() -> Result<Self, ConfigError> {
        Ok(sources::load()?)
    }

    /// Load configuration from a specific path.
    ///
    /// Useful for testing with custom configuration files.
    pub fn load_from_path(path: std::path::PathBuf) -> Result<Self, ConfigError> {
        Ok(sources::load_from_sources(path)?)
    }
}
