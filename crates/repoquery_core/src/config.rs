//! Layered configuration for the repository layer.
//!
//! Sources, highest priority first:
//! 1. Environment variables (`REPOQUERY_*`, `__` separates sections)
//! 2. `repoquery.toml` in the working directory (or an explicit file)
//! 3. Built-in defaults
//!
//! `REPOQUERY_QUERY__DEFAULT_TIMEOUT_MS=250` maps to `query.default_timeout_ms`.
//!
//! The actor provider and clock are not part of this file: they are wired in
//! code on [`crate::session::SessionBuilder`].

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

const CONFIG_FILE_NAME: &str = "repoquery.toml";
const ENV_PREFIX: &str = "REPOQUERY_";

/// Configuration loading failure.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Figment(#[from] Box<figment::Error>),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl From<figment::Error> for ConfigError {
    fn from(value: figment::Error) -> Self {
        Self::Figment(Box::new(value))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RepoConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub query: QueryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database file; `None` opens an in-memory store.
    pub path: Option<PathBuf>,
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: None,
            busy_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryConfig {
    /// Deadline applied to every statement when the caller gives none.
    pub default_timeout_ms: Option<u64>,
    /// Page sizes above this value are clamped.
    pub max_page_size: u32,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: None,
            max_page_size: 2_000,
        }
    }
}

impl QueryConfig {
    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    /// Absolute log directory; file logging stays off when unset.
    pub dir: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: crate::logging::default_log_level().to_string(),
            dir: None,
        }
    }
}

impl RepoConfig {
    /// Loads defaults, `repoquery.toml` when present, then environment.
    pub fn load() -> Result<Self, ConfigError> {
        extract(Self::figment(Path::new(CONFIG_FILE_NAME)))
    }

    /// Loads using an explicit TOML file instead of the working-directory one.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        extract(Self::figment(path.as_ref()))
    }

    /// Builds the provider chain. Public so tests can layer extra providers.
    pub fn figment(file: &Path) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));
        if file.exists() {
            figment = figment.merge(Toml::file(file));
        }
        figment.merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    fn validate(self) -> Result<Self, ConfigError> {
        if self.query.max_page_size == 0 {
            return Err(ConfigError::Invalid(
                "query.max_page_size must be greater than zero".to_string(),
            ));
        }
        if self.query.default_timeout_ms == Some(0) {
            return Err(ConfigError::Invalid(
                "query.default_timeout_ms must be greater than zero when set".to_string(),
            ));
        }
        Ok(self)
    }
}

fn extract(figment: Figment) -> Result<RepoConfig, ConfigError> {
    let config: RepoConfig = figment.extract()?;
    config.validate()
}
