//! Storage configuration
//!
//! Loaded from a TOML file with a `[storage]` table:
//!
//! ```toml
//! [storage]
//! backend = "postgres"
//! log_queries = true
//!
//! [storage.postgres]
//! username = "aggregator"
//! password = "secret"
//! host = "localhost"
//! port = 5432
//! db_name = "aggregator"
//! params = "sslmode=disable"
//! ```
//!
//! For SQLite, `data_source` is a file path (or a full `sqlite:` URL).

use crate::dialect::Backend;
use crate::error::{Result, StorageError};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Environment variable overriding the configuration file path.
pub const CONFIG_FILE_ENV: &str = "AGGREGATOR_STORAGE_CONFIG";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Database engine
    pub backend: Backend,

    /// SQLite path or full connection URL
    #[serde(default)]
    pub data_source: String,

    /// Log every SQL statement through tracing
    #[serde(default)]
    pub log_queries: bool,

    /// Pool size
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// PostgreSQL connection parts, used when `data_source` is empty
    #[serde(default)]
    pub postgres: Option<PostgresConfig>,
}

fn default_max_connections() -> u32 {
    10
}

#[derive(Debug, Clone, Deserialize)]
pub struct PostgresConfig {
    pub username: String,
    #[serde(default)]
    pub password: String,
    pub host: String,
    #[serde(default = "default_pg_port")]
    pub port: u16,
    pub db_name: String,
    #[serde(default)]
    pub params: String,
}

fn default_pg_port() -> u16 {
    5432
}

impl PostgresConfig {
    pub fn url(&self) -> String {
        let mut url = format!(
            "postgresql://{}:{}@{}:{}/{}",
            self.username, self.password, self.host, self.port, self.db_name
        );
        if !self.params.is_empty() {
            url.push('?');
            url.push_str(&self.params);
        }
        url
    }
}

impl StorageConfig {
    /// SQLite config for a database file, mostly useful in tests and tools.
    pub fn sqlite(path: impl AsRef<Path>) -> Self {
        Self {
            backend: Backend::Sqlite,
            data_source: path.as_ref().display().to_string(),
            log_queries: false,
            max_connections: default_max_connections(),
            postgres: None,
        }
    }

    /// PostgreSQL config for a full connection URL.
    pub fn postgres(url: impl Into<String>) -> Self {
        Self {
            backend: Backend::Postgres,
            data_source: url.into(),
            log_queries: false,
            max_connections: 20,
            postgres: None,
        }
    }

    /// Connection URL understood by the pooled driver.
    pub fn connection_string(&self) -> Result<String> {
        match self.backend {
            Backend::Sqlite => {
                if self.data_source.is_empty() {
                    return Err(StorageError::Config(
                        "sqlite data_source is not set".to_string(),
                    ));
                }
                if self.data_source.starts_with("sqlite:") {
                    Ok(self.data_source.clone())
                } else {
                    Ok(format!("sqlite://{}?mode=rwc", self.data_source))
                }
            }
            Backend::Postgres => {
                if !self.data_source.is_empty() {
                    return Ok(self.data_source.clone());
                }
                self.postgres.as_ref().map(PostgresConfig::url).ok_or_else(|| {
                    StorageError::Config(
                        "postgres backend needs data_source or a [storage.postgres] table"
                            .to_string(),
                    )
                })
            }
        }
    }
}

impl Config {
    pub fn from_toml(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|e| StorageError::Config(e.to_string()))
    }

    /// Load config from file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            StorageError::Config(format!("unable to read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&contents)
    }

    /// Load config from the file named by `AGGREGATOR_STORAGE_CONFIG`, or `default_path`.
    pub fn load_from_env(default_path: impl AsRef<Path>) -> Result<Self> {
        let path = std::env::var(CONFIG_FILE_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_path.as_ref().to_path_buf());
        Self::load(path)
    }
}
