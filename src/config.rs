//! Configuration module for tickpipe.
//!
//! Loads configuration from TOML files with environment variable
//! substitution. All destination identifiers (stream name, document table,
//! database connection string) are fixed here at startup; there is no
//! runtime schema negotiation.
//!
//! # Example
//!
//! ```toml
//! [server]
//! port = 3000
//!
//! [redis]
//! url = "${REDIS_URL}"
//!
//! [sinks.stream]
//! stream = "tickpipe:ticks"
//!
//! [sinks.relational]
//! url = "${DATABASE_URL}"
//! ```

use crate::dispatcher::Dispatcher;
use crate::sinks::{DocumentStoreSink, RelationalSink, StreamSink};
use regex::Regex;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// Root configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct TickpipeConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub redis: RedisConfig,

    #[serde(default)]
    pub worker: WorkerConfig,

    #[serde(default)]
    pub sinks: SinksConfig,
}

/// Ingest server configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub api_key: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            api_key: None,
        }
    }
}

fn default_port() -> u16 {
    3000
}

/// Redis configuration (intake stream and Redis-backed sinks)
#[derive(Debug, Deserialize, Clone)]
pub struct RedisConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

/// Worker configuration
#[derive(Debug, Deserialize, Clone)]
pub struct WorkerConfig {
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default = "default_consumer_group")]
    pub consumer_group: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: None,
            consumer_group: default_consumer_group(),
        }
    }
}

fn default_consumer_group() -> String {
    crate::DEFAULT_CONSUMER_GROUP.to_string()
}

/// Sink destinations container
#[derive(Debug, Deserialize, Clone, Default)]
pub struct SinksConfig {
    #[serde(default)]
    pub stream: StreamSinkConfig,

    #[serde(default)]
    pub document: DocumentSinkConfig,

    #[serde(default)]
    pub relational: RelationalSinkConfig,
}

/// Stream sink destination
#[derive(Debug, Deserialize, Clone)]
pub struct StreamSinkConfig {
    #[serde(default = "default_tick_stream")]
    pub stream: String,
}

impl Default for StreamSinkConfig {
    fn default() -> Self {
        Self {
            stream: default_tick_stream(),
        }
    }
}

fn default_tick_stream() -> String {
    "tickpipe:ticks".to_string()
}

/// Document store sink destination
#[derive(Debug, Deserialize, Clone)]
pub struct DocumentSinkConfig {
    #[serde(default = "default_document_table")]
    pub table: String,
}

impl Default for DocumentSinkConfig {
    fn default() -> Self {
        Self {
            table: default_document_table(),
        }
    }
}

fn default_document_table() -> String {
    "tickpipe:documents".to_string()
}

/// Relational sink destination
#[derive(Debug, Deserialize, Clone)]
pub struct RelationalSinkConfig {
    /// Postgres connection string; usually "${DATABASE_URL}" in the file
    #[serde(default)]
    pub url: Option<String>,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for RelationalSinkConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: default_max_connections(),
        }
    }
}

fn default_max_connections() -> u32 {
    5
}

impl TickpipeConfig {
    /// Build a Dispatcher over the configured sink destinations.
    ///
    /// Connection pools are created and owned by the caller; the sinks
    /// only hold handles.
    pub fn build_dispatcher(
        &self,
        redis_pool: deadpool_redis::Pool,
        pg_pool: sqlx::PgPool,
    ) -> Dispatcher {
        Dispatcher::new(
            Arc::new(StreamSink::new(
                redis_pool.clone(),
                &self.sinks.stream.stream,
            )),
            Arc::new(DocumentStoreSink::new(
                redis_pool,
                &self.sinks.document.table,
            )),
            Arc::new(RelationalSink::new(pg_pool)),
        )
    }

    /// Resolve the relational database URL, falling back to DATABASE_URL.
    pub fn database_url(&self) -> Option<String> {
        self.sinks
            .relational
            .url
            .clone()
            .filter(|url| !url.is_empty() && !url.contains("${"))
            .or_else(|| env::var("DATABASE_URL").ok())
    }

    /// Load configuration from the default path or TICKPIPE_CONFIG env var.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path =
            env::var("TICKPIPE_CONFIG").unwrap_or_else(|_| "config/tickpipe.toml".to_string());

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            info!(
                path = %path.display(),
                "Config file not found, using defaults"
            );
            return Ok(Self::default());
        }

        info!(path = %path.display(), "Loading configuration");

        let content = fs::read_to_string(path)?;
        let content = substitute_env_vars(&content);

        debug!("Parsing TOML configuration");
        let config: TickpipeConfig = toml::from_str(&content)?;

        config.validate()?;

        info!(
            tick_stream = %config.sinks.stream.stream,
            document_table = %config.sinks.document.table,
            consumer_group = %config.worker.consumer_group,
            "Configuration loaded"
        );

        Ok(config)
    }

    /// Validate the configuration
    fn validate(&self) -> Result<(), ConfigError> {
        if self.sinks.stream.stream.is_empty() {
            return Err(ConfigError::ValidationError(
                "Stream sink destination must not be empty".to_string(),
            ));
        }

        if self.sinks.document.table.is_empty() {
            return Err(ConfigError::ValidationError(
                "Document sink table must not be empty".to_string(),
            ));
        }

        if let Some(url) = &self.sinks.relational.url {
            if url.contains("${") {
                warn!(
                    url = %url,
                    "Relational sink URL contains unsubstituted environment variable"
                );
            } else if !url.starts_with("postgres://") && !url.starts_with("postgresql://") {
                return Err(ConfigError::ValidationError(format!(
                    "Relational sink URL must be a postgres:// connection string, got '{}'",
                    url
                )));
            }
        }

        if self.sinks.relational.max_connections == 0 {
            return Err(ConfigError::ValidationError(
                "Relational sink max_connections must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(content: &str) -> String {
    let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap();

    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        match env::var(var_name) {
            Ok(value) => value,
            Err(_) => {
                debug!(var = %var_name, "Environment variable not set, keeping placeholder");
                caps[0].to_string()
            }
        }
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_var_substitution() {
        env::set_var("TICKPIPE_TEST_VAR", "substituted_value");
        let input = "url = \"${TICKPIPE_TEST_VAR}\"";
        let output = substitute_env_vars(input);
        assert_eq!(output, "url = \"substituted_value\"");
        env::remove_var("TICKPIPE_TEST_VAR");
    }

    #[test]
    fn test_env_var_not_set() {
        let input = "url = \"${TICKPIPE_NONEXISTENT_VAR}\"";
        let output = substitute_env_vars(input);
        assert_eq!(output, "url = \"${TICKPIPE_NONEXISTENT_VAR}\"");
    }

    #[test]
    fn test_parse_minimal_config() {
        let toml = r#"
            [server]
            port = 4000
        "#;

        let config: TickpipeConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.server.port, 4000);
        assert_eq!(config.redis.url, "redis://localhost:6379");
        assert_eq!(config.sinks.stream.stream, "tickpipe:ticks");
    }

    #[test]
    fn test_parse_sink_destinations() {
        let toml = r#"
            [sinks.stream]
            stream = "market:ticks"

            [sinks.document]
            table = "market:signals"

            [sinks.relational]
            url = "postgres://localhost/market"
            max_connections = 10
        "#;

        let config: TickpipeConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.sinks.stream.stream, "market:ticks");
        assert_eq!(config.sinks.document.table, "market:signals");
        assert_eq!(
            config.sinks.relational.url.as_deref(),
            Some("postgres://localhost/market")
        );
        assert_eq!(config.sinks.relational.max_connections, 10);
    }

    #[test]
    fn test_default_config() {
        let config = TickpipeConfig::default();
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.worker.consumer_group, "tickpipe_workers");
        assert_eq!(config.sinks.document.table, "tickpipe:documents");
        assert_eq!(config.sinks.relational.max_connections, 5);
    }

    #[test]
    fn test_validation_rejects_bad_database_url() {
        let toml = r#"
            [sinks.relational]
            url = "mysql://localhost/market"
        "#;

        let config: TickpipeConfig = toml::from_str(toml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_empty_stream() {
        let toml = r#"
            [sinks.stream]
            stream = ""
        "#;

        let config: TickpipeConfig = toml::from_str(toml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_zero_connections() {
        let toml = r#"
            [sinks.relational]
            max_connections = 0
        "#;

        let config: TickpipeConfig = toml::from_str(toml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unsubstituted_url_is_not_usable() {
        let toml = r#"
            [sinks.relational]
            url = "${TICKPIPE_UNSET_DB_URL}"
        "#;

        let config: TickpipeConfig = toml::from_str(toml).unwrap();
        // placeholder survives parsing but is not treated as a usable URL
        assert!(config.validate().is_ok());
        assert!(config
            .sinks
            .relational
            .url
            .as_deref()
            .unwrap()
            .contains("${"));
    }
}
