//! Server configuration loading from file and environment variables.
//!
//! The database keys live at the top level of the file under their
//! well-known `SQL_*` names:
//!
//! ```toml
//! SQL_DATABASE_URI = "sqlite:///app.db"
//! SQL_POOL_SIZE = 5
//! SQL_DATABASE_MODELS = ["sqlservice.kv"]
//!
//! [server]
//! port = 3000
//! ```

use serde::Deserialize;
use sqlservice_db::{ExecutionOptions, PragmaValue};
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};
use thiserror::Error;

/// Top-level server configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Server network settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Database extension settings (`SQL_*` keys).
    #[serde(flatten)]
    pub sql: SqlConfig,
}

/// Network configuration for the HTTP server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host address to bind to.
    #[serde(default = "default_host")]
    pub host: IpAddr,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "sqlservice::echo=info,warn").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

/// The raw `SQL_*` configuration mapping.
///
/// Every field is optional; `None` means "use the engine default". Values
/// are interpreted and validated by the extension initializer.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SqlConfig {
    #[serde(rename = "SQL_DATABASE_URI")]
    pub database_uri: Option<String>,

    /// Name of a model base registered in the host's catalog.
    #[serde(rename = "SQL_MODEL_CLASS")]
    pub model_class: Option<String>,

    /// `Session` or `ReadOnlySession`.
    #[serde(rename = "SQL_SESSION_CLASS")]
    pub session_class: Option<String>,

    #[serde(rename = "SQL_SESSION_OPTIONS")]
    pub session_options: Option<SessionOptionsConfig>,

    #[serde(rename = "SQL_AUTOFLUSH")]
    pub autoflush: Option<bool>,

    #[serde(rename = "SQL_EXPIRE_ON_COMMIT")]
    pub expire_on_commit: Option<bool>,

    #[serde(rename = "SQL_ISOLATION_LEVEL")]
    pub isolation_level: Option<String>,

    #[serde(rename = "SQL_POOL_SIZE")]
    pub pool_size: Option<u32>,

    /// Checkout timeout in seconds.
    #[serde(rename = "SQL_POOL_TIMEOUT")]
    pub pool_timeout: Option<u64>,

    /// Connection lifetime in seconds; zero or negative disables recycling.
    #[serde(rename = "SQL_POOL_RECYCLE")]
    pub pool_recycle: Option<i64>,

    #[serde(rename = "SQL_POOL_PRE_PING")]
    pub pool_pre_ping: Option<bool>,

    /// `QueuePool` or `StaticPool`.
    #[serde(rename = "SQL_POOL_CLASS")]
    pub pool_class: Option<String>,

    #[serde(rename = "SQL_MAX_OVERFLOW")]
    pub max_overflow: Option<u32>,

    #[serde(rename = "SQL_PARAM_STYLE")]
    pub param_style: Option<String>,

    #[serde(rename = "SQL_ENCODING")]
    pub encoding: Option<String>,

    #[serde(rename = "SQL_EXECUTION_OPTIONS")]
    pub execution_options: Option<ExecutionOptions>,

    #[serde(rename = "SQL_ECHO")]
    pub echo: Option<bool>,

    #[serde(rename = "SQL_ECHO_POOL")]
    pub echo_pool: Option<bool>,

    #[serde(rename = "SQL_ENGINE_OPTIONS")]
    pub engine_options: Option<BTreeMap<String, PragmaValue>>,

    /// Model module paths imported before tables are created.
    #[serde(rename = "SQL_DATABASE_MODELS", default)]
    pub database_models: Vec<String>,

    #[serde(rename = "SQL_EXTENSION_KEY")]
    pub extension_key: Option<String>,

    #[serde(rename = "SQL_CLI_GROUP")]
    pub cli_group: Option<String>,

    /// Name of a registered engine factory.
    #[serde(rename = "DATABASE_CLASS")]
    pub database_class: Option<String>,
}

/// `SQL_SESSION_OPTIONS` table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionOptionsConfig {
    pub autoflush: Option<bool>,
    pub expire_on_commit: Option<bool>,
    /// `deferred`, `immediate` or `exclusive`.
    pub transaction: Option<String>,
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
}

fn default_port() -> u16 {
    3000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Parses configuration from TOML text without consulting the environment.
pub fn parse_config(contents: &str) -> Result<Config, ConfigError> {
    Ok(toml::from_str(contents)?)
}

/// Loads configuration from a TOML file, falling back to defaults.
///
/// Environment variable overrides:
/// - `SQLSERVICE_HOST` overrides `server.host`
/// - `SQLSERVICE_PORT` overrides `server.port`
/// - `SQLSERVICE_LOG_LEVEL` overrides `logging.level`
/// - `SQLSERVICE_LOG_JSON` overrides `logging.json` (set to "true" to enable)
/// - `SQL_DATABASE_URI` overrides `SQL_DATABASE_URI`
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => parse_config(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = p, "config file not found, using defaults");
                Config::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };

    Ok(apply_env_overrides(config, |key| std::env::var(key).ok()))
}

/// Applies environment overrides using `lookup` to read variables.
pub fn apply_env_overrides<F>(mut config: Config, lookup: F) -> Config
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(host) = lookup("SQLSERVICE_HOST") {
        if let Ok(parsed) = host.parse() {
            config.server.host = parsed;
        }
    }
    if let Some(port) = lookup("SQLSERVICE_PORT") {
        if let Ok(parsed) = port.parse() {
            config.server.port = parsed;
        }
    }
    if let Some(level) = lookup("SQLSERVICE_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Some(json) = lookup("SQLSERVICE_LOG_JSON") {
        config.logging.json = json == "true" || json == "1";
    }
    if let Some(uri) = lookup("SQL_DATABASE_URI") {
        config.sql.database_uri = Some(uri);
    }
    config
}
