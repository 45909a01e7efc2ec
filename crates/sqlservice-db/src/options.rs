//! Engine and session options.
//!
//! Every option has a named field and a documented default. String-valued
//! options parse through [`FromStr`] so that a misspelled value fails at
//! startup with an [`InvalidOption`] naming the configuration key.

use crate::error::InvalidOption;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Location of the SQLite database named by a `sqlite://` URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseUri {
    /// A private in-memory database (`sqlite://` or `sqlite:///:memory:`).
    Memory,
    /// A database file (`sqlite:///relative.db`, `sqlite:////abs/path.db`).
    File(PathBuf),
}

impl FromStr for DatabaseUri {
    type Err = InvalidOption;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || InvalidOption::new("SQL_DATABASE_URI", s);
        let rest = s.trim().strip_prefix("sqlite://").ok_or_else(invalid)?;
        match rest {
            "" | "/:memory:" => Ok(Self::Memory),
            _ => {
                let path = rest.strip_prefix('/').ok_or_else(invalid)?;
                if path.is_empty() {
                    return Err(invalid());
                }
                Ok(Self::File(PathBuf::from(path)))
            }
        }
    }
}

impl fmt::Display for DatabaseUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Memory => f.write_str("sqlite:///:memory:"),
            Self::File(path) => write!(f, "sqlite:///{}", path.display()),
        }
    }
}

/// Pool implementation choice (`SQL_POOL_CLASS`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PoolClass {
    /// Bounded pool of `pool_size` idle connections plus `max_overflow`.
    #[default]
    Queue,
    /// A single connection shared by every checkout in turn.
    Static,
}

impl FromStr for PoolClass {
    type Err = InvalidOption;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "QueuePool" | "queue" => Ok(Self::Queue),
            "StaticPool" | "static" => Ok(Self::Static),
            other => Err(InvalidOption::new("SQL_POOL_CLASS", other)),
        }
    }
}

/// Transaction isolation (`SQL_ISOLATION_LEVEL`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    #[default]
    Serializable,
    /// Only meaningful for shared-cache connections, which in-memory
    /// databases use.
    ReadUncommitted,
}

impl FromStr for IsolationLevel {
    type Err = InvalidOption;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().replace('_', " ").as_str() {
            "SERIALIZABLE" => Ok(Self::Serializable),
            "READ UNCOMMITTED" => Ok(Self::ReadUncommitted),
            _ => Err(InvalidOption::new("SQL_ISOLATION_LEVEL", s)),
        }
    }
}

/// Bind parameter style used when statements are generated (`SQL_PARAM_STYLE`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParamStyle {
    /// `?`
    #[default]
    Qmark,
    /// `?1`
    Numeric,
    /// `:p1`
    Named,
}

impl ParamStyle {
    /// Placeholder for the 1-based parameter `index`.
    pub fn placeholder(self, index: usize) -> String {
        match self {
            Self::Qmark => "?".to_string(),
            Self::Numeric => format!("?{index}"),
            Self::Named => format!(":p{index}"),
        }
    }
}

impl FromStr for ParamStyle {
    type Err = InvalidOption;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "qmark" => Ok(Self::Qmark),
            "numeric" => Ok(Self::Numeric),
            "named" => Ok(Self::Named),
            other => Err(InvalidOption::new("SQL_PARAM_STYLE", other)),
        }
    }
}

/// Text encoding for newly created databases (`SQL_ENCODING`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encoding {
    #[default]
    Utf8,
    Utf16,
    Utf16le,
    Utf16be,
}

impl Encoding {
    pub(crate) fn pragma_value(self) -> &'static str {
        match self {
            Self::Utf8 => "UTF-8",
            Self::Utf16 => "UTF-16",
            Self::Utf16le => "UTF-16le",
            Self::Utf16be => "UTF-16be",
        }
    }
}

impl FromStr for Encoding {
    type Err = InvalidOption;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "utf-8" | "utf8" => Ok(Self::Utf8),
            "utf-16" | "utf16" => Ok(Self::Utf16),
            "utf-16le" => Ok(Self::Utf16le),
            "utf-16be" => Ok(Self::Utf16be),
            _ => Err(InvalidOption::new("SQL_ENCODING", s)),
        }
    }
}

/// How a session begins its transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactionBehavior {
    #[default]
    Deferred,
    Immediate,
    Exclusive,
}

impl TransactionBehavior {
    pub(crate) fn begin_statement(self) -> &'static str {
        match self {
            Self::Deferred => "BEGIN DEFERRED",
            Self::Immediate => "BEGIN IMMEDIATE",
            Self::Exclusive => "BEGIN EXCLUSIVE",
        }
    }
}

impl FromStr for TransactionBehavior {
    type Err = InvalidOption;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "deferred" => Ok(Self::Deferred),
            "immediate" => Ok(Self::Immediate),
            "exclusive" => Ok(Self::Exclusive),
            _ => Err(InvalidOption::new("SQL_SESSION_OPTIONS.transaction", s)),
        }
    }
}

/// Which kind of session the engine hands out (`SQL_SESSION_CLASS`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionClass {
    #[default]
    Session,
    /// Sessions that refuse writes (`PRAGMA query_only`).
    ReadOnly,
}

impl FromStr for SessionClass {
    type Err = InvalidOption;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Session" => Ok(Self::Session),
            "ReadOnlySession" => Ok(Self::ReadOnly),
            other => Err(InvalidOption::new("SQL_SESSION_CLASS", other)),
        }
    }
}

/// Per-session behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
    /// Flush pending writes before every query. Default: `true`.
    pub autoflush: bool,
    /// Clear the identity map after every commit. Default: `true`.
    pub expire_on_commit: bool,
    /// How the lazily started transaction begins. Default: deferred.
    pub transaction: TransactionBehavior,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            autoflush: true,
            expire_on_commit: true,
            transaction: TransactionBehavior::Deferred,
        }
    }
}

/// Connection-level settings applied through the rusqlite API
/// (`SQL_EXECUTION_OPTIONS`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExecutionOptions {
    /// How long a statement waits on a locked database, in milliseconds.
    pub busy_timeout_ms: Option<u64>,
    /// Capacity of rusqlite's prepared statement cache.
    pub statement_cache_capacity: Option<usize>,
    /// Enforce foreign key constraints.
    pub foreign_keys: Option<bool>,
}

/// A value in `SQL_ENGINE_OPTIONS`, written as `PRAGMA name = value`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum PragmaValue {
    Bool(bool),
    Integer(i64),
    Text(String),
}

impl PragmaValue {
    fn to_sql(&self) -> String {
        match self {
            Self::Bool(b) => if *b { "ON" } else { "OFF" }.to_string(),
            Self::Integer(i) => i.to_string(),
            Self::Text(s) => format!("'{}'", s.replace('\'', "''")),
        }
    }
}

/// Builds `PRAGMA name = value;`, rejecting names that are not plain
/// identifiers.
pub(crate) fn pragma_statement(name: &str, value: &PragmaValue) -> Result<String, InvalidOption> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit());
    if !valid {
        return Err(InvalidOption::new("SQL_ENGINE_OPTIONS", name));
    }
    Ok(format!("PRAGMA {name} = {};", value.to_sql()))
}

/// Pool and connection settings for the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineOptions {
    /// Idle connections kept by the pool. Default: 5.
    pub pool_size: u32,
    /// Connections allowed beyond `pool_size` under load. Default: 10.
    pub max_overflow: u32,
    /// Checkout timeout. Default: 30 seconds.
    pub pool_timeout: Duration,
    /// Maximum connection lifetime; `None` keeps connections forever.
    pub pool_recycle: Option<Duration>,
    /// Validate connections on checkout. Default: `false`.
    pub pool_pre_ping: bool,
    pub pool_class: PoolClass,
    pub isolation_level: IsolationLevel,
    pub param_style: ParamStyle,
    pub encoding: Encoding,
    pub execution_options: ExecutionOptions,
    /// Log every statement under the `sqlservice::echo` target.
    pub echo: bool,
    /// Log pool events under the `sqlservice::pool` target.
    pub echo_pool: bool,
    /// Raw pragmas applied to every new connection.
    pub engine_options: BTreeMap<String, PragmaValue>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            pool_size: 5,
            max_overflow: 10,
            pool_timeout: Duration::from_secs(30),
            pool_recycle: None,
            pool_pre_ping: false,
            pool_class: PoolClass::Queue,
            isolation_level: IsolationLevel::Serializable,
            param_style: ParamStyle::Qmark,
            encoding: Encoding::Utf8,
            execution_options: ExecutionOptions::default(),
            echo: false,
            echo_pool: false,
            engine_options: BTreeMap::new(),
        }
    }
}
