//! Error types for the database layer.

use thiserror::Error;

/// An option value that could not be interpreted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid value for {option}: {value:?}")]
pub struct InvalidOption {
    /// The option (configuration key) that was rejected.
    pub option: &'static str,
    /// The rejected value, as written.
    pub value: String,
}

impl InvalidOption {
    pub(crate) fn new(option: &'static str, value: impl Into<String>) -> Self {
        Self {
            option,
            value: value.into(),
        }
    }
}

/// Errors produced by the engine handle and its sessions.
#[derive(Debug, Error)]
pub enum DbError {
    /// Failed to build the connection pool.
    #[error("failed to create database connection pool: {0}")]
    PoolInit(#[source] r2d2::Error),

    /// Failed to check a connection out of the pool.
    #[error("failed to check out a database connection: {0}")]
    Checkout(#[source] r2d2::Error),

    /// A SQLite operation failed.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// An option could not be applied.
    #[error(transparent)]
    InvalidOption(#[from] InvalidOption),

    /// The session was used after it was closed.
    #[error("session is closed")]
    SessionClosed,

    /// `get` was called for a table the model base does not know.
    #[error("table is not registered with model base '{base}': {table}")]
    UnknownTable {
        /// The model base that was searched.
        base: String,
        /// The requested table.
        table: String,
    },

    /// A model module path has no registered loader.
    #[error("unknown model module: {0}")]
    UnknownModelModule(String),
}
