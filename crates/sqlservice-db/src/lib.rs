//! Database layer for sqlservice.
//!
//! Provides the long-lived engine handle ([`Database`]) that owns an `r2d2`
//! pool of SQLite connections, the short-lived unit-of-work [`Session`]
//! handed out per request, and the model metadata ([`ModelBase`],
//! [`ModelCatalog`]) used to create and drop tables.
//!
//! # Design decisions
//!
//! - **One explicit options structure**: [`DatabaseOptions`] carries every
//!   engine and session setting with named fields and documented defaults.
//!   Parsing from configuration strings happens once, through `FromStr`.
//! - **`r2d2` connection pool**: provides bounded connection reuse without
//!   manual lifetime management. Pool sizing follows the familiar
//!   `pool_size` + `max_overflow` split.
//! - **Shared-cache in-memory databases**: `sqlite:///:memory:` maps to a
//!   uniquely named shared-cache database so every pooled connection (and
//!   therefore every session) sees the same schema.
//! - **Sessions close exactly once**: [`Session::close`] moves the session
//!   to a terminal state; dropping an open session closes it.

mod engine;
mod error;
pub mod models;
mod options;
mod session;

pub use engine::{ConnectionManager, Database, DatabaseOptions, DbPool};
pub use error::{DbError, InvalidOption};
pub use models::{ModelBase, ModelCatalog, TableDef, DEFAULT_MODEL_BASE};
pub use options::{
    DatabaseUri, Encoding, EngineOptions, ExecutionOptions, IsolationLevel, ParamStyle,
    PoolClass, PragmaValue, SessionClass, SessionOptions, TransactionBehavior,
};
pub use rusqlite::types::Value;
pub use session::{RowKey, Session, SessionStats};
