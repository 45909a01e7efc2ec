//! The engine handle: connection pool creation and session factory.

use crate::error::{DbError, InvalidOption};
use crate::models::{self, ModelBase};
use crate::options::{
    pragma_statement, DatabaseUri, EngineOptions, IsolationLevel, ParamStyle, PoolClass,
    SessionClass, SessionOptions,
};
use crate::session::{Session, SessionStats};
use r2d2::event::{AcquireEvent, CheckinEvent, CheckoutEvent, ReleaseEvent, TimeoutEvent};
use r2d2::{HandleEvent, ManageConnection, Pool};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, OpenFlags};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

/// A type alias for the SQLite connection pool.
pub type DbPool = Pool<ConnectionManager>;

/// Longest accepted checkout timeout or connection lifetime.
const MAX_POOL_DURATION: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Pool manager for engine connections.
///
/// A connection returned while still inside a transaction is discarded
/// instead of being handed to the next session.
pub struct ConnectionManager {
    inner: SqliteConnectionManager,
}

impl ManageConnection for ConnectionManager {
    type Connection = Connection;
    type Error = rusqlite::Error;

    fn connect(&self) -> Result<Connection, rusqlite::Error> {
        self.inner.connect()
    }

    fn is_valid(&self, conn: &mut Connection) -> Result<(), rusqlite::Error> {
        self.inner.is_valid(conn)
    }

    fn has_broken(&self, conn: &mut Connection) -> bool {
        if conn.is_autocommit() {
            return false;
        }
        tracing::warn!("discarding pooled connection left inside a transaction");
        true
    }
}

/// Everything needed to build a [`Database`].
#[derive(Debug, Clone)]
pub struct DatabaseOptions {
    pub uri: DatabaseUri,
    pub engine: EngineOptions,
    /// Defaults for [`Database::session`].
    pub session: SessionOptions,
    pub session_class: SessionClass,
    pub model_base: ModelBase,
}

impl DatabaseOptions {
    /// Options for `uri` with every other setting at its default.
    pub fn new(uri: DatabaseUri) -> Self {
        Self {
            uri,
            engine: EngineOptions::default(),
            session: SessionOptions::default(),
            session_class: SessionClass::default(),
            model_base: ModelBase::default(),
        }
    }
}

/// The long-lived engine handle.
///
/// Owns the connection pool and hands out [`Session`]s. Shared read-only
/// between requests once built.
pub struct Database {
    pool: DbPool,
    uri: DatabaseUri,
    engine: EngineOptions,
    session_defaults: SessionOptions,
    session_class: SessionClass,
    model_base: ModelBase,
    stats: Arc<SessionStats>,
    // Keeps a shared-cache in-memory database alive while pooled
    // connections come and go.
    _memory_anchor: Option<Mutex<Connection>>,
}

impl Database {
    /// Builds the pool and opens its initial connections.
    ///
    /// In-memory URIs map to a uniquely named shared-cache database so all
    /// pooled connections see the same tables.
    ///
    /// # Errors
    ///
    /// Returns `DbError::InvalidOption` for unusable pool settings or engine
    /// pragmas, and `DbError::PoolInit` if connections cannot be opened.
    pub fn connect(options: DatabaseOptions) -> Result<Self, DbError> {
        let DatabaseOptions {
            uri,
            engine,
            session,
            session_class,
            model_base,
        } = options;

        if engine.pool_size == 0 {
            return Err(InvalidOption::new("SQL_POOL_SIZE", "0").into());
        }
        if engine.pool_timeout.is_zero() || engine.pool_timeout > MAX_POOL_DURATION {
            return Err(InvalidOption::new(
                "SQL_POOL_TIMEOUT",
                engine.pool_timeout.as_secs().to_string(),
            )
            .into());
        }
        if let Some(recycle) = engine.pool_recycle.filter(|d| *d > MAX_POOL_DURATION) {
            return Err(InvalidOption::new("SQL_POOL_RECYCLE", recycle.as_secs().to_string()).into());
        }

        let mut init_sql = vec![format!(
            "PRAGMA encoding = '{}';",
            engine.encoding.pragma_value()
        )];
        if engine.isolation_level == IsolationLevel::ReadUncommitted {
            init_sql.push("PRAGMA read_uncommitted = ON;".to_string());
        }
        for (name, value) in &engine.engine_options {
            init_sql.push(pragma_statement(name, value)?);
        }
        let init_sql = init_sql.join("\n");

        let mut flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_FULL_MUTEX;

        let (manager, memory_anchor) = match &uri {
            DatabaseUri::Memory => {
                flags |= OpenFlags::SQLITE_OPEN_URI;
                let name = format!(
                    "file:sqlservice-{}?mode=memory&cache=shared",
                    Uuid::new_v4().simple()
                );
                let anchor = Connection::open_with_flags(&name, flags)?;
                (SqliteConnectionManager::file(&name), Some(Mutex::new(anchor)))
            }
            DatabaseUri::File(path) => (SqliteConnectionManager::file(path), None),
        };

        let execution = engine.execution_options.clone();
        let echo = engine.echo;
        let manager = manager.with_flags(flags).with_init(move |conn| {
            if echo {
                conn.trace(Some(echo_statement));
            }
            conn.execute_batch(&init_sql)?;
            if let Some(ms) = execution.busy_timeout_ms {
                conn.busy_timeout(Duration::from_millis(ms))?;
            }
            if let Some(capacity) = execution.statement_cache_capacity {
                conn.set_prepared_statement_cache_capacity(capacity);
            }
            if let Some(enabled) = execution.foreign_keys {
                conn.execute_batch(if enabled {
                    "PRAGMA foreign_keys = ON;"
                } else {
                    "PRAGMA foreign_keys = OFF;"
                })?;
            }
            Ok(())
        });

        let (max_size, min_idle) = match engine.pool_class {
            PoolClass::Queue => (
                engine.pool_size.saturating_add(engine.max_overflow),
                engine.pool_size,
            ),
            PoolClass::Static => (1, 1),
        };

        let mut builder = Pool::builder()
            .max_size(max_size)
            .min_idle(Some(min_idle))
            .connection_timeout(engine.pool_timeout)
            .max_lifetime(engine.pool_recycle.filter(|d| !d.is_zero()))
            .test_on_check_out(engine.pool_pre_ping);
        if engine.echo_pool {
            builder = builder.event_handler(Box::new(PoolEcho));
        }
        let pool = builder
            .build(ConnectionManager { inner: manager })
            .map_err(DbError::PoolInit)?;

        tracing::info!(
            %uri,
            pool_class = ?engine.pool_class,
            max_size,
            min_idle,
            "database engine ready"
        );

        Ok(Self {
            pool,
            uri,
            engine,
            session_defaults: session,
            session_class,
            model_base,
            stats: Arc::new(SessionStats::default()),
            _memory_anchor: memory_anchor,
        })
    }

    /// Opens a session with the engine's default session options.
    pub fn session(&self) -> Result<Session, DbError> {
        self.session_with(self.session_defaults)
    }

    /// Opens a session with explicit options.
    ///
    /// # Errors
    ///
    /// Returns `DbError::Checkout` if no connection frees up within the
    /// pool timeout.
    pub fn session_with(&self, options: SessionOptions) -> Result<Session, DbError> {
        let conn = self.pool.get().map_err(DbError::Checkout)?;
        Session::open(
            conn,
            options,
            self.session_class,
            self.engine.param_style,
            self.model_base.clone(),
            Arc::clone(&self.stats),
        )
    }

    /// Creates every table registered with the model base.
    pub fn create_all(&self) -> Result<usize, DbError> {
        let conn = self.pool.get().map_err(DbError::Checkout)?;
        models::create_all(&conn, &self.model_base)
    }

    /// Drops every table registered with the model base.
    pub fn drop_all(&self) -> Result<usize, DbError> {
        let conn = self.pool.get().map_err(DbError::Checkout)?;
        models::drop_all(&conn, &self.model_base)
    }

    pub fn uri(&self) -> &DatabaseUri {
        &self.uri
    }

    pub fn engine_options(&self) -> &EngineOptions {
        &self.engine
    }

    pub fn session_defaults(&self) -> SessionOptions {
        self.session_defaults
    }

    pub fn session_class(&self) -> SessionClass {
        self.session_class
    }

    pub fn param_style(&self) -> ParamStyle {
        self.engine.param_style
    }

    pub fn model_base(&self) -> &ModelBase {
        &self.model_base
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("uri", &self.uri)
            .field("pool", &self.pool.state())
            .field("model_base", &self.model_base.name())
            .field("stats", &self.stats)
            .finish()
    }
}

fn echo_statement(sql: &str) {
    tracing::info!(target: "sqlservice::echo", "{}", sql);
}

/// Logs pool activity when `SQL_ECHO_POOL` is set.
#[derive(Debug)]
struct PoolEcho;

impl HandleEvent for PoolEcho {
    fn handle_acquire(&self, event: AcquireEvent) {
        tracing::info!(target: "sqlservice::pool", connection = event.connection_id(), "connection opened");
    }

    fn handle_release(&self, event: ReleaseEvent) {
        tracing::info!(
            target: "sqlservice::pool",
            connection = event.connection_id(),
            age = ?event.age(),
            "connection closed"
        );
    }

    fn handle_checkout(&self, event: CheckoutEvent) {
        tracing::info!(
            target: "sqlservice::pool",
            connection = event.connection_id(),
            waited = ?event.duration(),
            "connection checked out"
        );
    }

    fn handle_checkin(&self, event: CheckinEvent) {
        tracing::info!(
            target: "sqlservice::pool",
            connection = event.connection_id(),
            held = ?event.duration(),
            "connection checked in"
        );
    }

    fn handle_timeout(&self, event: TimeoutEvent) {
        tracing::warn!(
            target: "sqlservice::pool",
            timeout = ?event.timeout(),
            "timed out waiting for a connection"
        );
    }
}
