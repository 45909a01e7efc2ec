//! Unit-of-work sessions over a pooled connection.

use crate::engine::ConnectionManager;
use crate::error::DbError;
use crate::models::ModelBase;
use crate::options::{ParamStyle, SessionClass, SessionOptions};
use r2d2::PooledConnection;
use rusqlite::types::{ToSqlOutput, Value};
use rusqlite::{params_from_iter, Connection, OptionalExtension, Row, ToSql};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Counts of sessions handed out and closed by one engine.
#[derive(Debug, Default)]
pub struct SessionStats {
    opened: AtomicU64,
    closed: AtomicU64,
}

impl SessionStats {
    pub fn opened(&self) -> u64 {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> u64 {
        self.closed.load(Ordering::SeqCst)
    }

    /// Sessions opened but not yet closed.
    pub fn active(&self) -> u64 {
        self.opened().saturating_sub(self.closed())
    }
}

/// Primary key value used by [`Session::get`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RowKey {
    Integer(i64),
    Text(String),
}

impl From<i64> for RowKey {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<&str> for RowKey {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for RowKey {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl ToSql for RowKey {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        match self {
            Self::Integer(i) => i.to_sql(),
            Self::Text(s) => s.to_sql(),
        }
    }
}

struct PendingWrite {
    sql: String,
    params: Vec<Value>,
}

/// A short-lived unit of work holding one pooled connection.
///
/// The first statement begins a transaction lazily. Writes queued with
/// [`add`](Self::add) are executed by [`flush`](Self::flush), and before
/// every query when `autoflush` is set. [`close`](Self::close) rolls back
/// whatever was not committed and returns the connection to the pool;
/// after that every method fails with [`DbError::SessionClosed`].
/// Dropping an open session closes it.
pub struct Session {
    id: Uuid,
    conn: Option<PooledConnection<ConnectionManager>>,
    options: SessionOptions,
    class: SessionClass,
    param_style: ParamStyle,
    models: ModelBase,
    pending: Vec<PendingWrite>,
    identity_map: HashMap<(String, RowKey), Vec<Value>>,
    stats: Arc<SessionStats>,
}

impl Session {
    pub(crate) fn open(
        conn: PooledConnection<ConnectionManager>,
        options: SessionOptions,
        class: SessionClass,
        param_style: ParamStyle,
        models: ModelBase,
        stats: Arc<SessionStats>,
    ) -> Result<Self, DbError> {
        if class == SessionClass::ReadOnly {
            conn.execute_batch("PRAGMA query_only = ON;")?;
        }

        let id = Uuid::new_v4();
        stats.opened.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(
            session = %id,
            autoflush = options.autoflush,
            expire_on_commit = options.expire_on_commit,
            "session opened"
        );

        Ok(Self {
            id,
            conn: Some(conn),
            options,
            class,
            param_style,
            models,
            pending: Vec::new(),
            identity_map: HashMap::new(),
            stats,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn options(&self) -> SessionOptions {
        self.options
    }

    pub fn class(&self) -> SessionClass {
        self.class
    }

    pub fn is_closed(&self) -> bool {
        self.conn.is_none()
    }

    /// Whether a transaction is currently open on the connection.
    pub fn in_transaction(&self) -> bool {
        self.conn.as_deref().is_some_and(|conn| !conn.is_autocommit())
    }

    /// Number of queued writes not yet flushed.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Whether `get` would answer `(table, key)` from the identity map.
    pub fn is_cached(&self, table: &str, key: impl Into<RowKey>) -> bool {
        self.identity_map
            .contains_key(&(table.to_string(), key.into()))
    }

    /// Direct access to the underlying connection. Pending writes are not
    /// flushed and no transaction is started.
    pub fn connection(&self) -> Result<&Connection, DbError> {
        self.conn.as_deref().ok_or(DbError::SessionClosed)
    }

    /// Queues a write for the next flush.
    pub fn add(&mut self, sql: impl Into<String>, params: &[Value]) -> Result<(), DbError> {
        self.connection()?;
        self.pending.push(PendingWrite {
            sql: sql.into(),
            params: params.to_vec(),
        });
        Ok(())
    }

    /// Executes queued writes in order inside the session transaction.
    ///
    /// If any write fails the transaction is rolled back and the remaining
    /// queue is discarded.
    pub fn flush(&mut self) -> Result<usize, DbError> {
        if self.pending.is_empty() {
            self.connection()?;
            return Ok(0);
        }

        self.begin_if_needed()?;
        let pending = std::mem::take(&mut self.pending);
        match execute_pending(self.connection()?, &pending) {
            Ok(affected) => {
                tracing::trace!(session = %self.id, writes = pending.len(), "flushed");
                Ok(affected)
            }
            Err(e) => {
                tracing::debug!(session = %self.id, error = %e, "flush failed, rolling back");
                self.rollback()?;
                Err(e.into())
            }
        }
    }

    /// Runs a statement immediately and returns the number of changed rows.
    pub fn execute(&mut self, sql: &str, params: &[Value]) -> Result<usize, DbError> {
        self.prepare_statement()?;
        let changed = self
            .connection()?
            .execute(sql, params_from_iter(params.iter()))?;
        Ok(changed)
    }

    /// Runs a query expected to return at most one row.
    pub fn query_row<T, F>(&mut self, sql: &str, params: &[Value], f: F) -> Result<Option<T>, DbError>
    where
        F: FnOnce(&Row<'_>) -> rusqlite::Result<T>,
    {
        self.prepare_statement()?;
        let row = self
            .connection()?
            .query_row(sql, params_from_iter(params.iter()), f)
            .optional()?;
        Ok(row)
    }

    /// Runs a query and maps every row.
    pub fn query_all<T, F>(&mut self, sql: &str, params: &[Value], f: F) -> Result<Vec<T>, DbError>
    where
        F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
    {
        self.prepare_statement()?;
        let conn = self.connection()?;
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map(params_from_iter(params.iter()), f)?
            .collect::<rusqlite::Result<Vec<T>>>()?;
        Ok(rows)
    }

    /// Loads a row of a registered table by primary key, answering repeat
    /// lookups from the identity map.
    pub fn get(&mut self, table: &str, key: impl Into<RowKey>) -> Result<Option<Vec<Value>>, DbError> {
        let key = key.into();
        let ident = (table.to_string(), key);
        if let Some(row) = self.identity_map.get(&ident) {
            return Ok(Some(row.clone()));
        }

        let def = self
            .models
            .table(table)
            .ok_or_else(|| DbError::UnknownTable {
                base: self.models.name().to_string(),
                table: table.to_string(),
            })?;
        let sql = format!(
            "SELECT * FROM {} WHERE {} = {}",
            def.name(),
            def.primary_key(),
            self.param_style.placeholder(1)
        );

        self.prepare_statement()?;
        let row = {
            let conn = self.connection()?;
            let mut stmt = conn.prepare(&sql)?;
            let columns = stmt.column_count();
            stmt.query_row([&ident.1], |row| {
                (0..columns)
                    .map(|i| row.get::<_, Value>(i))
                    .collect::<rusqlite::Result<Vec<Value>>>()
            })
            .optional()?
        };

        if let Some(values) = &row {
            self.identity_map.insert(ident, values.clone());
        }
        Ok(row)
    }

    /// Forgets every row loaded by `get`.
    pub fn expire_all(&mut self) {
        self.identity_map.clear();
    }

    /// Flushes and commits. With `expire_on_commit` the identity map is
    /// cleared afterwards.
    pub fn commit(&mut self) -> Result<(), DbError> {
        self.flush()?;
        let conn = self.connection()?;
        if !conn.is_autocommit() {
            conn.execute_batch("COMMIT")?;
        }
        if self.options.expire_on_commit {
            self.identity_map.clear();
        }
        tracing::trace!(session = %self.id, "committed");
        Ok(())
    }

    /// Discards queued writes, the open transaction and the identity map.
    pub fn rollback(&mut self) -> Result<(), DbError> {
        self.pending.clear();
        self.identity_map.clear();
        let conn = self.connection()?;
        if !conn.is_autocommit() {
            conn.execute_batch("ROLLBACK")?;
        }
        Ok(())
    }

    /// Rolls back uncommitted work and returns the connection to the pool.
    ///
    /// # Errors
    ///
    /// `DbError::SessionClosed` if the session was already closed, or the
    /// database error raised while resetting the connection. The session is
    /// closed in both cases. A connection whose rollback failed is still
    /// inside a transaction and is dropped by the pool on return.
    pub fn close(&mut self) -> Result<(), DbError> {
        let conn = self.conn.take().ok_or(DbError::SessionClosed)?;
        self.pending.clear();
        self.identity_map.clear();

        let reset = reset_connection(&conn, self.class);
        drop(conn);

        self.stats.closed.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(session = %self.id, "session closed");
        reset
    }

    fn prepare_statement(&mut self) -> Result<(), DbError> {
        if self.options.autoflush {
            self.flush()?;
        }
        self.begin_if_needed()
    }

    fn begin_if_needed(&self) -> Result<(), DbError> {
        let conn = self.connection()?;
        if conn.is_autocommit() {
            conn.execute_batch(self.options.transaction.begin_statement())?;
        }
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.conn.is_some() {
            if let Err(e) = self.close() {
                tracing::warn!(session = %self.id, error = %e, "error closing dropped session");
            }
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .field("options", &self.options)
            .field("class", &self.class)
            .field("pending", &self.pending.len())
            .finish()
    }
}

fn execute_pending(conn: &Connection, pending: &[PendingWrite]) -> rusqlite::Result<usize> {
    let mut affected = 0;
    for write in pending {
        affected += conn.execute(&write.sql, params_from_iter(write.params.iter()))?;
    }
    Ok(affected)
}

fn reset_connection(conn: &Connection, class: SessionClass) -> Result<(), DbError> {
    if !conn.is_autocommit() {
        conn.execute_batch("ROLLBACK")?;
    }
    if class == SessionClass::ReadOnly {
        conn.execute_batch("PRAGMA query_only = OFF;")?;
    }
    Ok(())
}
