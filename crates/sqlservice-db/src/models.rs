//! Model metadata and table creation.
//!
//! A [`ModelBase`] is the ordered set of tables an application declares.
//! Model modules register their tables into a base when imported through a
//! [`ModelCatalog`]; tables are created in registration order and dropped in
//! reverse.

use crate::error::DbError;
use rusqlite::Connection;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Name of the library-provided model base.
pub const DEFAULT_MODEL_BASE: &str = "Model";

/// A single table declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDef {
    name: String,
    columns: String,
    primary_key: String,
}

impl TableDef {
    /// Declares a table with column DDL such as
    /// `"id INTEGER PRIMARY KEY, name TEXT NOT NULL"`. The primary key
    /// column defaults to `id`.
    pub fn new(name: impl Into<String>, columns: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: columns.into(),
            primary_key: "id".to_string(),
        }
    }

    pub fn with_primary_key(mut self, column: impl Into<String>) -> Self {
        self.primary_key = column.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn primary_key(&self) -> &str {
        &self.primary_key
    }

    fn create_statement(&self) -> String {
        format!("CREATE TABLE IF NOT EXISTS {} ({})", self.name, self.columns)
    }

    fn drop_statement(&self) -> String {
        format!("DROP TABLE IF EXISTS {}", self.name)
    }
}

/// A named, shared collection of table declarations.
///
/// Clones share the same table list, so tables registered after the engine
/// was built are visible to it.
#[derive(Clone)]
pub struct ModelBase {
    name: Arc<str>,
    tables: Arc<RwLock<Vec<TableDef>>>,
}

impl ModelBase {
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self {
            name: name.into(),
            tables: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Registers a table. A table with the same name is replaced in place,
    /// which keeps re-imports idempotent.
    pub fn register(&self, table: TableDef) {
        let mut tables = self.write();
        match tables.iter_mut().find(|t| t.name == table.name) {
            Some(existing) => *existing = table,
            None => tables.push(table),
        }
    }

    pub fn table(&self, name: &str) -> Option<TableDef> {
        self.read().iter().find(|t| t.name == name).cloned()
    }

    /// Registered tables in registration order.
    pub fn tables(&self) -> Vec<TableDef> {
        self.read().clone()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<TableDef>> {
        // A panic while registering leaves a complete Vec behind.
        self.tables.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<TableDef>> {
        self.tables.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for ModelBase {
    fn default() -> Self {
        Self::new(DEFAULT_MODEL_BASE)
    }
}

impl fmt::Debug for ModelBase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelBase")
            .field("name", &self.name)
            .field("tables", &self.read().len())
            .finish()
    }
}

/// A model module: registers its tables into the given base.
pub type ModelLoader = Arc<dyn Fn(&ModelBase) + Send + Sync>;

/// The host application's named model bases and model modules.
#[derive(Clone, Default)]
pub struct ModelCatalog {
    bases: HashMap<String, ModelBase>,
    modules: HashMap<String, ModelLoader>,
}

impl ModelCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a model base that configuration can select by its name.
    pub fn with_base(mut self, base: ModelBase) -> Self {
        self.bases.insert(base.name().to_string(), base);
        self
    }

    /// Adds a model module importable by `path`.
    pub fn with_module<F>(mut self, path: impl Into<String>, loader: F) -> Self
    where
        F: Fn(&ModelBase) + Send + Sync + 'static,
    {
        self.modules.insert(path.into(), Arc::new(loader));
        self
    }

    pub fn base(&self, name: &str) -> Option<ModelBase> {
        self.bases.get(name).cloned()
    }

    pub fn has_module(&self, path: &str) -> bool {
        self.modules.contains_key(path)
    }

    /// Imports one module into `base`.
    ///
    /// # Errors
    ///
    /// Returns `DbError::UnknownModelModule` if no loader is registered for
    /// `path`.
    pub fn import(&self, path: &str, base: &ModelBase) -> Result<(), DbError> {
        let loader = self
            .modules
            .get(path)
            .ok_or_else(|| DbError::UnknownModelModule(path.to_string()))?;
        loader(base);
        tracing::debug!(module = path, base = base.name(), "imported model module");
        Ok(())
    }

    /// Imports every module in order, stopping at the first unknown path.
    pub fn import_all<S: AsRef<str>>(&self, paths: &[S], base: &ModelBase) -> Result<(), DbError> {
        for path in paths {
            self.import(path.as_ref(), base)?;
        }
        Ok(())
    }
}

impl fmt::Debug for ModelCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut modules: Vec<_> = self.modules.keys().collect();
        modules.sort();
        f.debug_struct("ModelCatalog")
            .field("bases", &self.bases.keys().collect::<Vec<_>>())
            .field("modules", &modules)
            .finish()
    }
}

/// Creates every table of `base` that does not exist yet, in one
/// transaction. Returns the number of tables declared.
pub fn create_all(conn: &Connection, base: &ModelBase) -> Result<usize, DbError> {
    let tables = base.tables();
    let tx = conn.unchecked_transaction()?;
    for table in &tables {
        tracing::info!(table = table.name(), base = base.name(), "creating table");
        tx.execute_batch(&table.create_statement())?;
    }
    tx.commit()?;
    Ok(tables.len())
}

/// Drops every table of `base`, in reverse registration order, in one
/// transaction. Returns the number of tables declared.
pub fn drop_all(conn: &Connection, base: &ModelBase) -> Result<usize, DbError> {
    let tables = base.tables();
    let tx = conn.unchecked_transaction()?;
    for table in tables.iter().rev() {
        tracing::info!(table = table.name(), base = base.name(), "dropping table");
        tx.execute_batch(&table.drop_statement())?;
    }
    tx.commit()?;
    Ok(tables.len())
}
