//! The database extension: option resolution and engine construction.
//!
//! [`SqlServiceBuilder::init_app`] reads the application's `SQL_*`
//! configuration (explicit builder arguments take precedence), builds one
//! [`Database`] and registers the resulting [`SqlService`] in the
//! application's extension registry. The per-request session binding is
//! installed when the application's router is built.

use crate::app::Application;
use crate::config::SqlConfig;
use sqlservice_db::{
    Database, DatabaseOptions, DatabaseUri, DbError, EngineOptions, InvalidOption, ModelBase,
    ModelCatalog, Session, SessionClass, SessionOptions, DEFAULT_MODEL_BASE,
};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use thiserror::Error;

/// Registry key used when neither the builder nor `SQL_EXTENSION_KEY` names one.
pub const DEFAULT_EXTENSION_KEY: &str = "database";

/// Command group used when `SQL_CLI_GROUP` is absent.
pub const DEFAULT_CLI_GROUP: &str = "sql";

/// Engine factory used when `DATABASE_CLASS` is absent.
pub const DEFAULT_DATABASE_CLASS: &str = "Database";

/// Errors raised while initializing the extension.
#[derive(Debug, Error)]
pub enum ExtensionError {
    /// Neither an explicit URI nor `SQL_DATABASE_URI` was provided.
    #[error("database uri can't be empty: set SQL_DATABASE_URI or pass an explicit uri")]
    MissingDatabaseUri,

    /// A configuration value could not be interpreted.
    #[error(transparent)]
    InvalidOption(#[from] InvalidOption),

    /// `SQL_MODEL_CLASS` names a base the catalog does not contain.
    #[error("unknown model class: {0}")]
    UnknownModelClass(String),

    /// `DATABASE_CLASS` names an engine factory that was not registered.
    #[error("unknown database class: {0}")]
    UnknownDatabaseClass(String),

    /// Another extension is already registered under this key.
    #[error("an extension is already registered under key '{0}'")]
    DuplicateKey(String),

    /// The engine could not be built or a model module failed to import.
    #[error("database error: {0}")]
    Database(#[from] DbError),
}

/// Builds the engine handle from resolved options.
///
/// Selected by name through `DATABASE_CLASS`. Any
/// `Fn(DatabaseOptions) -> Result<Database, DbError>` qualifies.
pub trait EngineFactory: Send + Sync {
    fn build(&self, options: DatabaseOptions) -> Result<Database, DbError>;
}

impl<F> EngineFactory for F
where
    F: Fn(DatabaseOptions) -> Result<Database, DbError> + Send + Sync,
{
    fn build(&self, options: DatabaseOptions) -> Result<Database, DbError> {
        self(options)
    }
}

/// The fully resolved configuration of one extension instance.
#[derive(Debug, Clone)]
pub struct ResolvedOptions {
    pub database: DatabaseOptions,
    pub extension_key: String,
    pub cli_group: String,
    pub database_class: String,
    pub model_modules: Vec<String>,
}

/// Explicit overrides for the extension, applied over configuration.
pub struct SqlServiceBuilder {
    database_uri: Option<String>,
    model_base: Option<ModelBase>,
    session_class: Option<SessionClass>,
    session_options: Option<SessionOptions>,
    extension_key: Option<String>,
    catalog: ModelCatalog,
    factories: HashMap<String, Arc<dyn EngineFactory>>,
}

impl Default for SqlServiceBuilder {
    fn default() -> Self {
        let mut factories: HashMap<String, Arc<dyn EngineFactory>> = HashMap::new();
        factories.insert(
            DEFAULT_DATABASE_CLASS.to_string(),
            Arc::new(Database::connect),
        );
        Self {
            database_uri: None,
            model_base: None,
            session_class: None,
            session_options: None,
            extension_key: None,
            catalog: ModelCatalog::default(),
            factories,
        }
    }
}

impl SqlServiceBuilder {
    /// Database URI; takes precedence over `SQL_DATABASE_URI`.
    pub fn database_uri(mut self, uri: impl Into<String>) -> Self {
        self.database_uri = Some(uri.into());
        self
    }

    /// Model base; takes precedence over `SQL_MODEL_CLASS`.
    pub fn model_base(mut self, base: ModelBase) -> Self {
        self.model_base = Some(base);
        self
    }

    /// Session class; takes precedence over `SQL_SESSION_CLASS`.
    pub fn session_class(mut self, class: SessionClass) -> Self {
        self.session_class = Some(class);
        self
    }

    /// Session options; take precedence over `SQL_SESSION_OPTIONS`.
    /// `SQL_AUTOFLUSH` and `SQL_EXPIRE_ON_COMMIT` still apply on top.
    pub fn session_options(mut self, options: SessionOptions) -> Self {
        self.session_options = Some(options);
        self
    }

    /// Registry key; takes precedence over `SQL_EXTENSION_KEY`.
    pub fn extension_key(mut self, key: impl Into<String>) -> Self {
        self.extension_key = Some(key.into());
        self
    }

    /// Model bases and modules available to `SQL_MODEL_CLASS` and
    /// `SQL_DATABASE_MODELS`.
    pub fn catalog(mut self, catalog: ModelCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    /// Registers an engine factory selectable through `DATABASE_CLASS`.
    pub fn database_class<F>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        F: EngineFactory + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
        self
    }

    /// Resolves the effective options from `config` and the overrides.
    ///
    /// # Errors
    ///
    /// `ExtensionError::MissingDatabaseUri` when no URI is available, or
    /// the first invalid option encountered.
    pub fn resolve(&self, config: &SqlConfig) -> Result<ResolvedOptions, ExtensionError> {
        let uri = self
            .database_uri
            .as_deref()
            .filter(|uri| !uri.trim().is_empty())
            .or_else(|| {
                config
                    .database_uri
                    .as_deref()
                    .filter(|uri| !uri.trim().is_empty())
            })
            .ok_or(ExtensionError::MissingDatabaseUri)?;
        let uri: DatabaseUri = uri.parse()?;

        let model_base = match (&self.model_base, &config.model_class) {
            (Some(base), _) => base.clone(),
            (None, Some(name)) => match self.catalog.base(name) {
                Some(base) => base,
                None if name == DEFAULT_MODEL_BASE => ModelBase::default(),
                None => return Err(ExtensionError::UnknownModelClass(name.clone())),
            },
            (None, None) => ModelBase::default(),
        };

        let session_class = match (self.session_class, &config.session_class) {
            (Some(class), _) => class,
            (None, Some(name)) => name.parse()?,
            (None, None) => SessionClass::default(),
        };

        Ok(ResolvedOptions {
            database: DatabaseOptions {
                uri,
                engine: resolve_engine_options(config)?,
                session: resolve_session_options(config, self.session_options)?,
                session_class,
                model_base,
            },
            extension_key: self
                .extension_key
                .clone()
                .or_else(|| config.extension_key.clone())
                .unwrap_or_else(|| DEFAULT_EXTENSION_KEY.to_string()),
            cli_group: config
                .cli_group
                .clone()
                .unwrap_or_else(|| DEFAULT_CLI_GROUP.to_string()),
            database_class: config
                .database_class
                .clone()
                .unwrap_or_else(|| DEFAULT_DATABASE_CLASS.to_string()),
            model_modules: config.database_models.clone(),
        })
    }

    /// Builds the engine and registers the extension with `app`.
    ///
    /// Nothing is registered if any step fails.
    pub fn init_app(self, app: &mut Application) -> Result<Arc<SqlService>, ExtensionError> {
        let resolved = self.resolve(&app.config().sql)?;
        if app.extensions().contains_key(&resolved.extension_key) {
            return Err(ExtensionError::DuplicateKey(resolved.extension_key));
        }

        self.catalog
            .import_all(&resolved.model_modules, &resolved.database.model_base)?;

        let factory = self
            .factories
            .get(&resolved.database_class)
            .ok_or_else(|| ExtensionError::UnknownDatabaseClass(resolved.database_class.clone()))?;

        tracing::info!(
            key = %resolved.extension_key,
            uri = %resolved.database.uri,
            database_class = %resolved.database_class,
            model_base = resolved.database.model_base.name(),
            models = resolved.model_modules.len(),
            "initializing database extension"
        );

        let session_options = resolved.database.session;
        let database = factory.build(resolved.database)?;

        let service = Arc::new(SqlService {
            key: resolved.extension_key,
            database: Arc::new(database),
            session_options: RwLock::new(session_options),
            explicit_session_options: self.session_options,
            catalog: self.catalog,
            model_modules: resolved.model_modules,
            cli_group: resolved.cli_group,
        });
        app.extensions_mut().insert(Arc::clone(&service))?;
        Ok(service)
    }
}

/// Maps the engine-level `SQL_*` keys onto [`EngineOptions`].
pub fn resolve_engine_options(config: &SqlConfig) -> Result<EngineOptions, InvalidOption> {
    let defaults = EngineOptions::default();
    Ok(EngineOptions {
        pool_size: config.pool_size.unwrap_or(defaults.pool_size),
        max_overflow: config.max_overflow.unwrap_or(defaults.max_overflow),
        pool_timeout: config
            .pool_timeout
            .map(Duration::from_secs)
            .unwrap_or(defaults.pool_timeout),
        pool_recycle: match config.pool_recycle {
            Some(secs) if secs > 0 => Some(Duration::from_secs(secs.unsigned_abs())),
            _ => None,
        },
        pool_pre_ping: config.pool_pre_ping.unwrap_or(defaults.pool_pre_ping),
        pool_class: parse_or(config.pool_class.as_deref(), defaults.pool_class)?,
        isolation_level: parse_or(config.isolation_level.as_deref(), defaults.isolation_level)?,
        param_style: parse_or(config.param_style.as_deref(), defaults.param_style)?,
        encoding: parse_or(config.encoding.as_deref(), defaults.encoding)?,
        execution_options: config.execution_options.clone().unwrap_or_default(),
        echo: config.echo.unwrap_or(defaults.echo),
        echo_pool: config.echo_pool.unwrap_or(defaults.echo_pool),
        engine_options: config.engine_options.clone().unwrap_or_default(),
    })
}

/// Resolves session behavior.
///
/// Precedence, lowest first: defaults, `SQL_SESSION_OPTIONS` (replaced
/// wholesale by `explicit` when given), then the `SQL_AUTOFLUSH` and
/// `SQL_EXPIRE_ON_COMMIT` flags.
pub fn resolve_session_options(
    config: &SqlConfig,
    explicit: Option<SessionOptions>,
) -> Result<SessionOptions, InvalidOption> {
    let mut options = match (explicit, &config.session_options) {
        (Some(options), _) => options,
        (None, Some(table)) => {
            let defaults = SessionOptions::default();
            SessionOptions {
                autoflush: table.autoflush.unwrap_or(defaults.autoflush),
                expire_on_commit: table.expire_on_commit.unwrap_or(defaults.expire_on_commit),
                transaction: parse_or(table.transaction.as_deref(), defaults.transaction)?,
            }
        }
        (None, None) => SessionOptions::default(),
    };
    if let Some(autoflush) = config.autoflush {
        options.autoflush = autoflush;
    }
    if let Some(expire_on_commit) = config.expire_on_commit {
        options.expire_on_commit = expire_on_commit;
    }
    Ok(options)
}

fn parse_or<T>(value: Option<&str>, default: T) -> Result<T, InvalidOption>
where
    T: std::str::FromStr<Err = InvalidOption>,
{
    value.map_or(Ok(default), str::parse)
}

/// A registered database extension: the engine handle plus the settings
/// the request binder and admin commands need.
pub struct SqlService {
    key: String,
    database: Arc<Database>,
    session_options: RwLock<SessionOptions>,
    explicit_session_options: Option<SessionOptions>,
    catalog: ModelCatalog,
    model_modules: Vec<String>,
    cli_group: String,
}

impl SqlService {
    pub fn builder() -> SqlServiceBuilder {
        SqlServiceBuilder::default()
    }

    /// The extension registry key.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.database
    }

    pub fn cli_group(&self) -> &str {
        &self.cli_group
    }

    pub fn model_modules(&self) -> &[String] {
        &self.model_modules
    }

    /// Options the next request session will be opened with.
    pub fn session_options(&self) -> SessionOptions {
        *self
            .session_options
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Re-resolves session behavior from a new configuration. Requests that
    /// start afterwards use the new options; sessions already open keep
    /// theirs.
    pub fn reconfigure(&self, config: &SqlConfig) -> Result<(), ExtensionError> {
        let options = resolve_session_options(config, self.explicit_session_options)?;
        let mut current = self
            .session_options
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if *current != options {
            tracing::info!(
                key = %self.key,
                autoflush = options.autoflush,
                expire_on_commit = options.expire_on_commit,
                "session options reconfigured"
            );
            *current = options;
        }
        Ok(())
    }

    /// Opens a session outside of a request, with the current options.
    pub fn session(&self) -> Result<Session, DbError> {
        self.database.session_with(self.session_options())
    }

    /// Imports the configured model modules into the engine's model base.
    pub fn collect_models(&self) -> Result<(), DbError> {
        self.catalog
            .import_all(&self.model_modules, self.database.model_base())
    }

    /// Imports the configured model modules, then creates all tables.
    pub fn create_all(&self) -> Result<usize, DbError> {
        self.collect_models()?;
        self.database.create_all()
    }

    /// Drops all tables of the model base.
    pub fn drop_all(&self) -> Result<usize, DbError> {
        self.database.drop_all()
    }
}

impl fmt::Debug for SqlService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqlService")
            .field("key", &self.key)
            .field("database", &self.database)
            .field("session_options", &self.session_options())
            .field("model_modules", &self.model_modules)
            .field("cli_group", &self.cli_group)
            .finish()
    }
}
