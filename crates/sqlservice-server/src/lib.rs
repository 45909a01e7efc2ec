//! Web-framework integration for the sqlservice database layer.
//!
//! An [`Application`] holds configuration and a registry of database
//! extensions. [`SqlService::builder`] resolves the `SQL_*` settings, builds
//! one engine and registers it; [`Application::router`] then binds one
//! session per extension to every request.

pub mod api;
pub mod app;
pub mod cli;
pub mod config;
pub mod extension;
pub mod middleware;

pub use app::{Application, Extensions};
pub use extension::{
    EngineFactory, ExtensionError, ResolvedOptions, SqlService, SqlServiceBuilder,
    DEFAULT_CLI_GROUP, DEFAULT_DATABASE_CLASS, DEFAULT_EXTENSION_KEY,
};
pub use middleware::{session_middleware, DbSession, RequestSessions, SessionError};

use axum::{routing::get, Router};
use sqlservice_db::{DbError, ModelCatalog};
use std::sync::Arc;

/// Model modules shipped with the server binary.
pub fn default_catalog() -> ModelCatalog {
    ModelCatalog::new().with_module(api::KV_MODULE, api::register_kv_models)
}

/// Registers the key/value model with the extension serving `/api/kv`
/// and creates its tables. Returns the number of tables declared, or zero
/// when no extension is the request's primary session.
pub fn prepare_kv_store(app: &Application) -> Result<usize, DbError> {
    let service = app.sql(DEFAULT_EXTENSION_KEY).or_else(|| {
        let mut services = app.extensions().iter();
        match (services.next(), services.next()) {
            (Some(only), None) => Some(Arc::clone(only)),
            _ => None,
        }
    });
    let Some(service) = service else {
        return Ok(0);
    };
    api::register_kv_models(service.database().model_base());
    service.create_all()
}

/// Routes served by the binary, without session binding.
pub fn routes() -> Router {
    Router::new()
        .route("/health", get(api::health))
        .route(
            "/api/kv/{name}",
            get(api::get_value_handler).put(api::put_value_handler),
        )
}

/// Builds the full router for `app`: [`routes`] wrapped with one session
/// binder per registered extension.
pub fn app(app: &Application) -> Router {
    app.router(routes())
}
