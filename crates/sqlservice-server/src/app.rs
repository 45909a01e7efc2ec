//! The host application: configuration plus the extension registry.

use crate::config::Config;
use crate::extension::{resolve_session_options, ExtensionError, SqlService};
use crate::middleware::session_middleware;
use axum::Router;
use std::collections::BTreeMap;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Registered database extensions, keyed by extension key.
#[derive(Debug, Default)]
pub struct Extensions {
    entries: BTreeMap<String, Arc<SqlService>>,
}

impl Extensions {
    /// Registers `service` under its key.
    ///
    /// # Errors
    ///
    /// `ExtensionError::DuplicateKey` if the key is taken.
    pub fn insert(&mut self, service: Arc<SqlService>) -> Result<(), ExtensionError> {
        let key = service.key().to_string();
        if self.entries.contains_key(&key) {
            return Err(ExtensionError::DuplicateKey(key));
        }
        self.entries.insert(key, service);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&Arc<SqlService>> {
        self.entries.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Services in key order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<SqlService>> {
        self.entries.values()
    }
}

/// An application under construction.
///
/// Extensions are initialized against it, then [`router`](Self::router)
/// wraps the application's routes with one session binder per extension.
#[derive(Debug, Default)]
pub struct Application {
    config: Config,
    extensions: Extensions,
}

impl Application {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            extensions: Extensions::default(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    pub fn extensions_mut(&mut self) -> &mut Extensions {
        &mut self.extensions
    }

    /// The database extension registered under `key`.
    pub fn sql(&self, key: &str) -> Option<Arc<SqlService>> {
        self.extensions.get(key).cloned()
    }

    /// Replaces the configuration and re-resolves every extension's session
    /// options from it. Engine settings are fixed at startup and are not
    /// affected.
    ///
    /// # Errors
    ///
    /// Returns the first invalid session option; the configuration is left
    /// unchanged in that case.
    pub fn reconfigure(&mut self, config: Config) -> Result<(), ExtensionError> {
        resolve_session_options(&config.sql, None)?;
        for service in self.extensions.iter() {
            service.reconfigure(&config.sql)?;
        }
        self.config = config;
        Ok(())
    }

    /// Wraps `routes` so every request gets one session per registered
    /// extension, closed once the response is produced.
    pub fn router(&self, routes: Router) -> Router {
        let router = self.extensions.iter().fold(routes, |router, service| {
            tracing::debug!(key = service.key(), "binding request sessions");
            router.layer(axum::middleware::from_fn_with_state(
                Arc::clone(service),
                session_middleware,
            ))
        });
        router.layer(TraceLayer::new_for_http())
    }
}
