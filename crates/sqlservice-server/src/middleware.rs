//! Per-request database sessions.
//!
//! [`session_middleware`] opens a session before the handler runs, makes it
//! available through the [`DbSession`] extractor and closes it once the
//! response is produced. A scope guard closes the session when the request
//! future is dropped early (client disconnect, timeout, panic).

use crate::extension::{SqlService, DEFAULT_EXTENSION_KEY};
use axum::{
    body::Body,
    extract::{FromRequestParts, State},
    http::{request::Parts, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use sqlservice_db::{DbError, Session};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced by the request session binding.
#[derive(Debug, Error)]
pub enum SessionError {
    /// No session is bound to the request under this key.
    #[error("no database session bound to this request (key '{0}')")]
    MissingSession(String),

    /// Several sessions are bound and none uses the default key.
    #[error(
        "several database sessions are bound to this request ({}); \
         select one by key through RequestSessions",
        .0.join(", ")
    )]
    AmbiguousSession(Vec<String>),

    /// The database layer failed.
    #[error(transparent)]
    Database(#[from] DbError),

    /// A blocking session task panicked or was cancelled.
    #[error("session task failed: {0}")]
    Join(String),
}

impl IntoResponse for SessionError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({
            "error": self.to_string()
        }));

        (StatusCode::INTERNAL_SERVER_ERROR, body).into_response()
    }
}

/// Handle to the session bound to the current request.
///
/// Cheap to clone. All clones refer to the same session; once the request
/// finishes the session is closed and further use fails with
/// `DbError::SessionClosed`.
#[derive(Clone)]
pub struct DbSession {
    key: Arc<str>,
    id: Uuid,
    inner: Arc<Mutex<Session>>,
}

impl DbSession {
    fn new(key: &str, session: Session) -> Self {
        Self {
            key: Arc::from(key),
            id: session.id(),
            inner: Arc::new(Mutex::new(session)),
        }
    }

    /// Extension key of the service that opened this session.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Runs `f` against the session on the blocking thread pool.
    pub async fn run<F, T>(&self, f: F) -> Result<T, SessionError>
    where
        F: FnOnce(&mut Session) -> Result<T, DbError> + Send + 'static,
        T: Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        let result = tokio::task::spawn_blocking(move || {
            let mut session = lock_session(&inner);
            f(&mut session)
        })
        .await
        .map_err(|e| SessionError::Join(e.to_string()))?;
        Ok(result?)
    }

    pub fn is_closed(&self) -> bool {
        lock_session(&self.inner).is_closed()
    }
}

impl std::fmt::Debug for DbSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbSession")
            .field("key", &self.key)
            .field("id", &self.id)
            .finish()
    }
}

fn lock_session(inner: &Mutex<Session>) -> MutexGuard<'_, Session> {
    match inner.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            // A handler panicked mid-operation. The session can still be
            // rolled back and closed.
            tracing::error!("database session lock poisoned, recovering");
            poisoned.into_inner()
        }
    }
}

/// Every session bound to the current request, one per extension key.
#[derive(Clone, Debug, Default)]
pub struct RequestSessions {
    sessions: Vec<DbSession>,
}

impl RequestSessions {
    /// The session opened by the extension registered under `key`.
    pub fn get(&self, key: &str) -> Option<&DbSession> {
        self.sessions.iter().find(|s| s.key() == key)
    }

    /// The session under the default key, or the only session bound.
    pub fn primary(&self) -> Option<&DbSession> {
        self.get(DEFAULT_EXTENSION_KEY).or(match self.sessions.as_slice() {
            [only] => Some(only),
            _ => None,
        })
    }

    /// Extension keys of the bound sessions, in binding order.
    pub fn keys(&self) -> Vec<String> {
        self.sessions.iter().map(|s| s.key().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn insert(&mut self, session: DbSession) {
        self.sessions.retain(|s| s.key() != session.key());
        self.sessions.push(session);
    }
}

impl<S> FromRequestParts<S> for DbSession
where
    S: Send + Sync,
{
    type Rejection = SessionError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let Some(sessions) = parts.extensions.get::<RequestSessions>() else {
            return Err(SessionError::MissingSession(DEFAULT_EXTENSION_KEY.to_string()));
        };
        sessions.primary().cloned().ok_or_else(|| {
            if sessions.is_empty() {
                SessionError::MissingSession(DEFAULT_EXTENSION_KEY.to_string())
            } else {
                SessionError::AmbiguousSession(sessions.keys())
            }
        })
    }
}

impl<S> FromRequestParts<S> for RequestSessions
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(parts
            .extensions
            .get::<RequestSessions>()
            .cloned()
            .unwrap_or_default())
    }
}

/// Closes the request session on every exit path.
struct SessionScope {
    session: Option<DbSession>,
}

impl SessionScope {
    fn new(session: DbSession) -> Self {
        Self {
            session: Some(session),
        }
    }

    /// Closes the session after a normal response. A session the handler
    /// already closed is left alone.
    async fn close(mut self) -> Result<(), SessionError> {
        let Some(session) = self.session.take() else {
            return Ok(());
        };
        let id = session.id();
        session
            .run(|s| if s.is_closed() { Ok(()) } else { s.close() })
            .await
            .inspect_err(|e| tracing::error!(session = %id, error = %e, "failed to close request session"))
    }
}

impl Drop for SessionScope {
    fn drop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        tracing::warn!(
            key = session.key(),
            session = %session.id(),
            "request ended before its session was closed, closing now"
        );
        let inner = Arc::clone(&session.inner);
        let close = move || {
            let mut s = lock_session(&inner);
            if !s.is_closed() {
                if let Err(e) = s.close() {
                    tracing::warn!(session = %s.id(), error = %e, "error closing abandoned session");
                }
            }
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(close);
            }
            Err(_) => close(),
        }
    }
}

/// Binds one session from `service` to each request.
///
/// The session is opened with the service's current session options,
/// stored in the request's [`RequestSessions`] and closed after the inner
/// service responds. The response passes through unchanged unless closing
/// fails, which yields a 500.
pub async fn session_middleware(
    State(service): State<Arc<SqlService>>,
    mut req: Request<Body>,
    next: Next,
) -> Result<Response, SessionError> {
    let options = service.session_options();
    let database = Arc::clone(service.database());
    let session = tokio::task::spawn_blocking(move || database.session_with(options))
        .await
        .map_err(|e| SessionError::Join(e.to_string()))??;

    let handle = DbSession::new(service.key(), session);
    tracing::debug!(key = service.key(), session = %handle.id(), "request session opened");

    let mut sessions = req
        .extensions_mut()
        .remove::<RequestSessions>()
        .unwrap_or_default();
    sessions.insert(handle.clone());
    req.extensions_mut().insert(sessions);

    let scope = SessionScope::new(handle);
    let response = next.run(req).await;
    scope.close().await?;

    Ok(response)
}
