//! API handlers for the sqlservice server.

use crate::middleware::{DbSession, SessionError};
use axum::{
    extract::{Json, Path},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use sqlservice_db::{ModelBase, TableDef, Value};
use thiserror::Error;

/// Model module holding the key/value table served by this API.
pub const KV_MODULE: &str = "sqlservice.kv";

const KV_TABLE: &str = "kv_entries";

/// Registers the key/value table with `base`.
pub fn register_kv_models(base: &ModelBase) {
    base.register(
        TableDef::new(
            KV_TABLE,
            "name TEXT PRIMARY KEY, value TEXT NOT NULL, \
             updated_at TEXT NOT NULL DEFAULT (datetime('now'))",
        )
        .with_primary_key("name"),
    );
}

/// Request body for `PUT /api/kv/{name}`.
#[derive(Debug, Deserialize)]
pub struct PutValueRequest {
    pub value: String,
}

/// A stored key/value entry.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct KvEntry {
    pub name: String,
    pub value: String,
}

/// API error type mapping to HTTP status codes.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid input: {0}")]
    BadRequest(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("internal server error: {0}")]
    InternalServerError(String),
    #[error(transparent)]
    Session(#[from] SessionError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::InternalServerError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
            ApiError::Session(e) => return e.into_response(),
        };

        let body = Json(json!({
            "error": message
        }));

        (status, body).into_response()
    }
}

/// Health check handler.
pub async fn health() -> Json<JsonValue> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Handler for `GET /api/kv/{name}`.
pub async fn get_value_handler(
    session: DbSession,
    Path(name): Path<String>,
) -> Result<Json<KvEntry>, ApiError> {
    let lookup = name.clone();
    let row = session
        .run(move |s| s.get(KV_TABLE, lookup))
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("no value stored under '{name}'")))?;

    match row.get(1) {
        Some(Value::Text(value)) => Ok(Json(KvEntry {
            name,
            value: value.clone(),
        })),
        other => Err(ApiError::InternalServerError(format!(
            "unexpected value column: {other:?}"
        ))),
    }
}

/// Handler for `PUT /api/kv/{name}`.
pub async fn put_value_handler(
    session: DbSession,
    Path(name): Path<String>,
    Json(body): Json<PutValueRequest>,
) -> Result<Json<KvEntry>, ApiError> {
    if name.trim().is_empty() {
        return Err(ApiError::BadRequest("name must not be empty".to_string()));
    }

    let entry = KvEntry {
        name,
        value: body.value,
    };
    let params = [
        Value::Text(entry.name.clone()),
        Value::Text(entry.value.clone()),
    ];
    session
        .run(move |s| {
            s.add(
                "INSERT INTO kv_entries (name, value) VALUES (?1, ?2)
                 ON CONFLICT(name) DO UPDATE SET value = excluded.value,
                 updated_at = datetime('now')",
                &params,
            )?;
            s.commit()
        })
        .await?;

    Ok(Json(entry))
}
