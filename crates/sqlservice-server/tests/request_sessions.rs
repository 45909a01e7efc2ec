use axum::{
    body::Body,
    http::{Request, StatusCode},
    routing::get,
    Json, Router,
};
use serde_json::{json, Value};
use sqlservice_db::Value as SqlValue;
use sqlservice_server::config::parse_config;
use sqlservice_server::{Application, DbSession, RequestSessions, SqlService};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tower::ServiceExt; // for oneshot

fn application(toml: &str) -> Application {
    let mut app = Application::new(parse_config(toml).expect("test config should parse"));
    SqlService::builder().init_app(&mut app).unwrap();
    app
}

fn memory_app() -> Application {
    application(r#"SQL_DATABASE_URI = "sqlite:///:memory:""#)
}

async fn session_info(session: DbSession) -> Result<Json<Value>, StatusCode> {
    let options = session
        .run(|s| Ok(s.options()))
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(Json(json!({
        "id": session.id().to_string(),
        "autoflush": options.autoflush,
        "expire_on_commit": options.expire_on_commit,
    })))
}

async fn get_json(router: &Router, uri: &str) -> (StatusCode, Value) {
    let response = router
        .clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&body).unwrap_or(Value::Null))
}

#[tokio::test]
async fn each_request_gets_its_own_session() {
    let app = memory_app();
    let router = app.router(Router::new().route("/session", get(session_info)));
    let service = app.sql("database").unwrap();

    let mut ids = HashSet::new();
    for _ in 0..5 {
        let (status, body) = get_json(&router, "/session").await;
        assert_eq!(status, StatusCode::OK);
        ids.insert(body["id"].as_str().unwrap().to_string());
    }

    let stats = service.database().stats();
    assert_eq!(ids.len(), 5);
    assert_eq!(stats.opened(), 5);
    assert_eq!(stats.closed(), 5);
    assert_eq!(stats.active(), 0);
}

#[tokio::test]
async fn session_uses_default_flags_and_is_closed_after_response() {
    let app = memory_app();
    let captured: Arc<Mutex<Option<DbSession>>> = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&captured);
    let router = app.router(Router::new().route(
        "/session",
        get(move |session: DbSession| {
            let slot = Arc::clone(&slot);
            async move {
                *slot.lock().unwrap() = Some(session.clone());
                session_info(session).await
            }
        }),
    ));

    let (status, body) = get_json(&router, "/session").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["autoflush"], true);
    assert_eq!(body["expire_on_commit"], true);

    let session = captured.lock().unwrap().take().unwrap();
    assert!(session.is_closed());
    let err = session.run(|s| s.flush()).await.unwrap_err();
    assert!(err.to_string().contains("closed"), "unexpected error: {err}");
}

#[tokio::test]
async fn handler_error_still_closes_session_and_discards_work() {
    let app = memory_app();
    let service = app.sql("database").unwrap();
    let router = app.router(Router::new().route(
        "/fail",
        get(|session: DbSession| async move {
            session
                .run(|s| {
                    s.execute(
                        "CREATE TABLE IF NOT EXISTS notes (body TEXT NOT NULL)",
                        &[],
                    )?;
                    s.commit()?;
                    s.execute(
                        "INSERT INTO notes (body) VALUES (?1)",
                        &[SqlValue::Text("uncommitted".into())],
                    )
                })
                .await
                .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
            Err::<(), StatusCode>(StatusCode::IM_A_TEAPOT)
        }),
    ));

    let response = router
        .oneshot(Request::builder().uri("/fail").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::IM_A_TEAPOT);

    let stats = service.database().stats();
    assert_eq!(stats.opened(), 1);
    assert_eq!(stats.closed(), 1);

    let mut session = service.session().unwrap();
    let count = session
        .query_row("SELECT COUNT(*) FROM notes", &[], |row| row.get::<_, i64>(0))
        .unwrap();
    assert_eq!(count, Some(0));
}

#[tokio::test]
async fn missing_binder_yields_typed_error() {
    let router = Router::new().route("/session", get(session_info));

    let (status, body) = get_json(&router, "/session").await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body["error"]
        .as_str()
        .unwrap()
        .contains("no database session bound"));
}

#[tokio::test]
async fn ambiguous_sessions_are_reported_by_key() {
    let mut app = Application::new(parse_config("").unwrap());
    for key in ["alpha", "beta"] {
        SqlService::builder()
            .database_uri("sqlite://")
            .extension_key(key)
            .init_app(&mut app)
            .unwrap();
    }
    let router = app.router(Router::new().route("/session", get(session_info)));

    let (status, body) = get_json(&router, "/session").await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    let message = body["error"].as_str().unwrap();
    assert!(message.contains("several database sessions"), "{message}");
    assert!(message.contains("alpha") && message.contains("beta"), "{message}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn overlapping_requests_wait_for_uncommitted_writes() {
    let app = memory_app();
    let service = app.sql("database").unwrap();
    {
        let mut setup = service.session().unwrap();
        setup
            .execute("CREATE TABLE notes (body TEXT NOT NULL)", &[])
            .unwrap();
        setup.commit().unwrap();
    }

    let written = Arc::new(Notify::new());
    let signal = Arc::clone(&written);
    let router = app.router(
        Router::new()
            .route(
                "/write",
                get(move |session: DbSession| {
                    let signal = Arc::clone(&signal);
                    async move {
                        session
                            .run(|s| {
                                s.add(
                                    "INSERT INTO notes (body) VALUES (?1)",
                                    &[SqlValue::Text("first".into())],
                                )?;
                                s.flush()
                            })
                            .await
                            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
                        signal.notify_one();
                        tokio::time::sleep(Duration::from_millis(200)).await;
                        session
                            .run(|s| s.commit())
                            .await
                            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
                        Ok::<_, StatusCode>(StatusCode::OK)
                    }
                }),
            )
            .route(
                "/read",
                get(|session: DbSession| async move {
                    let count = session
                        .run(|s| {
                            s.query_row("SELECT COUNT(*) FROM notes", &[], |row| {
                                row.get::<_, i64>(0)
                            })
                        })
                        .await
                        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
                    Ok::<_, StatusCode>(Json(json!({ "count": count })))
                }),
            ),
    );

    let write = tokio::spawn({
        let router = router.clone();
        async move { get_json(&router, "/write").await }
    });
    written.notified().await;

    let (read_status, body) = get_json(&router, "/read").await;
    let (write_status, _) = write.await.unwrap();

    assert_eq!(write_status, StatusCode::OK);
    assert_eq!(read_status, StatusCode::OK);
    assert_eq!(body["count"], 1);
}

#[tokio::test]
async fn every_extension_binds_a_session() {
    let mut app = memory_app();
    SqlService::builder()
        .database_uri("sqlite://")
        .extension_key("analytics")
        .init_app(&mut app)
        .unwrap();

    let router = app.router(Router::new().route(
        "/sessions",
        get(|sessions: RequestSessions| async move {
            Json(json!({
                "count": sessions.len(),
                "database": sessions.get("database").is_some(),
                "analytics": sessions.get("analytics").is_some(),
                "primary": sessions.primary().map(|s| s.key().to_string()),
            }))
        }),
    ));

    let (status, body) = get_json(&router, "/sessions").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 2);
    assert_eq!(body["database"], true);
    assert_eq!(body["analytics"], true);
    assert_eq!(body["primary"], "database");

    for key in ["database", "analytics"] {
        let service = app.sql(key).unwrap();
        let stats = service.database().stats();
        assert_eq!(stats.opened(), 1, "{key}");
        assert_eq!(stats.closed(), 1, "{key}");
    }
}

#[tokio::test]
async fn reconfigure_applies_to_next_request() {
    let mut app = memory_app();
    let router = app.router(Router::new().route("/session", get(session_info)));

    let (_, body) = get_json(&router, "/session").await;
    assert_eq!(body["autoflush"], true);

    let updated = parse_config(
        r#"
        SQL_DATABASE_URI = "sqlite:///:memory:"
        SQL_AUTOFLUSH = false
        SQL_EXPIRE_ON_COMMIT = false
        "#,
    )
    .unwrap();
    app.reconfigure(updated).unwrap();

    let (_, body) = get_json(&router, "/session").await;
    assert_eq!(body["autoflush"], false);
    assert_eq!(body["expire_on_commit"], false);
}

#[tokio::test]
async fn invalid_reconfigure_leaves_options_unchanged() {
    let mut app = memory_app();
    let invalid = parse_config(
        r#"
        SQL_DATABASE_URI = "sqlite://"
        SQL_AUTOFLUSH = false
        SQL_SESSION_OPTIONS = { transaction = "eventually" }
        "#,
    )
    .unwrap();

    assert!(app.reconfigure(invalid).is_err());
    assert!(app.sql("database").unwrap().session_options().autoflush);
    assert_eq!(app.config().sql.autoflush, None);
}

#[tokio::test]
async fn cancelled_request_closes_its_session() {
    let app = memory_app();
    let service = app.sql("database").unwrap();
    let router = app.router(Router::new().route(
        "/slow",
        get(|_session: DbSession| async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            StatusCode::OK
        }),
    ));

    let request = tokio::spawn(async move {
        router
            .oneshot(Request::builder().uri("/slow").body(Body::empty()).unwrap())
            .await
    });

    let stats = service.database().stats();
    wait_until(|| stats.opened() == 1).await;
    request.abort();
    wait_until(|| stats.closed() == 1).await;
    assert_eq!(stats.active(), 0);
}

async fn wait_until<F: Fn() -> bool>(condition: F) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 5s");
}
