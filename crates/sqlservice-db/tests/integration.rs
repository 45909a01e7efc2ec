use sqlservice_db::{
    Database, DatabaseOptions, DatabaseUri, DbError, ModelBase, ParamStyle, PoolClass,
    SessionClass, SessionOptions, TableDef, Value,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

fn users_base() -> ModelBase {
    let base = ModelBase::default();
    base.register(TableDef::new(
        "users",
        "id INTEGER PRIMARY KEY, name TEXT NOT NULL",
    ));
    base
}

fn memory_db() -> Database {
    let mut options = DatabaseOptions::new(DatabaseUri::Memory);
    options.model_base = users_base();
    let db = Database::connect(options).expect("failed to create engine");
    db.create_all().expect("failed to create tables");
    db
}

fn count_users(db: &Database) -> i64 {
    let mut session = db.session().expect("failed to open session");
    let count = session
        .query_row("SELECT COUNT(*) FROM users", &[], |row| row.get(0))
        .expect("count query failed")
        .expect("count returns a row");
    session.close().expect("close failed");
    count
}

fn insert_user(id: i64, name: &str) -> (String, Vec<Value>) {
    (
        "INSERT INTO users (id, name) VALUES (?1, ?2)".to_string(),
        vec![Value::Integer(id), Value::Text(name.to_string())],
    )
}

#[test]
fn every_opened_session_is_closed_once() {
    let db = memory_db();
    let mut ids = HashSet::new();

    for _ in 0..5 {
        let mut session = db.session().expect("failed to open session");
        assert!(ids.insert(session.id()), "session ids must be unique");
        session.close().expect("close failed");
    }

    assert_eq!(db.stats().opened(), 5);
    assert_eq!(db.stats().closed(), 5);
    assert_eq!(db.stats().active(), 0);
}

#[test]
fn closed_session_is_terminal() {
    let db = memory_db();
    let mut session = db.session().unwrap();
    session.close().unwrap();

    assert!(session.is_closed());
    assert!(matches!(session.close(), Err(DbError::SessionClosed)));
    assert!(matches!(
        session.execute("SELECT 1", &[]),
        Err(DbError::SessionClosed)
    ));
    assert_eq!(db.stats().closed(), 1, "second close must not count");
}

#[test]
fn dropping_an_open_session_closes_it() {
    let db = memory_db();
    {
        let _session = db.session().unwrap();
        assert_eq!(db.stats().active(), 1);
    }
    assert_eq!(db.stats().closed(), 1);
}

#[test]
fn default_session_options() {
    let db = memory_db();
    let session = db.session().unwrap();
    assert_eq!(session.options(), SessionOptions::default());
    assert!(session.options().autoflush);
    assert!(session.options().expire_on_commit);
}

#[test]
fn autoflush_makes_pending_writes_visible_to_queries() {
    let db = memory_db();
    let mut session = db.session().unwrap();
    let (sql, params) = insert_user(1, "ada");
    session.add(sql, &params).unwrap();
    assert_eq!(session.pending_count(), 1);

    let count: i64 = session
        .query_row("SELECT COUNT(*) FROM users", &[], |row| row.get(0))
        .unwrap()
        .unwrap();
    assert_eq!(count, 1);
    assert_eq!(session.pending_count(), 0);
}

#[test]
fn without_autoflush_writes_wait_for_flush() {
    let db = memory_db();
    let mut session = db
        .session_with(SessionOptions {
            autoflush: false,
            ..SessionOptions::default()
        })
        .unwrap();
    let (sql, params) = insert_user(1, "ada");
    session.add(sql, &params).unwrap();

    let count: i64 = session
        .query_row("SELECT COUNT(*) FROM users", &[], |row| row.get(0))
        .unwrap()
        .unwrap();
    assert_eq!(count, 0);
    assert_eq!(session.pending_count(), 1);

    assert_eq!(session.flush().unwrap(), 1);
    let count: i64 = session
        .query_row("SELECT COUNT(*) FROM users", &[], |row| row.get(0))
        .unwrap()
        .unwrap();
    assert_eq!(count, 1);
}

#[test]
fn close_discards_uncommitted_work() {
    let db = memory_db();

    let mut session = db.session().unwrap();
    let (sql, params) = insert_user(1, "ada");
    session.execute(&sql, &params).unwrap();
    assert!(session.in_transaction());
    session.close().unwrap();
    assert_eq!(count_users(&db), 0);

    let mut session = db.session().unwrap();
    session.execute(&sql, &params).unwrap();
    session.commit().unwrap();
    assert!(!session.in_transaction());
    session.close().unwrap();
    assert_eq!(count_users(&db), 1);
}

#[test]
fn memory_reader_waits_for_concurrent_writer() {
    let db = Arc::new(memory_db());

    let mut writer = db.session().unwrap();
    let (sql, params) = insert_user(1, "ada");
    writer.add(sql, &params).unwrap();
    writer.flush().unwrap();
    assert!(writer.in_transaction());

    let reader_db = Arc::clone(&db);
    let reader = thread::spawn(move || count_users(&reader_db));

    thread::sleep(Duration::from_millis(100));
    writer.commit().unwrap();
    writer.close().unwrap();

    assert_eq!(reader.join().expect("reader should not fail"), 1);
}

#[test]
fn failed_flush_rolls_back_the_transaction() {
    let db = memory_db();
    let mut session = db.session().unwrap();

    let (sql, params) = insert_user(1, "ada");
    session.add(sql.clone(), &params).unwrap();
    session.add(sql, &params).unwrap(); // duplicate primary key

    let err = session.flush().expect_err("duplicate key should fail");
    assert!(matches!(err, DbError::Database(_)));
    assert_eq!(session.pending_count(), 0);
    assert!(!session.in_transaction());
    session.close().unwrap();

    assert_eq!(count_users(&db), 0);
}

#[test]
fn get_uses_identity_map_and_expires_on_commit() {
    let db = memory_db();
    let mut setup = db.session().unwrap();
    let (sql, params) = insert_user(7, "grace");
    setup.execute(&sql, &params).unwrap();
    setup.commit().unwrap();
    setup.close().unwrap();

    let mut session = db.session().unwrap();
    let row = session.get("users", 7).unwrap().expect("row should exist");
    assert_eq!(row, vec![Value::Integer(7), Value::Text("grace".to_string())]);
    assert!(session.is_cached("users", 7));
    assert!(session.get("users", 8).unwrap().is_none());
    assert!(!session.is_cached("users", 8));

    session.commit().unwrap();
    assert!(!session.is_cached("users", 7), "commit should expire loaded rows");

    let mut keeper = db
        .session_with(SessionOptions {
            expire_on_commit: false,
            ..SessionOptions::default()
        })
        .unwrap();
    keeper.get("users", 7).unwrap();
    keeper.commit().unwrap();
    assert!(keeper.is_cached("users", 7));
    keeper.rollback().unwrap();
    assert!(!keeper.is_cached("users", 7), "rollback always expires");
}

#[test]
fn get_rejects_unregistered_tables() {
    let db = memory_db();
    let mut session = db.session().unwrap();
    let err = session.get("orders", 1).expect_err("orders is not a model");
    assert!(matches!(err, DbError::UnknownTable { table, .. } if table == "orders"));
}

#[test]
fn get_honours_text_keys_and_named_param_style() {
    let base = ModelBase::default();
    base.register(TableDef::new("widgets", "sku TEXT PRIMARY KEY, qty INTEGER").with_primary_key("sku"));
    let mut options = DatabaseOptions::new(DatabaseUri::Memory);
    options.model_base = base;
    options.engine.param_style = ParamStyle::Named;
    let db = Database::connect(options).unwrap();
    db.create_all().unwrap();

    let mut session = db.session().unwrap();
    session
        .execute(
            "INSERT INTO widgets (sku, qty) VALUES (?1, ?2)",
            &[Value::Text("w-1".to_string()), Value::Integer(3)],
        )
        .unwrap();
    let row = session.get("widgets", "w-1").unwrap().expect("row should exist");
    assert_eq!(row[1], Value::Integer(3));
}

#[test]
fn read_only_sessions_refuse_writes_and_reset_the_connection() {
    let mut options = DatabaseOptions::new(DatabaseUri::Memory);
    options.model_base = users_base();
    options.session_class = SessionClass::ReadOnly;
    options.engine.pool_class = PoolClass::Static;
    let db = Database::connect(options).unwrap();
    db.create_all().unwrap();

    let mut session = db.session().unwrap();
    let (sql, params) = insert_user(1, "ada");
    let err = session.execute(&sql, &params).expect_err("write must fail");
    assert!(matches!(err, DbError::Database(_)));
    session.close().unwrap();

    let conn = db.pool().get().unwrap();
    let query_only: i32 = conn
        .query_row("PRAGMA query_only;", [], |row| row.get(0))
        .unwrap();
    assert_eq!(query_only, 0, "connection must be reset before reuse");
}

#[test]
fn file_database_persists_across_engines() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("app.db");
    let uri: DatabaseUri = format!("sqlite:///{}", path.display()).parse().unwrap();

    {
        let mut options = DatabaseOptions::new(uri.clone());
        options.model_base = users_base();
        let db = Database::connect(options).unwrap();
        db.create_all().unwrap();
        let mut session = db.session().unwrap();
        let (sql, params) = insert_user(1, "ada");
        session.add(sql, &params).unwrap();
        session.commit().unwrap();
    }

    let mut options = DatabaseOptions::new(uri);
    options.model_base = users_base();
    let db = Database::connect(options).unwrap();
    assert_eq!(count_users(&db), 1);

    assert_eq!(db.drop_all().unwrap(), 1);
    let mut session = db.session().unwrap();
    let missing = session.query_row("SELECT COUNT(*) FROM users", &[], |row| row.get::<_, i64>(0));
    assert!(missing.is_err(), "users table should be gone");
}
