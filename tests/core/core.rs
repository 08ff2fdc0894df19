use decisioning::core::asof::Query;
use decisioning::core::broker::{DbBroker, read_audit_log};
use decisioning::core::config::{CONFIG_FILE_NAME, LockPolicy, load_config, parse_config};
use decisioning::core::db;
use decisioning::core::error::DecisioningError;
use decisioning::core::registry::{EntityRef, TypeRegistry};
use decisioning::core::store::Store;
use decisioning::core::time::{Clock, FixedClock, Timestamp};
use rusqlite::{Connection, params};
use serde_json::json;
use std::fs;
use std::sync::Arc;
use tempfile::tempdir;

#[test]
fn config_defaults_when_file_is_missing() {
    let tmp = tempdir().expect("tempdir");
    let config = load_config(tmp.path()).expect("load defaults");
    assert_eq!(config.database.file_name, "decisioning.db");
    assert_eq!(config.database.busy_timeout_secs, 5);
    assert_eq!(config.idempotency.lock_policy, LockPolicy::Relaxed);
    assert_eq!(config.idempotency.default_ttl_secs, None);
    assert_eq!(config.retention.days, 7);
    assert!(config.audit.enabled);
}

#[test]
fn config_file_overrides_only_named_fields() {
    let tmp = tempdir().expect("tempdir");
    fs::write(
        tmp.path().join(CONFIG_FILE_NAME),
        r#"
[idempotency]
lock_policy = "hold_for_execution"
default_ttl_secs = 3600

[retention]
days = 30
"#,
    )
    .expect("write config");

    let store = Store::open(tmp.path()).expect("open store");
    assert_eq!(store.config.idempotency.lock_policy, LockPolicy::HoldForExecution);
    assert_eq!(store.config.idempotency.default_ttl_secs, Some(3600));
    assert_eq!(store.config.retention.days, 30);
    assert!(!store.config.retention.include_processing);
    assert_eq!(store.config.database.file_name, "decisioning.db");
}

#[test]
fn config_parse_errors_are_reported() {
    let bad_policy = parse_config("[idempotency]\nlock_policy = \"sometimes\"\n").unwrap_err();
    assert!(matches!(bad_policy, DecisioningError::ConfigFileError(_)));

    let negative = parse_config("[retention]\ndays = -3\n").unwrap_err();
    assert!(format!("{}", negative).contains("retention.days"));

    let huge = parse_config("[retention]\ndays = 200000000000000\n").unwrap_err();
    assert!(format!("{}", huge).contains("retention.days is too large"));
}

#[test]
fn config_serializes_back_to_toml() {
    let config = parse_config("[audit]\nenabled = false\n").expect("parse");
    let rendered = toml::to_string_pretty(&config).expect("render");
    assert_eq!(parse_config(&rendered).expect("reparse"), config);
}

#[test]
fn store_open_applies_schema_and_pragmas() {
    let tmp = tempdir().expect("tempdir");
    let store = Store::open(tmp.path()).expect("open store");
    assert!(store.db_path().exists());

    let conn = store.connect().expect("connect");
    let fk_on: i64 = conn
        .query_row("PRAGMA foreign_keys;", [], |row| row.get(0))
        .expect("pragma foreign_keys");
    assert_eq!(fk_on, 1);
    let mode: String = conn
        .query_row("PRAGMA journal_mode;", [], |row| row.get(0))
        .expect("pragma journal_mode");
    assert_eq!(mode.to_lowercase(), "wal");

    for table in ["idempotency_keys", "decisions", "role_assignments"] {
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
                params![table],
                |row| row.get(0),
            )
            .expect("sqlite_master");
        assert_eq!(count, 1, "missing table {}", table);
    }

    // reopening is idempotent
    Store::open(tmp.path()).expect("reopen store");
    db::initialize_schema(&conn).expect("reapply schema");
}

#[test]
fn broker_round_trip_and_audit() {
    let tmp = tempdir().expect("tempdir");
    let store = Store::open(tmp.path()).expect("open store");
    let broker = store.broker();

    broker
        .with_tx("tester", Some("intent-1"), "test.insert", |tx| {
            tx.execute("CREATE TABLE IF NOT EXISTS t (id INTEGER)", [])?;
            tx.execute("INSERT INTO t (id) VALUES (1)", [])?;
            Ok(())
        })
        .expect("broker success path");

    let result: Result<(), DecisioningError> = broker.with_tx("tester", None, "test.fail", |tx| {
        tx.execute("INSERT INTO t (id) VALUES (2)", [])?;
        Err(DecisioningError::ValidationError("intentional".to_string()))
    });
    assert!(result.is_err());

    let rows: i64 = store
        .connect()
        .expect("connect")
        .query_row("SELECT COUNT(*) FROM t", [], |row| row.get(0))
        .expect("count");
    assert_eq!(rows, 1, "failed transaction must roll back");

    let events = read_audit_log(&store.audit_log_path().expect("audit enabled")).expect("read audit");
    let insert = events.iter().find(|ev| ev.op == "test.insert").expect("insert event");
    assert_eq!(insert.status, "success");
    assert_eq!(insert.actor, "tester");
    assert_eq!(insert.intent_ref.as_deref(), Some("intent-1"));
    assert_eq!(insert.db_id, "decisioning.db");
    let fail = events.iter().find(|ev| ev.op == "test.fail").expect("fail event");
    assert_eq!(fail.status, "error");
    assert!(events.iter().all(|ev| !ev.event_id.is_empty()));
}

#[test]
fn audit_log_can_be_disabled() {
    let tmp = tempdir().expect("tempdir");
    fs::write(tmp.path().join(CONFIG_FILE_NAME), "[audit]\nenabled = false\n").expect("write config");
    let store = Store::open(tmp.path()).expect("open store");
    assert!(store.audit_log_path().is_none());

    store
        .broker()
        .with_conn("tester", None, "test.noop", |_| Ok(()))
        .expect("noop");
    assert!(!tmp.path().join("broker.events.jsonl").exists());
}

#[test]
fn missing_audit_log_reads_empty() {
    let tmp = tempdir().expect("tempdir");
    let events = read_audit_log(&tmp.path().join("nope.jsonl")).expect("read");
    assert!(events.is_empty());
}

#[test]
fn standalone_broker_writes_next_to_given_log() {
    let tmp = tempdir().expect("tempdir");
    let log = tmp.path().join("events.jsonl");
    let broker = DbBroker::new(&tmp.path().join("x.db"), 1, Some(log.clone()));
    broker
        .with_conn("tester", None, "test.ping", |conn| {
            conn.execute_batch("CREATE TABLE IF NOT EXISTS ping (id INTEGER);")?;
            Ok(())
        })
        .expect("ping");
    let events = read_audit_log(&log).expect("read");
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].db_id, "x.db");
}

#[test]
fn fixed_clock_drives_store_time() {
    let tmp = tempdir().expect("tempdir");
    let start = Timestamp::parse_rfc3339("2025-03-01T12:00:00Z").expect("parse");
    let clock = Arc::new(FixedClock::new(start));
    let store = Store::open(tmp.path()).expect("open store").with_clock(clock.clone());

    assert_eq!(store.now(), start);
    let later = clock.advance(time::Duration::minutes(90));
    assert_eq!(store.now(), later);
    assert_eq!(store.now().to_rfc3339(), "2025-03-01T13:30:00Z");

    // clones share the clock
    let cloned = store.clone();
    clock.set(start);
    assert_eq!(cloned.now(), start);
    assert_eq!(cloned.clock().now(), start);
}

#[test]
fn timestamp_serializes_as_rfc3339() {
    let ts = Timestamp::parse_rfc3339("2024-06-30T08:15:00.250Z").expect("parse");
    let value = serde_json::to_value(ts).expect("serialize");
    assert_eq!(value, json!("2024-06-30T08:15:00.25Z"));
    let back: Timestamp = serde_json::from_value(value).expect("deserialize");
    assert_eq!(back, ts);
    assert!(Timestamp::parse_rfc3339("yesterday").is_err());
}

fn widget_resolver(conn: &Connection, id: &str) -> Result<Option<serde_json::Value>, DecisioningError> {
    let found = conn.query_row(
        "SELECT name FROM widgets WHERE id = ?1",
        params![id],
        |row| row.get::<_, String>(0),
    );
    match found {
        Ok(name) => Ok(Some(json!({"id": id, "name": name}))),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[test]
fn registry_lifecycle() {
    let tmp = tempdir().expect("tempdir");
    let store = Store::open(tmp.path()).expect("open store");
    store
        .connect()
        .expect("connect")
        .execute_batch(
            "CREATE TABLE widgets (id TEXT PRIMARY KEY, name TEXT NOT NULL);
             INSERT INTO widgets VALUES ('w1', 'sprocket');",
        )
        .expect("seed widgets");

    let mut registry = TypeRegistry::new();
    assert!(registry.type_tags().is_empty());
    assert!(registry.register("widget", widget_resolver).is_none());
    assert!(registry.contains("widget"));

    let widget = registry.resolve(&store, &EntityRef::new("widget", "w1")).expect("resolve");
    assert_eq!(widget["name"], "sprocket");

    let missing = registry.resolve(&store, &EntityRef::new("widget", "w9")).unwrap_err();
    assert!(matches!(missing, DecisioningError::NotFound(_)));
    assert!(format!("{}", missing).contains("widget:w9"));

    // re-registering returns the replaced resolver
    let replaced = registry.register("widget", |_: &Connection, _: &str| Ok(Some(json!({"stub": true}))));
    assert!(replaced.is_some());
    assert_eq!(
        registry.resolve(&store, &EntityRef::new("widget", "w1")).expect("resolve stub")["stub"],
        true
    );

    assert!(registry.unregister("widget").is_some());
    assert!(registry.unregister("widget").is_none());
    let unknown = registry.resolve(&store, &EntityRef::new("widget", "w1")).unwrap_err();
    assert!(format!("{}", unknown).contains("unknown entity type 'widget'"));

    let mut builtins = TypeRegistry::with_builtins();
    assert_eq!(builtins.type_tags(), vec!["decision", "role_assignment"]);
    builtins.clear();
    assert!(builtins.get("decision").is_none());
}

#[test]
fn entity_ref_serializes_as_tagged_pair() {
    let r = EntityRef::new("invoice", 42);
    assert_eq!(r.to_string(), "invoice:42");
    let value = serde_json::to_value(&r).expect("serialize");
    assert_eq!(value, json!({"type": "invoice", "id": "42"}));
    let back: EntityRef = serde_json::from_value(value).expect("deserialize");
    assert_eq!(back, r);
}

#[test]
fn query_builder_composes_against_sqlite() {
    let tmp = tempdir().expect("tempdir");
    let store = Store::open(tmp.path()).expect("open store");
    let conn = store.connect().expect("connect");
    conn.execute_batch(
        "CREATE TABLE prices (sku TEXT, amount INTEGER, valid_from INTEGER NOT NULL, valid_to INTEGER);
         INSERT INTO prices VALUES ('a', 10, 0, 100);
         INSERT INTO prices VALUES ('a', 12, 100, NULL);
         INSERT INTO prices VALUES ('b', 7, 50, NULL);",
    )
    .expect("seed prices");

    let amount = |row: &rusqlite::Row<'_>| row.get::<_, i64>(0);
    let at = |micros: i64| Timestamp::from_micros(micros);

    let a_at_99 = Query::select("prices", "amount")
        .as_of(at(99))
        .filter_eq("sku", "a".to_string())
        .fetch(&conn, amount)
        .expect("fetch");
    assert_eq!(a_at_99, vec![10]);

    let a_at_100 = Query::select("prices", "amount")
        .filter_eq("sku", "a".to_string())
        .as_of(at(100))
        .fetch(&conn, amount)
        .expect("fetch");
    assert_eq!(a_at_100, vec![12]);

    let all_current = Query::select("prices", "amount")
        .current(at(1_000))
        .order_by("amount")
        .fetch(&conn, amount)
        .expect("fetch");
    assert_eq!(all_current, vec![7, 12]);

    let open_ended = Query::select("prices", "amount")
        .filter_null("valid_to")
        .order_by("amount DESC")
        .limit(1)
        .fetch(&conn, amount)
        .expect("fetch");
    assert_eq!(open_ended, vec![12]);
}
