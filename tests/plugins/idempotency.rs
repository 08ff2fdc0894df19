use decisioning::core::error::DecisioningError;
use decisioning::core::registry::EntityRef;
use decisioning::core::store::Store;
use decisioning::core::time::{FixedClock, Timestamp};
use decisioning::plugins::idempotency::{
    CleanupOptions, IdempotencyState, KeyFilter, NewKey, cleanup_keys, create_key, find_key,
    get_key, list_keys, save_key,
};
use std::sync::Arc;
use tempfile::tempdir;
use time::Duration;

const NOW: i64 = 1_760_000_000_000_000;

fn test_store() -> (tempfile::TempDir, Store) {
    let tmp = tempdir().unwrap();
    let store = Store::open(tmp.path())
        .unwrap()
        .with_clock(Arc::new(FixedClock::new(Timestamp::from_micros(NOW))));
    (tmp, store)
}

fn now() -> Timestamp {
    Timestamp::from_micros(NOW)
}

fn seed(store: &Store, key: NewKey) {
    create_key(&store.connect().unwrap(), &key).unwrap();
}

fn opts(days: i64) -> CleanupOptions {
    CleanupOptions {
        days,
        include_processing: false,
        dry_run: false,
    }
}

#[test]
fn test_duplicate_scope_key_is_rejected() {
    let (_tmp, store) = test_store();
    let conn = store.connect().unwrap();
    create_key(&conn, &NewKey::pending("orders", "k1", now())).unwrap();

    let err = create_key(&conn, &NewKey::pending("orders", "k1", now())).unwrap_err();
    assert!(matches!(err, DecisioningError::DuplicateKey { .. }));
    assert!(err.is_unique_violation());

    // same key under another scope is a different row
    create_key(&conn, &NewKey::pending("refunds", "k1", now())).unwrap();
}

#[test]
fn test_save_round_trips_mutable_fields() {
    let (_tmp, store) = test_store();
    let conn = store.connect().unwrap();
    let mut record = create_key(&conn, &NewKey::pending("orders", "k1", now()).request_hash("abc")).unwrap();
    assert_eq!(record.state, IdempotencyState::Pending);
    assert!(record.locked_at.is_none());

    record.begin_processing(now()).unwrap();
    record
        .succeed(serde_json::json!({"id": 7}), Some(EntityRef::new("order", 7)))
        .unwrap();
    save_key(&conn, &record).unwrap();

    let loaded = get_key(&conn, "orders", "k1").unwrap().unwrap();
    assert_eq!(loaded, record);
    assert_eq!(loaded.request_hash, "abc");
    assert_eq!(loaded.result_ref, Some(EntityRef::new("order", "7")));
}

#[test]
fn test_save_of_deleted_row_is_not_found() {
    let (_tmp, store) = test_store();
    let conn = store.connect().unwrap();
    let record = create_key(&conn, &NewKey::pending("orders", "gone", now())).unwrap();
    conn.execute("DELETE FROM idempotency_keys WHERE id = ?1", [record.id])
        .unwrap();

    let err = save_key(&conn, &record).unwrap_err();
    assert!(format!("{}", err).contains("orders:gone"));
}

#[test]
fn test_unique_index_rejects_raw_duplicate_insert() {
    let (_tmp, store) = test_store();
    let conn = store.connect().unwrap();
    create_key(&conn, &NewKey::pending("s", "k", now())).unwrap();
    let raw = conn.execute(
        "INSERT INTO idempotency_keys(scope, key, state, created_at) VALUES('s', 'k', 'pending', 0)",
        [],
    );
    assert!(raw.is_err());
}

#[test]
fn test_list_filters_by_scope_and_state() {
    let (_tmp, store) = test_store();
    seed(&store, NewKey::pending("orders", "a", now()));
    seed(&store, NewKey::processing("orders", "b", now()));
    seed(&store, NewKey::pending("refunds", "c", now()));

    let orders = list_keys(
        &store,
        &KeyFilter {
            scope: Some("orders".to_string()),
            ..KeyFilter::default()
        },
    )
    .unwrap();
    assert_eq!(orders.len(), 2);

    let processing = list_keys(
        &store,
        &KeyFilter {
            state: Some(IdempotencyState::Processing),
            ..KeyFilter::default()
        },
    )
    .unwrap();
    assert_eq!(processing.len(), 1);
    assert_eq!(processing[0].key, "b");

    let limited = list_keys(
        &store,
        &KeyFilter {
            limit: Some(1),
            ..KeyFilter::default()
        },
    )
    .unwrap();
    assert_eq!(limited.len(), 1);
}

#[test]
fn test_cleanup_removes_only_old_keys() {
    let (_tmp, store) = test_store();
    seed(&store, NewKey::pending("s", "old", now() - Duration::days(10)));
    seed(&store, NewKey::pending("s", "recent", now() - Duration::days(2)));

    let report = cleanup_keys(&store, opts(7)).unwrap();
    assert_eq!(report.deleted, 1);
    assert_eq!(report.matched, 1);
    assert_eq!(report.cutoff, now() - Duration::days(7));
    assert!(find_key(&store, "s", "old").unwrap().is_none());
    assert!(find_key(&store, "s", "recent").unwrap().is_some());
    assert_eq!(
        report.summary(),
        "Deleted 1 idempotency key(s) older than 7 day(s) or past expiry"
    );
}

#[test]
fn test_cleanup_dry_run_deletes_nothing() {
    let (_tmp, store) = test_store();
    seed(&store, NewKey::pending("s", "old", now() - Duration::days(10)));

    let report = cleanup_keys(
        &store,
        CleanupOptions {
            dry_run: true,
            ..opts(7)
        },
    )
    .unwrap();
    assert_eq!(report.matched, 1);
    assert_eq!(report.deleted, 0);
    assert!(report.summary().starts_with("Would delete 1"));
    assert!(find_key(&store, "s", "old").unwrap().is_some());
}

#[test]
fn test_cleanup_honors_custom_days() {
    let (_tmp, store) = test_store();
    seed(&store, NewKey::pending("s", "five", now() - Duration::days(5)));
    seed(&store, NewKey::pending("s", "two", now() - Duration::days(2)));

    assert_eq!(cleanup_keys(&store, opts(7)).unwrap().deleted, 0);
    assert_eq!(cleanup_keys(&store, opts(3)).unwrap().deleted, 1);
    assert!(find_key(&store, "s", "two").unwrap().is_some());
}

#[test]
fn test_cleanup_removes_expired_keys_regardless_of_age() {
    let (_tmp, store) = test_store();
    seed(
        &store,
        NewKey::pending("s", "expired", now() - Duration::hours(2))
            .expires_at(Some(now() - Duration::hours(1))),
    );
    seed(
        &store,
        NewKey::pending("s", "live", now() - Duration::hours(2))
            .expires_at(Some(now() + Duration::hours(1))),
    );

    let report = cleanup_keys(&store, opts(7)).unwrap();
    assert_eq!(report.deleted, 1);
    assert!(find_key(&store, "s", "expired").unwrap().is_none());
    assert!(find_key(&store, "s", "live").unwrap().is_some());
}

#[test]
fn test_cleanup_keeps_processing_unless_asked() {
    let (_tmp, store) = test_store();
    seed(&store, NewKey::processing("s", "stuck", now() - Duration::days(30)));

    assert_eq!(cleanup_keys(&store, opts(7)).unwrap().deleted, 0);
    assert!(find_key(&store, "s", "stuck").unwrap().is_some());

    let report = cleanup_keys(
        &store,
        CleanupOptions {
            include_processing: true,
            ..opts(7)
        },
    )
    .unwrap();
    assert_eq!(report.deleted, 1);
    assert!(find_key(&store, "s", "stuck").unwrap().is_none());
}

#[test]
fn test_cleanup_zero_days_removes_everything_before_now() {
    let (_tmp, store) = test_store();
    seed(&store, NewKey::pending("s", "a", now() - Duration::seconds(1)));
    seed(&store, NewKey::pending("s", "b", now()));

    let report = cleanup_keys(&store, opts(0)).unwrap();
    assert_eq!(report.deleted, 1);
    assert!(find_key(&store, "s", "b").unwrap().is_some());
}

#[test]
fn test_cleanup_rejects_negative_days() {
    let (_tmp, store) = test_store();
    let err = cleanup_keys(&store, opts(-1)).unwrap_err();
    assert!(format!("{}", err).contains("days must be >= 0"));
}

#[test]
fn test_cleanup_rejects_days_that_overflow() {
    let (_tmp, store) = test_store();
    seed(&store, NewKey::pending("s", "old", now() - Duration::days(10)));

    let err = cleanup_keys(&store, opts(200_000_000_000_000)).unwrap_err();
    assert!(matches!(err, DecisioningError::ValidationError(_)));
    assert!(format!("{}", err).contains("days is too large"));
    assert!(find_key(&store, "s", "old").unwrap().is_some());

    // the largest representable window clamps the cutoff instead
    let report = cleanup_keys(&store, opts(i64::MAX / 86_400)).unwrap();
    assert_eq!(report.deleted, 0);
    assert!(report.cutoff < Timestamp::from_micros(0));
}

#[test]
fn test_cleanup_defaults_come_from_config() {
    let (_tmp, store) = test_store();
    let defaults = CleanupOptions::from_config(&store.config.retention);
    assert_eq!(defaults.days, 7);
    assert!(!defaults.include_processing);
    assert!(!defaults.dry_run);
}
