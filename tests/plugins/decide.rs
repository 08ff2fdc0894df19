use decisioning::core::asof::PointInTime;
use decisioning::core::error::DecisioningError;
use decisioning::core::registry::{Entity, EntityRef, TypeRegistry};
use decisioning::core::store::Store;
use decisioning::core::time::{FixedClock, Timestamp};
use decisioning::plugins::decide::{
    DecisionDraft, DecisionFilter, finalize_decision, get_decision, list_decisions,
    record_decision, resolve_target,
};
use decisioning::plugins::roles::{NewAssignment, assign_role};
use rusqlite::{Connection, params};
use serde_json::json;
use std::sync::Arc;
use tempfile::tempdir;
use time::Duration;

const T0: i64 = 1_750_000_000_000_000;

fn test_store() -> (tempfile::TempDir, Store, Arc<FixedClock>) {
    let tmp = tempdir().unwrap();
    let clock = Arc::new(FixedClock::new(Timestamp::from_micros(T0)));
    let store = Store::open(tmp.path()).unwrap().with_clock(clock.clone());
    (tmp, store, clock)
}

fn t0() -> Timestamp {
    Timestamp::from_micros(T0)
}

fn draft(target: &str) -> DecisionDraft {
    DecisionDraft::new(EntityRef::new("invoice", target), "approve")
        .actor("ana")
        .snapshot(json!({"total": 100}))
}

#[test]
fn test_decision_without_actor_fails_validation() {
    let (_tmp, store, _clock) = test_store();
    let missing_actor = DecisionDraft::new(EntityRef::new("invoice", "1"), "approve").snapshot(json!({}));

    let err = record_decision(&store, &missing_actor).unwrap_err();
    assert!(matches!(err, DecisioningError::ValidationError(_)));
    assert!(format!("{}", err).contains("decision requires an actor"));
    assert!(list_decisions(&store, &DecisionFilter::default()).unwrap().is_empty());
}

#[test]
fn test_blank_actor_and_missing_snapshot_are_rejected() {
    let (_tmp, store, _clock) = test_store();
    let blank = draft("1").actor("  ");
    assert!(format!("{}", record_decision(&store, &blank).unwrap_err()).contains("actor"));

    let no_snapshot = DecisionDraft::new(EntityRef::new("invoice", "1"), "approve").actor("ana");
    assert!(format!("{}", record_decision(&store, &no_snapshot).unwrap_err()).contains("snapshot"));

    let no_action = DecisionDraft::new(EntityRef::new("invoice", "1"), " ")
        .actor("ana")
        .snapshot(json!({}));
    assert!(format!("{}", record_decision(&store, &no_action).unwrap_err()).contains("action"));
}

#[test]
fn test_empty_snapshot_with_actor_is_accepted() {
    let (_tmp, store, _clock) = test_store();
    let d = DecisionDraft::new(EntityRef::new("invoice", "1"), "approve")
        .actor("ana")
        .snapshot(json!({}));
    let record = record_decision(&store, &d).unwrap();
    assert_eq!(record.snapshot, json!({}));
    assert!(record.id.starts_with("DD_"));
}

#[test]
fn test_record_and_get_round_trip() {
    let (_tmp, store, _clock) = test_store();
    let d = draft("42")
        .on_behalf_of("finance")
        .authority_context(json!({"policy": "P-7"}))
        .outcome(json!({"approved": true}));
    let record = record_decision(&store, &d).unwrap();

    assert_eq!(record.effective_at, t0());
    assert_eq!(record.recorded_at, t0());
    assert!(!record.is_final());

    let loaded = get_decision(&store, &record.id).unwrap();
    assert_eq!(loaded, record);
    assert_eq!(loaded.target, EntityRef::new("invoice", "42"));
    assert_eq!(loaded.on_behalf_of.as_deref(), Some("finance"));
    assert_eq!(loaded.authority_context["policy"], "P-7");
}

#[test]
fn test_get_unknown_decision_is_not_found() {
    let (_tmp, store, _clock) = test_store();
    let err = get_decision(&store, "DD_missing").unwrap_err();
    assert!(format!("{}", err).contains("Decision 'DD_missing' not found"));
}

#[test]
fn test_backdated_decision_keeps_recorded_at() {
    let (_tmp, store, _clock) = test_store();
    let earlier = t0() - Duration::days(3);
    let record = record_decision(&store, &draft("1").effective_at(earlier)).unwrap();

    assert_eq!(record.effective_at, earlier);
    assert_eq!(record.recorded_at, t0());
    assert!(record.is_effective_at(earlier));
    assert!(!record.is_effective_at(earlier - Duration::seconds(1)));
}

#[test]
fn test_list_as_of_includes_decisions_effective_at_that_instant() {
    let (_tmp, store, clock) = test_store();
    let first = record_decision(&store, &draft("1")).unwrap();
    clock.advance(Duration::hours(1));
    let second = record_decision(&store, &draft("2")).unwrap();

    let at_t0 = list_decisions(
        &store,
        &DecisionFilter {
            as_of: Some(t0()),
            ..DecisionFilter::default()
        },
    )
    .unwrap();
    assert_eq!(at_t0.len(), 1);
    assert_eq!(at_t0[0].id, first.id);

    let all = list_decisions(&store, &DecisionFilter::default()).unwrap();
    assert_eq!(
        all.iter().map(|d| d.id.as_str()).collect::<Vec<_>>(),
        vec![first.id.as_str(), second.id.as_str()]
    );
}

#[test]
fn test_list_filters_by_target_action_and_actor() {
    let (_tmp, store, _clock) = test_store();
    record_decision(&store, &draft("1")).unwrap();
    record_decision(&store, &draft("2")).unwrap();
    record_decision(&store, &draft("1").actor("bo")).unwrap();
    record_decision(
        &store,
        &DecisionDraft::new(EntityRef::new("invoice", "1"), "reject")
            .actor("ana")
            .snapshot(json!({})),
    )
    .unwrap();

    let for_one = list_decisions(
        &store,
        &DecisionFilter {
            target: Some(EntityRef::new("invoice", "1")),
            ..DecisionFilter::default()
        },
    )
    .unwrap();
    assert_eq!(for_one.len(), 3);

    let approvals_by_ana = list_decisions(
        &store,
        &DecisionFilter {
            action: Some("approve".to_string()),
            actor: Some("ana".to_string()),
            ..DecisionFilter::default()
        },
    )
    .unwrap();
    assert_eq!(approvals_by_ana.len(), 2);

    let by_type = list_decisions(
        &store,
        &DecisionFilter {
            target_type: Some("basket".to_string()),
            ..DecisionFilter::default()
        },
    )
    .unwrap();
    assert!(by_type.is_empty());
}

#[test]
fn test_finalize_sets_outcome_once() {
    let (_tmp, store, clock) = test_store();
    let record = record_decision(&store, &draft("1")).unwrap();
    clock.advance(Duration::minutes(5));

    let final_record = finalize_decision(&store, &record.id, Some(json!({"approved": true}))).unwrap();
    assert!(final_record.is_final());
    assert_eq!(final_record.finalized_at, Some(t0() + Duration::minutes(5)));
    assert_eq!(get_decision(&store, &record.id).unwrap().outcome, json!({"approved": true}));

    let err = finalize_decision(&store, &record.id, None).unwrap_err();
    assert!(format!("{}", err).contains("already final"));
}

#[test]
fn test_finalize_without_outcome_keeps_existing_outcome() {
    let (_tmp, store, _clock) = test_store();
    let record = record_decision(&store, &draft("1").outcome(json!({"score": 3}))).unwrap();
    let final_record = finalize_decision(&store, &record.id, None).unwrap();
    assert_eq!(final_record.outcome, json!({"score": 3}));
}

#[test]
fn test_evidence_columns_cannot_be_rewritten() {
    let (_tmp, store, _clock) = test_store();
    let record = record_decision(&store, &draft("1")).unwrap();
    let conn: Connection = store.connect().unwrap();

    let update = conn.execute(
        "UPDATE decisions SET actor = 'mallory' WHERE id = ?1",
        params![record.id],
    );
    assert!(update.unwrap_err().to_string().contains("immutable"));

    let snapshot = conn.execute(
        "UPDATE decisions SET snapshot = '{}' WHERE id = ?1",
        params![record.id],
    );
    assert!(snapshot.is_err());

    let delete = conn.execute("DELETE FROM decisions WHERE id = ?1", params![record.id]);
    assert!(delete.unwrap_err().to_string().contains("append-only"));

    assert_eq!(get_decision(&store, &record.id).unwrap(), record);
}

#[test]
fn test_final_decision_rejects_raw_outcome_update() {
    let (_tmp, store, _clock) = test_store();
    let record = record_decision(&store, &draft("1")).unwrap();
    finalize_decision(&store, &record.id, None).unwrap();

    let conn = store.connect().unwrap();
    let update = conn.execute(
        "UPDATE decisions SET outcome = '{\"x\":1}' WHERE id = ?1",
        params![record.id],
    );
    assert!(update.unwrap_err().to_string().contains("decision is final"));
}

#[test]
fn test_resolve_target_through_registry() {
    let (_tmp, store, _clock) = test_store();
    let assignment = assign_role(&store, &NewAssignment::new("ana", "approver")).unwrap();
    let about_role = DecisionDraft::new(assignment.entity_ref(), "review")
        .actor("bo")
        .snapshot(json!({}));
    let decision = record_decision(&store, &about_role).unwrap();

    let registry = TypeRegistry::with_builtins();
    let resolved = resolve_target(&store, &registry, &decision).unwrap();
    assert_eq!(resolved["role"], "approver");
    assert_eq!(resolved["subject"], "ana");

    let decision_ref = registry.resolve(&store, &decision.entity_ref()).unwrap();
    assert_eq!(decision_ref["action"], "review");
}

#[test]
fn test_resolve_unknown_target_type_is_not_found() {
    let (_tmp, store, _clock) = test_store();
    let decision = record_decision(&store, &draft("1")).unwrap();
    let registry = TypeRegistry::with_builtins();

    let err = resolve_target(&store, &registry, &decision).unwrap_err();
    assert!(format!("{}", err).contains("unknown entity type 'invoice'"));

    let mut registry = registry;
    registry.register("invoice", |_conn: &Connection, id: &str| {
        Ok(Some(json!({"id": id, "total": 100})))
    });
    let resolved = resolve_target(&store, &registry, &decision).unwrap();
    assert_eq!(resolved["total"], 100);
}
