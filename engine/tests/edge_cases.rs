//! Edge case tests for harmony-engine
//!
//! These tests cover boundary conditions and whole-engine scenarios through
//! the public API.

use harmony_engine::{
    overlay, ActionOptions, ActionResponse, ColumnSpec, DeltaEntry, DeltaOperation, EngineConfig,
    Error, Harmonic, HarmonicId, HttpResponse, LocalStore, MockTransport, RemoteSchema,
    StorageError, SyncEngine, SyncStatus, WriteOutcome, WriteRequest,
};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::sync::Arc;

fn schema(version: u32, database: &str) -> RemoteSchema {
    RemoteSchema {
        schema: [
            ("todos".to_string(), ColumnSpec::Indexes("++id, title".into())),
            ("projects".to_string(), ColumnSpec::Indexes("++id".into())),
        ]
        .into(),
        schema_version: version,
        database_version: database.into(),
        generated_at: None,
    }
}

fn open_store() -> LocalStore {
    let store = LocalStore::in_memory();
    store
        .initialize_schema(&["todos".to_string()], 1)
        .unwrap();
    store
}

/// Route engine logs to the test harness; `RUST_LOG` selects the level.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn engine_with(transport: Arc<MockTransport>, config: EngineConfig) -> SyncEngine {
    init_tracing();
    SyncEngine::builder()
        .config(config)
        .transport(transport)
        .build()
        .unwrap()
}

// ============================================================================
// Store Edge Cases
// ============================================================================

#[test]
fn closed_store_refuses_access() {
    let store = LocalStore::in_memory();
    assert!(!store.is_open());
    assert!(matches!(
        store.base("todos"),
        Err(Error::Storage(StorageError::Closed))
    ));
}

#[test]
fn unknown_table_is_reported() {
    let store = open_store();
    assert!(matches!(
        store.base("posts"),
        Err(Error::Storage(StorageError::UnknownTable(_)))
    ));
    assert!(store.table("todos_shadow").is_ok());
    assert!(store.table("todos_delta").is_err());
}

#[test]
fn bulk_add_is_all_or_nothing() {
    let store = open_store();
    let base = store.base("todos").unwrap();
    base.add(json!({"id": "a"})).unwrap();

    let result = base.bulk_add(vec![json!({"id": "b"}), json!({"id": "a"})]);
    assert!(matches!(
        result,
        Err(Error::Storage(StorageError::ConstraintViolation { .. }))
    ));
    assert!(base.get("b").unwrap().is_none());
    assert_eq!(base.count().unwrap(), 1);
}

#[test]
fn failed_transaction_leaves_no_trace() {
    let store = open_store();
    let result: harmony_engine::error::Result<()> = store.transaction(|tx| {
        tx.base("todos")?.put(json!({"id": "a"}))?;
        tx.shadow("todos")?.put(json!({"id": "b"}))?;
        tx.base("todos")?.put(json!({"title": "no id"}))?;
        Ok(())
    });

    assert!(matches!(result, Err(Error::MissingRecordId)));
    assert_eq!(store.base("todos").unwrap().count().unwrap(), 0);
    assert_eq!(store.shadow("todos").unwrap().count().unwrap(), 0);
}

#[test]
fn numeric_ids_are_normalized() {
    let store = open_store();
    let base = store.base("todos").unwrap();
    base.put(json!({"id": 7, "title": "numeric"})).unwrap();
    assert!(base.get("7").unwrap().is_some());
}

#[test]
fn reopening_same_generation_keeps_rows() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.json");

    let store = LocalStore::open_at(&path).unwrap();
    store
        .initialize_schema(&["todos".to_string()], 42)
        .unwrap();
    store.base("todos").unwrap().put(json!({"id": "a"})).unwrap();
    drop(store);

    let reopened = LocalStore::open_at(&path).unwrap();
    assert!(!reopened.is_open());
    assert_eq!(reopened.generation(), Some(42));
    reopened
        .initialize_schema(&["todos".to_string()], 42)
        .unwrap();
    assert!(reopened.base("todos").unwrap().get("a").unwrap().is_some());
}

// ============================================================================
// Overlay Edge Cases
// ============================================================================

#[test]
fn shadow_wins_over_base() {
    let merged = overlay::merge(
        vec![json!({"id": "1", "v": "base"}), json!({"id": "2", "v": "base"})],
        vec![json!({"id": "2", "v": "shadow"}), json!({"id": "3", "v": "new"})],
        &BTreeSet::new(),
        None,
    );
    let values: Vec<&Value> = merged.iter().map(|r| &r["v"]).collect();
    assert_eq!(values, vec!["base", "shadow", "new"]);
}

#[test]
fn pending_delete_hides_record() {
    let store = Arc::new(open_store());
    store.base("todos").unwrap().put(json!({"id": "1"})).unwrap();
    store.base("todos").unwrap().put(json!({"id": "2"})).unwrap();
    store
        .delta("todos")
        .unwrap()
        .add(DeltaEntry::pending(DeltaOperation::Delete, json!({"id": "1"}), 1))
        .unwrap();

    let overlay = harmony_engine::QueryOverlay::new(store.clone());
    let ids: Vec<Value> = overlay
        .all("todos")
        .unwrap()
        .into_iter()
        .map(|r| r["id"].clone())
        .collect();
    assert_eq!(ids, vec![json!("2")]);
    assert!(overlay.get("todos", "1").unwrap().is_none());
}

#[test]
fn merge_keeps_descending_order() {
    let merged = overlay::merge(
        vec![json!({"id": "a", "n": 9}), json!({"id": "b", "n": 3})],
        vec![json!({"id": "c", "n": 5})],
        &BTreeSet::new(),
        Some("n"),
    );
    let order: Vec<&Value> = merged.iter().map(|r| &r["n"]).collect();
    assert_eq!(order, vec![9, 5, 3]);
}

#[test]
fn empty_tables_merge_to_nothing() {
    assert!(overlay::merge(vec![], vec![], &BTreeSet::new(), Some("n")).is_empty());
}

// ============================================================================
// Harmonic Edge Cases
// ============================================================================

#[test]
fn harmonic_ids_order_numerically() {
    assert!(HarmonicId::from(10u64) > HarmonicId::from(9u64));
    assert_eq!(HarmonicId::new("0010"), HarmonicId::from(10u64));
    assert!(HarmonicId::new("01HZX") > HarmonicId::from(99u64));
}

#[test]
fn harmonic_accepts_numeric_wire_fields() {
    let harmonic: Harmonic = serde_json::from_value(json!({
        "id": 12,
        "table_name": "todos",
        "operation": "update",
        "record_id": 5,
        "data": "{\"title\":\"x\"}"
    }))
    .unwrap();

    let change = harmonic.decode().unwrap();
    assert_eq!(change.record_id, "5");
    assert_eq!(change.record, Some(json!({"id": "5", "title": "x"})));
}

#[test]
fn unknown_operation_fails_decode() {
    let mut harmonic = Harmonic::new(1u64, "todos", DeltaOperation::Create, "a", None);
    harmonic.operation = "upsert".into();
    assert!(matches!(harmonic.decode(), Err(Error::Sync { .. })));
}

// ============================================================================
// Engine Scenarios
// ============================================================================

#[tokio::test]
async fn rejected_optimistic_create_disappears() {
    let transport = Arc::new(MockTransport::new());
    transport.set_schema(schema(1, "1_1"));
    let engine = engine_with(transport.clone(), EngineConfig::new("u1"));
    engine.start().await.unwrap();

    transport.respond_to_action(Ok(ActionResponse::rejected("duplicate title")));
    let result = engine
        .actions()
        .execute_action(
            "create_todo",
            |a| {
                a.create("todos", json!({"id": "t1", "title": "dup"}));
                None
            },
            ActionOptions::new(),
        )
        .await;

    assert!(matches!(result, Err(Error::ServerRejection { .. })));
    assert!(engine.records("todos").unwrap().is_empty());
    let deltas = engine.store().delta("todos").unwrap().to_vec().unwrap();
    assert_eq!(deltas.len(), 1);
    assert_eq!(deltas[0].sync_status, SyncStatus::Rejected);
    assert_eq!(deltas[0].rejected_reason.as_deref(), Some("duplicate title"));
}

#[tokio::test]
async fn server_assigned_id_does_not_duplicate_record() {
    let transport = Arc::new(MockTransport::new());
    transport.set_schema(schema(1, "1_1"));
    let engine = engine_with(transport.clone(), EngineConfig::new("u1"));
    engine.start().await.unwrap();

    transport.respond_to_request(Ok(HttpResponse {
        status: 200,
        body: json!({"success": true}),
    }));
    let outcome = engine
        .actions()
        .write(
            WriteRequest::new("todos", DeltaOperation::Create, json!({"title": "Milk"}))
                .with_optimistic(json!({"id": "tmp-1", "title": "Milk"})),
        )
        .await
        .unwrap();
    assert!(matches!(outcome, WriteOutcome::Sent(_)));

    let created = Harmonic::new(
        1u64,
        "todos",
        DeltaOperation::Create,
        "srv-1",
        Some(&json!({"id": "srv-1", "title": "Milk"})),
    );
    engine.process_harmonics(vec![created], "todos").await.unwrap();

    let records = engine.records("todos").unwrap();
    assert_eq!(records, vec![json!({"id": "srv-1", "title": "Milk"})]);
    assert!(engine.store().shadow("todos").unwrap().get("tmp-1").unwrap().is_none());
}

#[tokio::test]
async fn restart_with_same_versions_keeps_data_and_cursor() {
    let dir = tempfile::tempdir().unwrap();
    let config = EngineConfig::new("u1").with_data_dir(dir.path());
    let transport = Arc::new(MockTransport::new());
    transport.set_schema(schema(3, "2_1"));
    transport.push_harmonics(
        "todos",
        vec![Harmonic::new(
            4u64,
            "todos",
            DeltaOperation::Create,
            "a",
            Some(&json!({"id": "a", "title": "kept"})),
        )],
    );

    let engine = engine_with(transport.clone(), config.clone());
    engine.start().await.unwrap();
    engine
        .store()
        .base("todos")
        .unwrap()
        .put(json!({"id": "seed"}))
        .unwrap();
    engine.sync_collection("todos").await.unwrap();
    assert_eq!(engine.cursor("todos").unwrap(), Some(HarmonicId::from(4u64)));
    drop(engine);

    let restarted = engine_with(transport, config);
    let outcome = restarted.fetch_and_initialize_schema().await.unwrap();
    assert!(!outcome.rebuilt);
    assert_eq!(restarted.cursor("todos").unwrap(), Some(HarmonicId::from(4u64)));
    assert_eq!(
        restarted.overlay().get("todos", "a").unwrap(),
        Some(json!({"id": "a", "title": "kept"}))
    );
}

#[tokio::test]
async fn offline_actions_replay_on_reconnect() {
    let transport = Arc::new(MockTransport::new());
    transport.set_schema(schema(1, "1_1"));
    let engine = engine_with(transport.clone(), EngineConfig::new("u1"));
    engine.start().await.unwrap();

    engine.connectivity().set_online(false);
    let response = engine
        .actions()
        .execute_action(
            "create_todo",
            |a| {
                a.create("todos", json!({"id": "t1", "title": "offline"}));
                Some(json!({"source": "test"}))
            },
            ActionOptions::new(),
        )
        .await
        .unwrap();
    assert!(response.queued);
    assert!(transport.executed().is_empty());
    assert_eq!(engine.records("todos").unwrap().len(), 1);

    engine.connectivity().set_online(true);
    let report = engine.reconnect().await.unwrap();
    assert_eq!(report.actions.synced, 1);

    let executed = transport.executed();
    assert_eq!(executed.len(), 1);
    assert_eq!(executed[0].0, "create_todo");
    assert_eq!(executed[0].1.data, Some(json!({"source": "test"})));
    let deltas = engine.store().delta("todos").unwrap().to_vec().unwrap();
    assert_eq!(deltas[0].sync_status, SyncStatus::Synced);
}
