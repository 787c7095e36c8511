//! Edge case tests for driftsync-engine
//!
//! These tests cover boundary conditions and unusual inputs.

use driftsync_engine::{
    coalesce, Cursor, Decision, Error, FieldDef, FieldType, Hlc, LocalStore, OpKind, Origin,
    RemoteChange, Resolver, Schema, StoreSnapshot, TableSchema,
};
use serde_json::json;

fn create_test_schema() -> Schema {
    Schema::new(1).with_table(TableSchema::new(
        "items",
        vec![
            FieldDef::required("name", FieldType::String),
            FieldDef::optional("count", FieldType::Int),
            FieldDef::optional("data", FieldType::Json),
        ],
    ))
}

fn store() -> LocalStore {
    LocalStore::with_capture(create_test_schema(), "node1")
}

fn remote_put(key: &str, data: serde_json::Value, version: u64, ts: u64) -> RemoteChange {
    RemoteChange {
        table: "items".into(),
        key: key.into(),
        kind: OpKind::Put,
        data: Some(data),
        version,
        hlc: Hlc::new(ts, 0, "node2"),
        device_id: "node2".into(),
        op_ids: Vec::new(),
        changed_at: ts,
    }
}

// ============================================================================
// String Edge Cases
// ============================================================================

#[test]
fn empty_string_fields() {
    let mut store = store();
    store
        .transaction(Origin::Local, 1000, |tx| {
            tx.put("items", "item1", json!({"name": ""}))
        })
        .unwrap();
    assert_eq!(store.get("items", "item1").unwrap().data["name"], "");
}

#[test]
fn unicode_keys_and_values() {
    let mut store = store();
    let names = ["日本語テスト", "Привет мир", "🎉🚀💯", "Hello\nWorld\tTab", "Null\0Test"];

    for (i, name) in names.iter().enumerate() {
        let key = format!("item-{name}-{i}");
        store
            .transaction(Origin::Local, 1000 + i as u64, |tx| {
                tx.put("items", &key, json!({"name": name}))
            })
            .unwrap();
        assert_eq!(store.get("items", &key).unwrap().data["name"], *name);
    }

    let pending: Vec<_> = store.state().outbox.iter().cloned().collect();
    let batches = coalesce(&pending, 50).unwrap();
    assert_eq!(batches[0].len(), names.len());
}

#[test]
fn very_long_strings() {
    let mut store = store();
    let long = "x".repeat(1_000_000);
    store
        .transaction(Origin::Local, 1, |tx| {
            tx.put("items", "big", json!({"name": long}))
        })
        .unwrap();
    let snapshot = store.export_snapshot();
    let restored = StoreSnapshot::from_json(&snapshot.to_json().unwrap()).unwrap();
    assert_eq!(
        restored.get_record("items", "big").unwrap().data["name"]
            .as_str()
            .unwrap()
            .len(),
        1_000_000
    );
}

// ============================================================================
// Numeric / Clock Edge Cases
// ============================================================================

#[test]
fn integer_boundaries() {
    let mut store = store();
    for (i, n) in [i64::MIN, -1, 0, i64::MAX].into_iter().enumerate() {
        store
            .transaction(Origin::Local, 1, |tx| {
                tx.put("items", &format!("n{i}"), json!({"name": "n", "count": n}))
            })
            .unwrap();
    }
    assert_eq!(store.get("items", "n3").unwrap().data["count"], i64::MAX);
}

#[test]
fn float_rejected_for_int_field() {
    let mut store = store();
    let result = store.transaction(Origin::Local, 1, |tx| {
        tx.put("items", "f", json!({"name": "n", "count": 1.5}))
    });
    assert!(matches!(result, Err(Error::TypeMismatch { .. })));
}

#[test]
fn clock_survives_wall_clock_regression() {
    let mut store = store();
    let mut stamps = Vec::new();
    for now in [5_000u64, 4_000, 4_000, 3_000] {
        let op_id = store
            .transaction(Origin::Local, now, |tx| {
                tx.put("items", "same", json!({"name": "x"}))
            })
            .unwrap();
        stamps.push(store.state().outbox.get(&op_id).unwrap().stamp.hlc.clone());
    }
    assert!(stamps.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn same_hlc_time_breaks_tie_by_node() {
    let a = Hlc::new(1000, 0, "node-a");
    let b = Hlc::new(1000, 0, "node-b");
    assert!(a < b);
    assert_eq!(a.to_string() < b.to_string(), a < b);
}

// ============================================================================
// Nested JSON
// ============================================================================

#[test]
fn deeply_nested_json() {
    let mut nested = json!({"leaf": true});
    for _ in 0..64 {
        nested = json!({ "inner": nested });
    }
    let mut store = store();
    store
        .transaction(Origin::Local, 1, |tx| {
            tx.put("items", "deep", json!({"name": "d", "data": nested}))
        })
        .unwrap();
    assert!(store.get("items", "deep").is_some());
}

// ============================================================================
// Outbox Edge Cases
// ============================================================================

#[test]
fn rapid_updates_same_record_coalesce_to_one_entry() {
    let mut store = store();
    for i in 0..100u64 {
        store
            .transaction(Origin::Local, i, |tx| {
                tx.put("items", "hot", json!({"name": "n", "count": i}))
            })
            .unwrap();
    }
    let pending: Vec<_> = store.state().outbox.iter().cloned().collect();
    let batches = coalesce(&pending, 50).unwrap();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].ops[0].op_ids.len(), 100);
    assert_eq!(batches[0].ops[0].patch.as_ref().unwrap()["count"], 99);
}

#[test]
fn delete_of_unknown_row_is_still_recorded() {
    let mut store = store();
    store
        .transaction(Origin::Local, 1, |tx| tx.delete("items", "ghost"))
        .unwrap();
    assert_eq!(store.state().outbox.len(), 1);
    assert!(store.state().tombstones.get("items", "ghost").is_some());
}

#[test]
fn writes_to_unknown_table_fail() {
    let mut store = store();
    let result = store.transaction(Origin::Local, 1, |tx| {
        tx.put("posts", "p", json!({"name": "n"}))
    });
    assert!(matches!(result, Err(Error::TableNotFound(_))));
    assert!(store.state().outbox.is_empty());
}

#[test]
fn coalesce_with_zero_max_batch_uses_one() {
    let mut store = store();
    store
        .transaction(Origin::Local, 1, |tx| {
            tx.put("items", "a", json!({"name": "a"}))?;
            tx.put("items", "b", json!({"name": "b"}))
        })
        .unwrap();
    let pending: Vec<_> = store.state().outbox.iter().cloned().collect();
    assert_eq!(coalesce(&pending, 0).unwrap().len(), 2);
}

// ============================================================================
// Resolver / Cursor Edge Cases
// ============================================================================

#[test]
fn replaying_a_pull_batch_is_idempotent() {
    let mut store = store();
    let resolver = Resolver::default();
    let batch = vec![
        remote_put("a", json!({"name": "a"}), 1, 10),
        remote_put("b", json!({"name": "b"}), 2, 20),
    ];

    for _ in 0..2 {
        store
            .transaction(Origin::Remote, 100, |tx| {
                for change in &batch {
                    resolver.apply(tx, change)?;
                }
                Ok(())
            })
            .unwrap();
    }
    assert_eq!(store.records("items").len(), 2);

    let res = store
        .transaction(Origin::Remote, 100, |tx| resolver.apply(tx, &batch[0]))
        .unwrap();
    assert_eq!(res.decision, Decision::Stale);
}

#[test]
fn cursor_and_rows_roll_back_together() {
    let mut store = store();
    let resolver = Resolver::default();
    let mut bad = remote_put("b", json!({}), 2, 20);
    bad.data = None;

    let result = store.transaction(Origin::Remote, 100, |tx| {
        resolver.apply(tx, &remote_put("a", json!({"name": "a"}), 1, 10))?;
        resolver.apply(tx, &bad)?;
        tx.state_mut()
            .cursors
            .advance("items", Cursor::new("v2", 2), 100);
        Ok(())
    });

    assert!(result.is_err());
    assert!(store.get("items", "a").is_none());
    assert!(store.state().cursors.cursor("items").is_none());
}

// ============================================================================
// Snapshot Edge Cases
// ============================================================================

#[test]
fn snapshot_empty_store() {
    let store = store();
    let snapshot = store.export_snapshot();
    assert_eq!(snapshot.record_count(), 0);
    assert!(snapshot.outbox.is_empty());

    let mut other = LocalStore::with_capture(create_test_schema(), "node1");
    other.import_snapshot(snapshot).unwrap();
    assert!(other.records("items").is_empty());
}

#[test]
fn snapshot_keeps_tombstones_and_failed_ops() {
    let mut store = store();
    let op_id = store
        .transaction(Origin::Local, 1, |tx| tx.delete("items", "gone"))
        .unwrap();
    store
        .transaction(Origin::Remote, 2, |tx| {
            tx.state_mut().outbox.mark_failed(
                &[op_id],
                driftsync_engine::ErrorCode::Validation,
                "rejected",
            );
            Ok(())
        })
        .unwrap();

    let restored =
        StoreSnapshot::from_json(&store.export_snapshot().to_json().unwrap()).unwrap();
    let mut other = LocalStore::with_capture(create_test_schema(), "node1");
    other.import_snapshot(restored).unwrap();
    assert_eq!(other.state().outbox.failed().count(), 1);
    assert!(other.state().tombstones.get("items", "gone").is_some());
}
