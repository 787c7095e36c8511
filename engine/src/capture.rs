//! Change Capture: turns local row writes into durable sync state.
//!
//! Registered as a [`MutationHook`], so the pending op (and the tombstone,
//! for deletes) is written in the same transaction as the row. Remote-origin
//! writes are ignored, which keeps pulled changes from echoing back out.

use crate::{
    error::Result, ChangeStamp, Error, MutationHook, MutationKind, Origin, PendingOp, StoreState,
    Tombstone,
};
use crate::store::Mutation;

/// The capture hook.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChangeCapture;

impl MutationHook for ChangeCapture {
    fn on_mutation(&self, state: &mut StoreState, mutation: &Mutation) -> Result<()> {
        if mutation.origin != Origin::Local {
            return Ok(());
        }

        let stamp = ChangeStamp::new(state.node_id.clone(), mutation.op_id, mutation.hlc.clone());
        let base_version = mutation.previous.as_ref().and_then(|r| r.version);

        let op = match mutation.kind {
            MutationKind::Put => {
                let patch = mutation
                    .patch
                    .clone()
                    .ok_or_else(|| Error::CaptureFailed("put without patch".into()))?;
                state.schema.validate_patch(
                    &mutation.table,
                    &patch,
                    mutation.previous.as_ref().map(|r| &r.data),
                )?;
                state.tombstones.remove(&mutation.table, &mutation.key);
                PendingOp::put(
                    stamp,
                    mutation.table.clone(),
                    mutation.key.clone(),
                    patch,
                    base_version,
                    mutation.now,
                )
            }
            MutationKind::Delete => {
                state.schema.validate_delete(&mutation.table)?;
                state.tombstones.upsert(Tombstone::new(
                    mutation.table.clone(),
                    mutation.key.clone(),
                    mutation.now,
                    state.node_id.clone(),
                    mutation.hlc.clone(),
                    None,
                ));
                PendingOp::delete(
                    stamp,
                    mutation.table.clone(),
                    mutation.key.clone(),
                    base_version,
                    mutation.now,
                )
            }
        };

        state.outbox.enqueue(op);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FieldDef, FieldType, TableSchema};
    use crate::{Hlc, LocalStore, OpKind, Record, Schema};
    use serde_json::json;

    fn store() -> LocalStore {
        let schema = Schema::new(1).with_table(TableSchema::new(
            "threads",
            vec![FieldDef::required("title", FieldType::String)],
        ));
        LocalStore::with_capture(schema, "device-1")
    }

    #[test]
    fn local_put_enqueues_pending_op() {
        let mut store = store();
        let op_id = store
            .transaction(Origin::Local, 1000, |tx| {
                tx.put("threads", "t-1", json!({"title": "a"}))
            })
            .unwrap();

        let op = store.state().outbox.get(&op_id).unwrap();
        assert_eq!(op.kind, OpKind::Put);
        assert_eq!(op.stamp.device_id, "device-1");
        assert_eq!(op.stamp.hlc.timestamp, 1000);
        assert_eq!(op.created_at, 1000);
        assert_eq!(op.base_version, None);
    }

    #[test]
    fn base_version_comes_from_the_row() {
        let mut store = store();
        let remote =
            Record::new_remote("threads", "t-1", json!({"title": "a"}), 7, 0, Hlc::new(0, 0, "s"));
        store
            .transaction(Origin::Remote, 0, |tx| tx.write_record(remote))
            .unwrap();
        assert!(store.state().outbox.is_empty());

        let op_id = store
            .transaction(Origin::Local, 10, |tx| {
                tx.put("threads", "t-1", json!({"title": "b"}))
            })
            .unwrap();
        assert_eq!(store.state().outbox.get(&op_id).unwrap().base_version, Some(7));
    }

    #[test]
    fn local_delete_creates_tombstone_and_op() {
        let mut store = store();
        store
            .transaction(Origin::Local, 1000, |tx| {
                tx.put("threads", "t-2", json!({"title": "a"}))?;
                tx.delete("threads", "t-2")
            })
            .unwrap();

        let tomb = store.state().tombstones.get("threads", "t-2").unwrap();
        assert_eq!(tomb.last_writer, "device-1");
        assert_eq!(tomb.version, None);
        assert_eq!(store.state().outbox.len(), 2);
        assert!(store.get("threads", "t-2").is_none());
    }

    #[test]
    fn local_put_clears_tombstone() {
        let mut store = store();
        store
            .transaction(Origin::Local, 1, |tx| tx.delete("threads", "t-3"))
            .unwrap();
        store
            .transaction(Origin::Local, 2, |tx| {
                tx.put("threads", "t-3", json!({"title": "back"}))
            })
            .unwrap();
        assert!(store.state().tombstones.get("threads", "t-3").is_none());
    }

    #[test]
    fn remote_writes_are_not_captured() {
        let mut store = store();
        store
            .transaction(Origin::Remote, 5, |tx| {
                tx.put("threads", "r", json!({"title": "x"}))?;
                tx.remove_record("threads", "r", &Hlc::new(5, 1, "s"))
            })
            .unwrap();
        assert!(store.state().outbox.is_empty());
        assert!(store.state().tombstones.is_empty());
    }

    #[test]
    fn validation_failure_aborts_the_write() {
        let mut store = store();
        let result = store.transaction(Origin::Local, 1, |tx| {
            tx.put("threads", "t-1", json!({"title": 42}))
        });
        assert!(matches!(result, Err(Error::TypeMismatch { .. })));
        assert!(store.get("threads", "t-1").is_none());
        assert!(store.state().outbox.is_empty());
    }
}
