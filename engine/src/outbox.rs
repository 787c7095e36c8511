//! The outbox: a durable write-ahead queue of unacknowledged local mutations.
//!
//! Ops are kept in capture order. Draining goes through [`Outbox::eligible`]
//! and [`coalesce`], which fold several ops on the same row into the latest
//! state while keeping every involved op id as an idempotency key.

use crate::{
    error::Result, Error, ErrorCode, Hlc, OpId, OpKind, OpStatus, PendingOp, PrimaryKey,
    TableName, Timestamp, Version,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Ordered, id-indexed store of pending ops.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "Vec<PendingOp>", into = "Vec<PendingOp>")]
pub struct Outbox {
    next_seq: u64,
    ops: BTreeMap<u64, PendingOp>,
    index: HashMap<OpId, u64>,
}

impl PartialEq for Outbox {
    fn eq(&self, other: &Self) -> bool {
        self.ops.values().eq(other.ops.values())
    }
}

impl From<Vec<PendingOp>> for Outbox {
    fn from(ops: Vec<PendingOp>) -> Self {
        let mut outbox = Outbox::new();
        for op in ops {
            outbox.enqueue(op);
        }
        outbox
    }
}

impl From<Outbox> for Vec<PendingOp> {
    fn from(outbox: Outbox) -> Self {
        outbox.ops.into_values().collect()
    }
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an op, or overwrite the op with the same id in place.
    ///
    /// Returns `true` when the op was not present before. An overwrite keeps
    /// the original queue position so per-key ordering is preserved.
    pub fn enqueue(&mut self, op: PendingOp) -> bool {
        let id = op.id();
        if let Some(seq) = self.index.get(&id) {
            self.ops.insert(*seq, op);
            return false;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.index.insert(id, seq);
        self.ops.insert(seq, op);
        true
    }

    pub fn get(&self, id: &OpId) -> Option<&PendingOp> {
        self.index.get(id).and_then(|seq| self.ops.get(seq))
    }

    fn get_mut(&mut self, id: &OpId) -> Option<&mut PendingOp> {
        let seq = self.index.get(id)?;
        self.ops.get_mut(seq)
    }

    /// All ops in capture order.
    pub fn iter(&self) -> impl Iterator<Item = &PendingOp> {
        self.ops.values()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Count of ops still in active retry.
    pub fn pending_count(&self) -> usize {
        self.ops.values().filter(|op| !op.is_failed()).count()
    }

    /// Ops in the `failed` state.
    pub fn failed(&self) -> impl Iterator<Item = &PendingOp> {
        self.ops.values().filter(|op| op.is_failed())
    }

    /// Active (non-failed) ops for one row, in capture order.
    pub fn pending_for(&self, table: &str, key: &str) -> Vec<&PendingOp> {
        self.ops
            .values()
            .filter(|op| !op.is_failed() && op.table == table && op.primary_key == key)
            .collect()
    }

    /// Ops that may be sent at `now`, in capture order.
    ///
    /// For each row only the leading run of eligible ops is returned: an op
    /// still waiting for its retry delay (or its debounce window) holds back
    /// every later op on the same row. A failed op holds back the row until
    /// it is requeued or discarded.
    pub fn eligible(&self, now: Timestamp, debounce_ms: u64, force: bool) -> Vec<PendingOp> {
        let mut blocked: HashSet<(&str, &str)> = HashSet::new();
        let mut out = Vec::new();
        for op in self.ops.values() {
            let key = (op.table.as_str(), op.primary_key.as_str());
            if blocked.contains(&key) {
                continue;
            }
            if !op.is_failed() && op.is_eligible(now, debounce_ms, force) {
                out.push(op.clone());
            } else {
                blocked.insert(key);
            }
        }
        out
    }

    /// Active ops not stuck behind a failed op on the same row.
    fn unparked(&self) -> impl Iterator<Item = &PendingOp> {
        let mut parked: HashSet<(&str, &str)> = HashSet::new();
        self.ops.values().filter(move |&op| {
            let key = (op.table.as_str(), op.primary_key.as_str());
            if op.is_failed() {
                parked.insert(key);
                return false;
            }
            !parked.contains(&key)
        })
    }

    /// Earliest time at which some currently ineligible op becomes eligible.
    ///
    /// Ops parked behind a failed op never come due on their own.
    pub fn next_due(&self, debounce_ms: u64) -> Option<Timestamp> {
        self.unparked()
            .map(|op| match op.not_before {
                Some(t) => t,
                None if op.attempts > 0 => 0,
                None => op.created_at.saturating_add(debounce_ms),
            })
            .min()
    }

    /// Remove acknowledged ops, returning them.
    pub fn acknowledge(&mut self, ids: &[OpId]) -> Vec<PendingOp> {
        ids.iter().filter_map(|id| self.remove(id)).collect()
    }

    /// Remove one op regardless of state.
    pub fn remove(&mut self, id: &OpId) -> Option<PendingOp> {
        let seq = self.index.remove(id)?;
        self.ops.remove(&seq)
    }

    /// Remove every active op for one row (used when a remote change wins).
    pub fn discard_for_key(&mut self, table: &str, key: &str) -> Vec<PendingOp> {
        let ids: Vec<OpId> = self
            .pending_for(table, key)
            .into_iter()
            .map(|op| op.id())
            .collect();
        self.acknowledge(&ids)
    }

    /// Record a retriable failure; the ops stay queued until `not_before`.
    pub fn schedule_retry(&mut self, ids: &[OpId], not_before: Timestamp) {
        for id in ids {
            if let Some(op) = self.get_mut(id) {
                op.attempts = op.attempts.saturating_add(1);
                op.not_before = Some(not_before);
            }
        }
    }

    /// Move ops out of active retry into the `failed` state.
    pub fn mark_failed(&mut self, ids: &[OpId], code: ErrorCode, message: &str) {
        for id in ids {
            if let Some(op) = self.get_mut(id) {
                op.status = OpStatus::Failed {
                    code,
                    message: message.to_string(),
                };
                op.not_before = None;
            }
        }
    }

    /// Put a failed op back into active retry with the same op id.
    pub fn requeue(&mut self, id: &OpId) -> Result<()> {
        let op = self.get_mut(id).ok_or(Error::OpNotFound(*id))?;
        if !op.is_failed() {
            return Err(Error::OpNotFailed(*id));
        }
        op.status = OpStatus::Pending;
        op.attempts = 0;
        op.not_before = None;
        Ok(())
    }

    /// Rewrite the patches of a row's pending puts with reconciled values.
    ///
    /// Every field a pending put touches takes its value from `merged`, and
    /// the base version moves to `base_version`. Op ids and order are kept.
    pub fn rebase_key(
        &mut self,
        table: &str,
        key: &str,
        merged: &serde_json::Value,
        base_version: Option<Version>,
    ) {
        let Some(merged) = merged.as_object() else {
            return;
        };
        for op in self.ops.values_mut() {
            if op.is_failed() || op.table != table || op.primary_key != key {
                continue;
            }
            op.base_version = base_version;
            if let Some(serde_json::Value::Object(patch)) = op.patch.as_mut() {
                for (field, value) in patch.iter_mut() {
                    if let Some(v) = merged.get(field) {
                        *value = v.clone();
                    }
                }
            }
        }
    }
}

/// One row's coalesced state inside a push batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchOp {
    /// Every op folded into this entry (idempotency keys for the backend)
    pub op_ids: Vec<OpId>,
    pub table: TableName,
    pub primary_key: PrimaryKey,
    pub kind: OpKind,
    /// Merged fields of the puts after the last delete
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch: Option<serde_json::Value>,
    /// True when a delete preceded the final put, so the row is recreated
    #[serde(default)]
    pub replace: bool,
    /// Base version of the first folded op
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_version: Option<Version>,
    /// Earliest capture time of the folded ops
    pub created_at: Timestamp,
    /// HLC of the latest folded op
    pub hlc: Hlc,
}

impl BatchOp {
    /// Fold ops for one row (already in capture order) into a single entry.
    fn fold(ops: &[&PendingOp]) -> Result<Self> {
        let first = ops
            .first()
            .ok_or_else(|| Error::CorruptRecord("empty coalescing group".into()))?;
        let mut out = BatchOp {
            op_ids: Vec::with_capacity(ops.len()),
            table: first.table.clone(),
            primary_key: first.primary_key.clone(),
            kind: first.kind,
            patch: None,
            replace: false,
            base_version: first.base_version,
            created_at: first.created_at,
            hlc: first.stamp.hlc.clone(),
        };
        let mut fields = serde_json::Map::new();
        let mut saw_delete = false;

        for op in ops {
            out.op_ids.push(op.id());
            out.created_at = out.created_at.min(op.created_at);
            if op.stamp.hlc > out.hlc {
                out.hlc = op.stamp.hlc.clone();
            }
            match op.kind {
                OpKind::Put => {
                    let Some(serde_json::Value::Object(patch)) = &op.patch else {
                        return Err(Error::CorruptRecord(format!(
                            "put {} has no object patch",
                            op.id()
                        )));
                    };
                    if out.kind == OpKind::Delete {
                        fields.clear();
                    }
                    for (k, v) in patch {
                        fields.insert(k.clone(), v.clone());
                    }
                    out.kind = OpKind::Put;
                }
                OpKind::Delete => {
                    fields.clear();
                    saw_delete = true;
                    out.kind = OpKind::Delete;
                }
            }
        }

        if out.kind == OpKind::Put {
            out.patch = Some(serde_json::Value::Object(fields));
            out.replace = saw_delete;
        }
        Ok(out)
    }
}

/// A group of coalesced ops for one table, sent in one provider call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushBatch {
    pub table: TableName,
    pub ops: Vec<BatchOp>,
}

impl PushBatch {
    /// All op ids carried by the batch.
    pub fn op_ids(&self) -> Vec<OpId> {
        self.ops
            .iter()
            .flat_map(|op| op.op_ids.iter().copied())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Coalesce ops (in capture order) into per-table batches of at most
/// `max_batch` rows.
///
/// Tables are emitted in name order. Within a table, rows keep the order of
/// their earliest op, so creates still precede later updates and deletes.
pub fn coalesce(ops: &[PendingOp], max_batch: usize) -> Result<Vec<PushBatch>> {
    let max_batch = max_batch.max(1);
    type Rows<'a> = (HashMap<&'a str, usize>, Vec<Vec<&'a PendingOp>>);
    let mut by_table: BTreeMap<&str, Rows<'_>> = BTreeMap::new();

    for op in ops {
        let (index, rows) = by_table.entry(op.table.as_str()).or_default();
        match index.get(op.primary_key.as_str()) {
            Some(&i) => rows[i].push(op),
            None => {
                index.insert(op.primary_key.as_str(), rows.len());
                rows.push(vec![op]);
            }
        }
    }

    let mut batches = Vec::new();
    for (table, (_, rows)) in by_table {
        let mut folded = rows
            .iter()
            .map(|group| BatchOp::fold(group))
            .collect::<Result<Vec<_>>>()?;
        folded.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        for chunk in folded.chunks(max_batch) {
            batches.push(PushBatch {
                table: table.to_string(),
                ops: chunk.to_vec(),
            });
        }
    }
    Ok(batches)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ChangeStamp;
    use serde_json::json;

    fn put(key: &str, patch: serde_json::Value, at: u64) -> PendingOp {
        let stamp = ChangeStamp::new("d", OpId::new(), Hlc::new(at, 0, "d"));
        PendingOp::put(stamp, "threads", key, patch, None, at)
    }

    fn delete(key: &str, at: u64) -> PendingOp {
        let stamp = ChangeStamp::new("d", OpId::new(), Hlc::new(at, 0, "d"));
        PendingOp::delete(stamp, "threads", key, None, at)
    }

    #[test]
    fn enqueue_is_idempotent_per_op_id() {
        let mut outbox = Outbox::new();
        let op = put("a", json!({"v": 1}), 10);
        assert!(outbox.enqueue(op.clone()));

        let mut again = op.clone();
        again.patch = Some(json!({"v": 2}));
        assert!(!outbox.enqueue(again));

        assert_eq!(outbox.len(), 1);
        assert_eq!(outbox.get(&op.id()).unwrap().patch, Some(json!({"v": 2})));
    }

    #[test]
    fn overwrite_keeps_queue_position() {
        let mut outbox = Outbox::new();
        let first = put("a", json!({}), 10);
        let second = put("b", json!({}), 20);
        outbox.enqueue(first.clone());
        outbox.enqueue(second.clone());
        outbox.enqueue(first.clone());

        let order: Vec<_> = outbox.iter().map(|op| op.id()).collect();
        assert_eq!(order, vec![first.id(), second.id()]);
    }

    #[test]
    fn eligible_honours_debounce() {
        let mut outbox = Outbox::new();
        outbox.enqueue(put("a", json!({}), 1000));
        outbox.enqueue(put("b", json!({}), 1200));

        assert_eq!(outbox.eligible(1250, 250, false).len(), 1);
        assert_eq!(outbox.eligible(1250, 250, true).len(), 2);
    }

    #[test]
    fn op_waiting_for_retry_blocks_later_ops_on_same_row() {
        let mut outbox = Outbox::new();
        let first = put("a", json!({"v": 1}), 0);
        let second = put("a", json!({"v": 2}), 10);
        let other = put("b", json!({"v": 1}), 10);
        outbox.enqueue(first.clone());
        outbox.enqueue(second);
        outbox.enqueue(other.clone());
        outbox.schedule_retry(&[first.id()], 5000);

        let eligible = outbox.eligible(1000, 0, true);
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].id(), other.id());
    }

    #[test]
    fn next_due_reports_earliest_wakeup() {
        let mut outbox = Outbox::new();
        let a = put("a", json!({}), 1000);
        outbox.enqueue(a.clone());
        outbox.enqueue(put("b", json!({}), 2000));
        assert_eq!(outbox.next_due(250), Some(1250));

        outbox.schedule_retry(&[a.id()], 900);
        assert_eq!(outbox.next_due(250), Some(900));
    }

    #[test]
    fn mark_failed_and_requeue() {
        let mut outbox = Outbox::new();
        let op = put("a", json!({}), 0);
        outbox.enqueue(op.clone());
        outbox.mark_failed(&[op.id()], ErrorCode::Validation, "title required");

        assert_eq!(outbox.failed().count(), 1);
        assert_eq!(outbox.pending_count(), 0);
        assert!(outbox.eligible(10_000, 0, true).is_empty());

        outbox.requeue(&op.id()).unwrap();
        assert_eq!(outbox.failed().count(), 0);
        assert_eq!(outbox.get(&op.id()).unwrap().id(), op.id());
        assert!(matches!(
            outbox.requeue(&op.id()),
            Err(Error::OpNotFailed(_))
        ));
    }

    #[test]
    fn failed_op_parks_later_ops_on_same_row() {
        let mut outbox = Outbox::new();
        let older = put("a", json!({"title": "older"}), 0);
        let newer = put("a", json!({"title": "newer"}), 10);
        let other = put("b", json!({"title": "other"}), 10);
        outbox.enqueue(older.clone());
        outbox.mark_failed(&[older.id()], ErrorCode::Validation, "title required");
        outbox.enqueue(newer.clone());
        outbox.enqueue(other.clone());

        let eligible = outbox.eligible(10_000, 0, true);
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].id(), other.id());
        outbox.acknowledge(&[other.id()]);
        assert_eq!(outbox.next_due(0), None);

        outbox.requeue(&older.id()).unwrap();
        let ids: Vec<_> = outbox.eligible(10_000, 0, true).iter().map(|op| op.id()).collect();
        assert_eq!(ids, vec![older.id(), newer.id()]);
        let batches = coalesce(&outbox.eligible(10_000, 0, true), 50).unwrap();
        assert_eq!(batches[0].ops[0].patch, Some(json!({"title": "newer"})));
    }

    #[test]
    fn coalesce_merges_puts_and_keeps_all_ids() {
        let a1 = put("a", json!({"title": "x", "n": 1}), 100);
        let a2 = put("a", json!({"n": 2}), 200);
        let batches = coalesce(&[a1.clone(), a2.clone()], 50).unwrap();

        assert_eq!(batches.len(), 1);
        let op = &batches[0].ops[0];
        assert_eq!(op.kind, OpKind::Put);
        assert_eq!(op.patch, Some(json!({"title": "x", "n": 2})));
        assert_eq!(op.op_ids, vec![a1.id(), a2.id()]);
        assert_eq!(op.created_at, 100);
        assert_eq!(op.hlc, a2.stamp.hlc);
    }

    #[test]
    fn delete_after_put_collapses_the_put() {
        let a1 = put("a", json!({"title": "x"}), 100);
        let a2 = delete("a", 200);
        let batches = coalesce(&[a1, a2], 50).unwrap();
        let op = &batches[0].ops[0];
        assert_eq!(op.kind, OpKind::Delete);
        assert!(op.patch.is_none());
        assert_eq!(op.op_ids.len(), 2);
    }

    #[test]
    fn put_after_delete_recreates_the_row() {
        let ops = [
            put("a", json!({"title": "old", "n": 1}), 100),
            delete("a", 200),
            put("a", json!({"title": "new"}), 300),
        ];
        let batches = coalesce(&ops, 50).unwrap();
        let op = &batches[0].ops[0];
        assert_eq!(op.kind, OpKind::Put);
        assert!(op.replace);
        assert_eq!(op.patch, Some(json!({"title": "new"})));
    }

    #[test]
    fn coalesce_respects_max_batch_and_row_order() {
        let ops: Vec<_> = (0..120)
            .map(|i| put(&format!("k{i}"), json!({"i": i}), i as u64))
            .collect();
        let batches = coalesce(&ops, 50).unwrap();
        assert_eq!(
            batches.iter().map(PushBatch::len).collect::<Vec<_>>(),
            vec![50, 50, 20]
        );
        assert_eq!(batches[0].ops[0].primary_key, "k0");
        assert_eq!(batches[2].ops[19].primary_key, "k119");
    }

    #[test]
    fn coalesce_rejects_put_without_patch() {
        let mut broken = put("a", json!({}), 0);
        broken.patch = None;
        assert!(matches!(
            coalesce(&[broken], 50),
            Err(Error::CorruptRecord(_))
        ));
    }

    #[test]
    fn rebase_key_rewrites_touched_fields_only() {
        let mut outbox = Outbox::new();
        let op = put("a", json!({"tags": ["x"]}), 0);
        outbox.enqueue(op.clone());
        outbox.rebase_key("threads", "a", &json!({"tags": ["x", "y"], "title": "t"}), Some(7));

        let rebased = outbox.get(&op.id()).unwrap();
        assert_eq!(rebased.patch, Some(json!({"tags": ["x", "y"]})));
        assert_eq!(rebased.base_version, Some(7));
    }

    #[test]
    fn serde_roundtrip_rebuilds_index() {
        let mut outbox = Outbox::new();
        let op = put("a", json!({}), 0);
        outbox.enqueue(op.clone());
        let json = serde_json::to_string(&outbox).unwrap();
        let back: Outbox = serde_json::from_str(&json).unwrap();
        assert!(back.get(&op.id()).is_some());
        assert_eq!(back.len(), 1);
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn coalesce_keeps_every_op_in_capture_order(
                steps in prop::collection::vec((0u8..5, any::<bool>()), 1..40),
                max_batch in 1usize..8,
            ) {
                let ops: Vec<PendingOp> = steps
                    .iter()
                    .enumerate()
                    .map(|(i, (key, is_delete))| {
                        let key = format!("k{key}");
                        let at = 1_000 + i as u64;
                        if *is_delete {
                            delete(&key, at)
                        } else {
                            put(&key, json!({"n": i}), at)
                        }
                    })
                    .collect();

                let batches = coalesce(&ops, max_batch).unwrap();
                let folded: Vec<&BatchOp> = batches.iter().flat_map(|b| b.ops.iter()).collect();
                prop_assert!(batches.iter().all(|b| b.len() <= max_batch));

                let mut seen: Vec<OpId> = folded.iter().flat_map(|op| op.op_ids.clone()).collect();
                prop_assert_eq!(seen.len(), ops.len());
                seen.sort();
                seen.dedup();
                prop_assert_eq!(seen.len(), ops.len());

                for row in &folded {
                    let captured: Vec<&PendingOp> =
                        ops.iter().filter(|op| op.primary_key == row.primary_key).collect();
                    let order: Vec<OpId> = captured.iter().map(|op| op.id()).collect();
                    prop_assert_eq!(&row.op_ids, &order);
                    prop_assert_eq!(row.kind, captured[captured.len() - 1].kind);
                    prop_assert_eq!(row.created_at, captured[0].created_at);
                }

                let starts: Vec<u64> = folded.iter().map(|op| op.created_at).collect();
                prop_assert!(starts.windows(2).all(|w| w[0] <= w[1]));
            }
        }
    }
}
