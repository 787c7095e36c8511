//! Conflict resolution for inbound remote changes.
//!
//! The resolver decides what a pulled change does to the local row, given
//! the row, its tombstone, and any still-pending local ops on the same key.
//! Decisions are pure functions of those inputs and the table's policy:
//! the same two versions under the same policy always resolve identically.
//!
//! # Order of checks
//!
//! 1. Pending ops whose id the change carries are acknowledged (echo)
//! 2. A change at or below the row's applied version is a stale replay
//! 3. A put older than the row's tombstone is dropped
//! 4. Without pending ops the change applies as-is
//! 5. Otherwise the table policy (`lww`, `merge`, `crdt`) decides

use crate::{
    error::Result, DeviceId, Error, Hlc, OpId, OpKind, PendingOp, PrimaryKey, Record, StoreState,
    TableName, Timestamp, Tombstone, Transaction, Version,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// A change as delivered by the provider's pull.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteChange {
    pub table: TableName,
    pub key: PrimaryKey,
    pub kind: OpKind,
    /// Full row contents for a put
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Server version assigned to the change
    pub version: Version,
    /// HLC of the writing device
    pub hlc: Hlc,
    pub device_id: DeviceId,
    /// Op ids folded into the change on the writing device
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub op_ids: Vec<OpId>,
    /// Server time of the change
    pub changed_at: Timestamp,
}

/// Per-field strategy of the `merge` policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldStrategy {
    /// Later writer wins (resolved, not reported)
    Lww,
    /// Array union
    Union,
    /// Larger number wins
    Max,
    /// Smaller number wins
    Min,
}

/// CRDT type of a field under the `crdt` policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CrdtType {
    /// Grow-only counter: `{ nodeId: count }`
    GCounter,
    /// Increment/decrement counter: `{ "p": {..}, "n": {..} }`
    PnCounter,
    /// Grow-only set (array)
    GSet,
    /// Max register
    Max,
    /// A merge registered under this name in the [`PolicySet`]
    Custom(String),
}

/// A caller-registered CRDT merge.
///
/// Returns `None` when the two values cannot be merged.
pub trait CrdtMerge: Send + Sync {
    fn merge(&self, local: &Value, remote: &Value) -> Option<Value>;
}

impl<F> CrdtMerge for F
where
    F: Fn(&Value, &Value) -> Option<Value> + Send + Sync,
{
    fn merge(&self, local: &Value, remote: &Value) -> Option<Value> {
        self(local, remote)
    }
}

/// Table-level conflict policy.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "policy", content = "fields", rename_all = "lowercase")]
pub enum TablePolicy {
    #[default]
    Lww,
    Merge(BTreeMap<String, FieldStrategy>),
    Crdt(BTreeMap<String, CrdtType>),
}

impl TablePolicy {
    pub fn kind(&self) -> PolicyKind {
        match self {
            TablePolicy::Lww => PolicyKind::Lww,
            TablePolicy::Merge(_) => PolicyKind::Merge,
            TablePolicy::Crdt(_) => PolicyKind::Crdt,
        }
    }
}

/// Policy name, as reported on conflicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyKind {
    Lww,
    Merge,
    Crdt,
}

/// Conflict policies for every table, plus the custom CRDT registry.
///
/// Supplied by the host as configuration.
#[derive(Clone, Default)]
pub struct PolicySet {
    default: TablePolicy,
    tables: BTreeMap<TableName, TablePolicy>,
    crdts: BTreeMap<String, Arc<dyn CrdtMerge>>,
}

impl std::fmt::Debug for PolicySet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicySet")
            .field("default", &self.default)
            .field("tables", &self.tables)
            .field("crdts", &self.crdts.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl PolicySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Policy for tables without an explicit entry.
    pub fn with_default(mut self, policy: TablePolicy) -> Self {
        self.default = policy;
        self
    }

    pub fn with_table(mut self, table: impl Into<TableName>, policy: TablePolicy) -> Self {
        self.tables.insert(table.into(), policy);
        self
    }

    /// Register a custom CRDT merge for [`CrdtType::Custom`] fields.
    pub fn register_crdt(
        mut self,
        name: impl Into<String>,
        merge: impl CrdtMerge + 'static,
    ) -> Self {
        self.crdts.insert(name.into(), Arc::new(merge));
        self
    }

    pub fn policy_for(&self, table: &str) -> &TablePolicy {
        self.tables.get(table).unwrap_or(&self.default)
    }

    fn crdt(&self, name: &str) -> Option<&Arc<dyn CrdtMerge>> {
        self.crdts.get(name)
    }
}

/// Built-in CRDT merges.
pub mod crdt {
    use serde_json::{Map, Value};

    fn merge_counts(local: &Map<String, Value>, remote: &Map<String, Value>) -> Option<Value> {
        let mut out = local.clone();
        for (node, count) in remote {
            let count = count.as_u64()?;
            let current = match out.get(node) {
                Some(v) => v.as_u64()?,
                None => 0,
            };
            out.insert(node.clone(), Value::from(current.max(count)));
        }
        for v in out.values() {
            v.as_u64()?;
        }
        Some(Value::Object(out))
    }

    /// Per-node maximum of two grow-only counters.
    pub fn g_counter(local: &Value, remote: &Value) -> Option<Value> {
        merge_counts(local.as_object()?, remote.as_object()?)
    }

    /// Merge the `p` and `n` halves of two PN-counters.
    pub fn pn_counter(local: &Value, remote: &Value) -> Option<Value> {
        let (local, remote) = (local.as_object()?, remote.as_object()?);
        let empty = Value::Object(Map::new());
        let mut out = Map::new();
        for half in ["p", "n"] {
            let l = local.get(half).unwrap_or(&empty);
            let r = remote.get(half).unwrap_or(&empty);
            out.insert(half.to_string(), g_counter(l, r)?);
        }
        Some(Value::Object(out))
    }

    /// Union of two arrays: local elements first, then new remote ones.
    pub fn g_set(local: &Value, remote: &Value) -> Option<Value> {
        let mut out = local.as_array()?.clone();
        for item in remote.as_array()? {
            if !out.contains(item) {
                out.push(item.clone());
            }
        }
        Some(Value::Array(out))
    }

    /// The larger of two numbers.
    pub fn max(local: &Value, remote: &Value) -> Option<Value> {
        let (l, r) = (local.as_f64()?, remote.as_f64()?);
        Some(if r > l { remote.clone() } else { local.clone() })
    }

    /// The smaller of two numbers.
    pub fn min(local: &Value, remote: &Value) -> Option<Value> {
        let (l, r) = (local.as_f64()?, remote.as_f64()?);
        Some(if r < l { remote.clone() } else { local.clone() })
    }

    /// Current value of a G-counter or PN-counter.
    pub fn counter_value(counter: &Value) -> Option<i64> {
        let obj = counter.as_object()?;
        let sum = |v: &Value| -> Option<i64> {
            v.as_object()?
                .values()
                .try_fold(0i64, |acc, c| Some(acc + i64::try_from(c.as_u64()?).ok()?))
        };
        if obj.contains_key("p") || obj.contains_key("n") {
            let empty = Value::Object(Map::new());
            Some(sum(obj.get("p").unwrap_or(&empty))? - sum(obj.get("n").unwrap_or(&empty))?)
        } else {
            sum(counter)
        }
    }
}

/// Which side a conflict resolved to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Winner {
    Local,
    Remote,
    Merged,
}

/// A collision between pending local ops and a remote change.
///
/// Carries both full versions so a caller-supplied chooser can override the
/// outcome later; the engine never waits for one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conflict {
    pub table: TableName,
    pub key: PrimaryKey,
    pub policy: PolicyKind,
    pub winner: Winner,
    /// Local row before resolution (`None` if deleted locally)
    pub local: Option<Value>,
    /// Remote row (`None` for a remote delete)
    pub remote: Option<Value>,
    /// Row after resolution
    pub resolved: Option<Value>,
    /// Fields that diverged on both sides and fell back to last-writer-wins
    pub unresolved_fields: Vec<String>,
    pub local_op_ids: Vec<OpId>,
    pub remote_version: Version,
}

/// What the resolver decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Decision {
    /// Already applied; idempotent no-op
    Stale,
    /// Older than the row's tombstone; dropped
    Tombstoned,
    /// Remote state applied to the row
    Applied,
    /// Local pending state won; remote payload dropped
    KeptLocal,
    /// Fields reconciled from both sides
    Merged,
}

/// Row-level effect of a resolution.
#[derive(Debug, Clone, PartialEq)]
pub enum RowWrite {
    None,
    Put(Record),
    Delete(Tombstone),
    /// Keep local contents, record the remote version as the new base
    Confirm(Version),
}

/// Rewrite of a key's pending ops after resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct Rebase {
    pub data: Value,
    pub base_version: Version,
}

/// Full outcome for one remote change.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub decision: Decision,
    pub write: RowWrite,
    /// Pending ops acknowledged by an echo of themselves
    pub acknowledged: Vec<OpId>,
    /// Pending ops that lost and are dropped without being sent
    pub discarded: Vec<OpId>,
    pub rebase: Option<Rebase>,
    pub conflict: Option<Conflict>,
}

impl Resolution {
    fn new(decision: Decision) -> Self {
        Self {
            decision,
            write: RowWrite::None,
            acknowledged: Vec::new(),
            discarded: Vec::new(),
            rebase: None,
            conflict: None,
        }
    }

    /// Whether the change touched local state at all.
    pub fn is_noop(&self) -> bool {
        matches!(self.decision, Decision::Stale | Decision::Tombstoned)
            && self.acknowledged.is_empty()
    }
}

/// The conflict resolver.
#[derive(Debug, Clone, Default)]
pub struct Resolver {
    policies: PolicySet,
}

impl Resolver {
    pub fn new(policies: PolicySet) -> Self {
        Self { policies }
    }

    pub fn policies(&self) -> &PolicySet {
        &self.policies
    }

    /// Decide the outcome of `change` against `state` without mutating it.
    pub fn resolve(
        &self,
        state: &StoreState,
        change: &RemoteChange,
        now: Timestamp,
    ) -> Result<Resolution> {
        let remote_data = match change.kind {
            OpKind::Put => Some(
                change
                    .data
                    .clone()
                    .filter(Value::is_object)
                    .ok_or_else(|| {
                        Error::InvalidPayload(format!(
                            "remote put {}/{} has no object payload",
                            change.table, change.key
                        ))
                    })?,
            ),
            OpKind::Delete => None,
        };

        let mut pending = state.outbox.pending_for(&change.table, &change.key);
        let acknowledged: Vec<OpId> = pending
            .iter()
            .map(|op| op.id())
            .filter(|id| change.op_ids.contains(id))
            .collect();
        pending.retain(|op| !acknowledged.contains(&op.id()));

        let row = state.get(&change.table, &change.key);
        let mut resolution = Resolution::new(Decision::Applied);
        resolution.acknowledged = acknowledged;

        if row
            .and_then(|r| r.version)
            .is_some_and(|v| change.version <= v)
        {
            resolution.decision = Decision::Stale;
            return Ok(resolution);
        }
        if change.kind == OpKind::Put
            && state
                .tombstones
                .guards(&change.table, &change.key, Some(change.version), &change.hlc)
        {
            resolution.decision = Decision::Tombstoned;
            return Ok(resolution);
        }

        if pending.is_empty() {
            resolution.write = remote_write(change, remote_data, now);
            return Ok(resolution);
        }

        let local_data = row.map(|r| r.data.clone());
        let local_deleted = pending.last().is_some_and(|op| op.kind == OpKind::Delete);
        let policy = self.policies.policy_for(&change.table);

        match (policy, remote_data, local_data) {
            (TablePolicy::Merge(_) | TablePolicy::Crdt(_), Some(remote), Some(local))
                if !local_deleted =>
            {
                self.merge(resolution, policy, change, &pending, local, remote, now)
            }
            (_, remote, local) => Ok(lww(resolution, policy, change, &pending, local, remote, now)),
        }
    }

    /// Resolve `change` and apply the outcome inside `tx`.
    pub fn apply(&self, tx: &mut Transaction<'_>, change: &RemoteChange) -> Result<Resolution> {
        let resolution = self.resolve(tx.state(), change, tx.now())?;
        self.commit(tx, change, resolution)
    }

    /// Apply a resolution produced by [`Resolver::resolve`] for `change`.
    ///
    /// Nothing is written when `resolve` fails, so callers can skip a bad
    /// change and keep the rest of the transaction.
    pub fn commit(
        &self,
        tx: &mut Transaction<'_>,
        change: &RemoteChange,
        resolution: Resolution,
    ) -> Result<Resolution> {
        let outbox = &mut tx.state_mut().outbox;
        outbox.acknowledge(&resolution.acknowledged);
        outbox.acknowledge(&resolution.discarded);

        match &resolution.write {
            RowWrite::None => {}
            RowWrite::Put(record) => {
                tx.state_mut().tombstones.remove(&record.table, &record.key);
                tx.write_record(record.clone())?;
            }
            RowWrite::Delete(tomb) => {
                tx.remove_record(&tomb.table, &tomb.id, &tomb.hlc)?;
                let tombstones = &mut tx.state_mut().tombstones;
                tombstones.upsert(tomb.clone());
                if let Some(version) = tomb.version {
                    tombstones.set_version(&tomb.table, &tomb.id, version);
                }
            }
            RowWrite::Confirm(version) => {
                tx.confirm_record(&change.table, &change.key, *version);
            }
        }

        if let Some(rebase) = &resolution.rebase {
            tx.state_mut().outbox.rebase_key(
                &change.table,
                &change.key,
                &rebase.data,
                Some(rebase.base_version),
            );
        }
        Ok(resolution)
    }

    #[allow(clippy::too_many_arguments)]
    fn merge(
        &self,
        mut resolution: Resolution,
        policy: &TablePolicy,
        change: &RemoteChange,
        pending: &[&PendingOp],
        local: Value,
        remote: Value,
        now: Timestamp,
    ) -> Result<Resolution> {
        let (Some(local_fields), Some(remote_fields)) = (local.as_object(), remote.as_object())
        else {
            return Err(Error::InvalidPayload(format!(
                "row {}/{} is not an object",
                change.table, change.key
            )));
        };
        let local_hlc = latest_hlc(pending);
        let remote_wins = change.hlc > local_hlc;

        let touched: BTreeSet<&str> = pending
            .iter()
            .filter_map(|op| op.patch.as_ref().and_then(Value::as_object))
            .flat_map(|patch| patch.keys().map(String::as_str))
            .collect();

        let mut merged: Map<String, Value> = remote_fields.clone();
        let mut unresolved = Vec::new();

        for field in touched {
            let l = local_fields.get(field);
            let r = remote_fields.get(field);
            if l == r {
                continue;
            }
            let value = match policy {
                TablePolicy::Merge(fields) => fields
                    .get(field)
                    .and_then(|s| merge_strategy(*s, l, r, remote_wins)),
                TablePolicy::Crdt(fields) => fields
                    .get(field)
                    .and_then(|t| self.merge_crdt(t, l, r))
                    .map(Some),
                TablePolicy::Lww => None,
            };
            let value = match value {
                Some(v) => v,
                None => {
                    unresolved.push(field.to_string());
                    if remote_wins { r.cloned() } else { l.cloned() }
                }
            };
            match value {
                Some(v) => {
                    merged.insert(field.to_string(), v);
                }
                None => {
                    merged.remove(field);
                }
            }
        }

        let merged = Value::Object(merged);
        let hlc = change.hlc.clone().max(local_hlc);
        let record = Record::new_remote(
            change.table.clone(),
            change.key.clone(),
            merged.clone(),
            change.version,
            now,
            hlc,
        );

        resolution.decision = Decision::Merged;
        resolution.write = RowWrite::Put(record);
        resolution.rebase = Some(Rebase {
            data: merged.clone(),
            base_version: change.version,
        });
        if !unresolved.is_empty() {
            resolution.conflict = Some(Conflict {
                table: change.table.clone(),
                key: change.key.clone(),
                policy: policy.kind(),
                winner: Winner::Merged,
                local: Some(local),
                remote: Some(remote),
                resolved: Some(merged),
                unresolved_fields: unresolved,
                local_op_ids: pending.iter().map(|op| op.id()).collect(),
                remote_version: change.version,
            });
        }
        Ok(resolution)
    }

    /// Merge one CRDT field; `None` if the values cannot be merged.
    fn merge_crdt(&self, crdt: &CrdtType, l: Option<&Value>, r: Option<&Value>) -> Option<Value> {
        let (l, r) = match (l, r) {
            (Some(l), Some(r)) => (l, r),
            (Some(v), None) | (None, Some(v)) => return Some(v.clone()),
            (None, None) => return None,
        };
        match crdt {
            CrdtType::GCounter => crdt::g_counter(l, r),
            CrdtType::PnCounter => crdt::pn_counter(l, r),
            CrdtType::GSet => crdt::g_set(l, r),
            CrdtType::Max => crdt::max(l, r),
            CrdtType::Custom(name) => self.policies.crdt(name)?.merge(l, r),
        }
    }
}

fn latest_hlc(pending: &[&PendingOp]) -> Hlc {
    pending
        .iter()
        .map(|op| op.stamp.hlc.clone())
        .max()
        .unwrap_or_else(|| Hlc::zero(""))
}

/// Merge one field under the `merge` policy.
///
/// The outer `None` means the values could not be merged; the inner one
/// means the field ends up absent.
fn merge_strategy(
    strategy: FieldStrategy,
    l: Option<&Value>,
    r: Option<&Value>,
    remote_wins: bool,
) -> Option<Option<Value>> {
    let (l, r) = match (strategy, l, r) {
        (FieldStrategy::Lww, l, r) => {
            return Some(if remote_wins { r.cloned() } else { l.cloned() })
        }
        (_, Some(l), Some(r)) => (l, r),
        (_, Some(v), None) | (_, None, Some(v)) => return Some(Some(v.clone())),
        (_, None, None) => return Some(None),
    };
    match strategy {
        FieldStrategy::Union => crdt::g_set(l, r),
        FieldStrategy::Max => crdt::max(l, r),
        FieldStrategy::Min => crdt::min(l, r),
        FieldStrategy::Lww => None,
    }
    .map(Some)
}

fn remote_write(change: &RemoteChange, data: Option<Value>, now: Timestamp) -> RowWrite {
    match data {
        Some(data) => RowWrite::Put(Record::new_remote(
            change.table.clone(),
            change.key.clone(),
            data,
            change.version,
            now,
            change.hlc.clone(),
        )),
        None => RowWrite::Delete(Tombstone::new(
            change.table.clone(),
            change.key.clone(),
            change.changed_at,
            change.device_id.clone(),
            change.hlc.clone(),
            Some(change.version),
        )),
    }
}

fn lww(
    mut resolution: Resolution,
    policy: &TablePolicy,
    change: &RemoteChange,
    pending: &[&PendingOp],
    local: Option<Value>,
    remote: Option<Value>,
    now: Timestamp,
) -> Resolution {
    let remote_wins = change.hlc > latest_hlc(pending);
    let local_op_ids: Vec<OpId> = pending.iter().map(|op| op.id()).collect();

    let resolved = if remote_wins {
        remote.clone()
    } else {
        local.clone()
    };
    resolution.conflict = Some(Conflict {
        table: change.table.clone(),
        key: change.key.clone(),
        policy: policy.kind(),
        winner: if remote_wins {
            Winner::Remote
        } else {
            Winner::Local
        },
        local: local.clone(),
        remote: remote.clone(),
        resolved,
        unresolved_fields: Vec::new(),
        local_op_ids: local_op_ids.clone(),
        remote_version: change.version,
    });

    if remote_wins {
        resolution.decision = Decision::Applied;
        resolution.discarded = local_op_ids;
        resolution.write = remote_write(change, remote, now);
    } else {
        resolution.decision = Decision::KeptLocal;
        resolution.write = RowWrite::Confirm(change.version);
        resolution.rebase = Some(Rebase {
            data: local.unwrap_or_else(|| Value::Object(Map::new())),
            base_version: change.version,
        });
    }
    resolution
}
