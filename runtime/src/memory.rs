//! In-memory reference provider.
//!
//! Holds a per-tenant change log and row table the way a real backend
//! would: pushes are idempotent by op id, pulls page through the log (or a
//! full snapshot) with `has_more`, replicas report checkpoints, and GC only
//! confirms what every known replica has moved past. Fault injection hooks
//! let tests simulate outages, rate limits and expired cursors.

use async_trait::async_trait;
use dashmap::DashMap;
use driftsync_engine::{
    BatchOp, Cursor, DeviceId, Hlc, OpId, OpKind, PrimaryKey, PushBatch, RemoteChange, TableName,
    Timestamp, Version,
};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::auth::Credential;
use crate::error::ProviderError;
use crate::provider::{
    Capabilities, ChangeNotice, ChangeSink, GcCandidate, Provider, ProviderResult, PullResponse,
    PushAck, PushRejection, PushResponse, Scope, SubscriptionId, Supported,
};
use crate::throttle::RateLimit;
use crate::time::{SystemTime, TimeSource};

/// Maximum page size served by a pull.
const MAX_LIMIT: usize = 1000;

/// Provider calls that faults can be injected into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Call {
    Push,
    Pull,
    UpdateCursor,
    Gc,
}

#[derive(Debug)]
struct Fault {
    call: Call,
    error: ProviderError,
    remaining: usize,
}

#[derive(Debug, Clone)]
struct ServerRow {
    /// `None` once deleted
    data: Option<Value>,
    version: Version,
    hlc: Hlc,
    device_id: DeviceId,
    op_ids: Vec<OpId>,
    changed_at: Timestamp,
}

#[derive(Debug, Default)]
struct TenantLog {
    version: Version,
    rows: BTreeMap<TableName, BTreeMap<PrimaryKey, ServerRow>>,
    log: BTreeMap<TableName, Vec<RemoteChange>>,
    compacted_through: HashMap<TableName, Version>,
    applied: HashMap<OpId, Version>,
    checkpoints: HashMap<TableName, HashMap<DeviceId, Version>>,
}

impl TenantLog {
    /// Version recorded for a row whose ops were all applied before.
    fn replayed(&self, op_ids: &[OpId]) -> Option<Version> {
        if op_ids.is_empty() {
            return None;
        }
        op_ids
            .iter()
            .map(|id| self.applied.get(id).copied())
            .collect::<Option<Vec<_>>>()
            .and_then(|versions| versions.into_iter().max())
    }

    fn apply(&mut self, op: &BatchOp, device_id: &str, now: Timestamp) -> ProviderResult<Version> {
        let data = match op.kind {
            OpKind::Put => {
                let Some(Value::Object(patch)) = &op.patch else {
                    return Err(ProviderError::validation(format!(
                        "put {}/{} has no object patch",
                        op.table, op.primary_key
                    )));
                };
                let current = self
                    .rows
                    .get(&op.table)
                    .and_then(|rows| rows.get(&op.primary_key))
                    .and_then(|row| row.data.clone());
                let merged = match current {
                    Some(Value::Object(mut fields)) if !op.replace => {
                        for (k, v) in patch {
                            fields.insert(k.clone(), v.clone());
                        }
                        fields
                    }
                    _ => patch.clone(),
                };
                Some(Value::Object(merged))
            }
            OpKind::Delete => None,
        };

        self.version += 1;
        let version = self.version;
        let row = ServerRow {
            data: data.clone(),
            version,
            hlc: op.hlc.clone(),
            device_id: device_id.to_string(),
            op_ids: op.op_ids.clone(),
            changed_at: now,
        };
        self.rows
            .entry(op.table.clone())
            .or_default()
            .insert(op.primary_key.clone(), row);
        self.log
            .entry(op.table.clone())
            .or_default()
            .push(RemoteChange {
                table: op.table.clone(),
                key: op.primary_key.clone(),
                kind: op.kind,
                data,
                version,
                hlc: op.hlc.clone(),
                device_id: device_id.to_string(),
                op_ids: op.op_ids.clone(),
                changed_at: now,
            });
        for id in &op.op_ids {
            self.applied.insert(*id, version);
        }
        Ok(version)
    }

    fn snapshot_page(
        &self,
        table: &str,
        as_of: Version,
        after: &str,
        limit: usize,
    ) -> PullResponse {
        let lower = if after.is_empty() {
            Bound::Unbounded
        } else {
            Bound::Excluded(after.to_string())
        };
        let mut changes: Vec<RemoteChange> = self
            .rows
            .get(table)
            .into_iter()
            .flat_map(|rows| rows.range((lower.clone(), Bound::Unbounded)))
            .filter_map(|(key, row)| {
                let data = row.data.clone()?;
                Some(RemoteChange {
                    table: table.to_string(),
                    key: key.clone(),
                    kind: OpKind::Put,
                    data: Some(data),
                    version: row.version,
                    hlc: row.hlc.clone(),
                    device_id: row.device_id.clone(),
                    op_ids: row.op_ids.clone(),
                    changed_at: row.changed_at,
                })
            })
            .take(limit + 1)
            .collect();

        let has_more = changes.len() > limit;
        changes.truncate(limit);
        let next_cursor = match (has_more, changes.last()) {
            (true, Some(last)) => Cursor::new(format!("snap:{as_of}:{}", last.key), as_of),
            _ => Cursor::new(format!("log:{as_of}"), as_of),
        };
        PullResponse {
            changes,
            next_cursor,
            has_more,
        }
    }

    fn log_page(&self, table: &str, since: Version, limit: usize) -> ProviderResult<PullResponse> {
        let compacted = self.compacted_through.get(table).copied().unwrap_or(0);
        if since < compacted {
            return Err(ProviderError::cursor_expired(format!(
                "cursor {since} for {table} is older than the compacted log ({compacted})"
            )));
        }
        let mut changes: Vec<RemoteChange> = self
            .log
            .get(table)
            .into_iter()
            .flatten()
            .filter(|change| change.version > since)
            .take(limit + 1)
            .cloned()
            .collect();

        let has_more = changes.len() > limit;
        changes.truncate(limit);
        let next = changes.last().map_or(since, |c| c.version);
        Ok(PullResponse {
            changes,
            next_cursor: Cursor::new(format!("log:{next}"), next),
            has_more,
        })
    }

    /// Lowest checkpoint among the replicas known for `table`.
    fn min_checkpoint(&self, table: &str) -> Option<Version> {
        self.checkpoints
            .get(table)
            .and_then(|replicas| replicas.values().copied().min())
    }

    /// Drop log entries (and deleted rows) at or below `through`.
    fn compact(&mut self, table: &str, through: Version) -> usize {
        let mut removed = 0;
        if let Some(entries) = self.log.get_mut(table) {
            let before = entries.len();
            entries.retain(|c| c.version > through);
            removed = before - entries.len();
        }
        if let Some(rows) = self.rows.get_mut(table) {
            rows.retain(|_, row| row.data.is_some() || row.version > through);
        }
        let mark = self.compacted_through.entry(table.to_string()).or_insert(0);
        *mark = (*mark).max(through);
        removed
    }
}

enum Token<'a> {
    Snapshot { as_of: Version, after: &'a str },
    Log(Version),
}

fn parse_token(token: &str) -> Option<Token<'_>> {
    if let Some(rest) = token.strip_prefix("log:") {
        return rest.parse().ok().map(Token::Log);
    }
    let rest = token.strip_prefix("snap:")?;
    let (as_of, after) = rest.split_once(':')?;
    Some(Token::Snapshot {
        as_of: as_of.parse().ok()?,
        after,
    })
}

#[derive(Debug)]
struct Subscriber {
    tenant: String,
    table: TableName,
    sink: ChangeSink,
}

/// A backend living in process memory.
#[derive(Debug)]
pub struct MemoryProvider {
    id: String,
    capabilities: Capabilities,
    time: Arc<dyn TimeSource>,
    tenants: DashMap<String, TenantLog>,
    subscribers: DashMap<SubscriptionId, Subscriber>,
    /// Valid bearer tokens and their tenant; empty means open access
    tokens: DashMap<String, String>,
    rejected_keys: DashMap<(TableName, PrimaryKey), ProviderError>,
    faults: Mutex<Vec<Fault>>,
    rate_limit: Mutex<Option<RateLimit>>,
    offline: AtomicBool,
    push_calls: AtomicUsize,
    pull_calls: AtomicUsize,
}

impl MemoryProvider {
    /// Create a provider with every capability enabled.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            capabilities: Capabilities {
                realtime: true,
                gc_tombstones: true,
                gc_change_log: true,
            },
            time: Arc::new(SystemTime),
            tenants: DashMap::new(),
            subscribers: DashMap::new(),
            tokens: DashMap::new(),
            rejected_keys: DashMap::new(),
            faults: Mutex::new(Vec::new()),
            rate_limit: Mutex::new(None),
            offline: AtomicBool::new(false),
            push_calls: AtomicUsize::new(0),
            pull_calls: AtomicUsize::new(0),
        }
    }

    /// Create a provider wrapped in Arc for sharing.
    pub fn new_shared(id: impl Into<String>) -> Arc<Self> {
        Arc::new(Self::new(id))
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_time_source(mut self, time: Arc<dyn TimeSource>) -> Self {
        self.time = time;
        self
    }

    // ------------------------------------------------------------------
    // Access control and fault injection
    // ------------------------------------------------------------------

    /// Accept `token` for `tenant`. Once any token is registered, requests
    /// without a registered token are refused.
    pub fn authorize(&self, token: impl Into<String>, tenant: impl Into<String>) {
        self.tokens.insert(token.into(), tenant.into());
    }

    pub fn revoke(&self, token: &str) {
        self.tokens.remove(token);
    }

    /// Fail the next `times` calls of `call` with `error`.
    pub fn fail_next(&self, call: Call, error: ProviderError, times: usize) {
        self.faults.lock().push(Fault {
            call,
            error,
            remaining: times,
        });
    }

    /// Refuse every push of a row with `error` until cleared.
    pub fn reject_key(&self, table: &str, key: &str, error: ProviderError) {
        self.rejected_keys
            .insert((table.to_string(), key.to_string()), error);
    }

    pub fn clear_rejections(&self) {
        self.rejected_keys.clear();
    }

    /// Quota headers attached to every push response.
    pub fn set_rate_limit(&self, limit: Option<RateLimit>) {
        *self.rate_limit.lock() = limit;
    }

    /// Fail every call with a network error while offline.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn push_calls(&self) -> usize {
        self.push_calls.load(Ordering::SeqCst)
    }

    pub fn pull_calls(&self) -> usize {
        self.pull_calls.load(Ordering::SeqCst)
    }

    fn check(&self, call: Call, credential: &Credential, scope: &Scope) -> ProviderResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(ProviderError::network("backend unreachable"));
        }
        if !self.tokens.is_empty() {
            match self.tokens.get(&credential.token) {
                None => return Err(ProviderError::auth_expired()),
                Some(tenant) if *tenant != scope.tenant => {
                    return Err(ProviderError::validation(format!(
                        "credential is not valid for tenant {}",
                        scope.tenant
                    )));
                }
                Some(_) => {}
            }
        }

        let mut faults = self.faults.lock();
        if let Some(pos) = faults.iter().position(|f| f.call == call && f.remaining > 0) {
            let fault = &mut faults[pos];
            fault.remaining -= 1;
            let error = fault.error.clone();
            if fault.remaining == 0 {
                faults.remove(pos);
            }
            tracing::debug!(?call, code = %error.code, "Injected provider fault");
            return Err(error);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Direct backend access (other devices, inspection)
    // ------------------------------------------------------------------

    /// Write a full row as another device would. Returns its version.
    pub fn remote_put(
        &self,
        tenant: &str,
        table: &str,
        key: &str,
        data: Value,
        device_id: &str,
        hlc: Hlc,
    ) -> ProviderResult<Version> {
        self.remote_write(tenant, table, key, OpKind::Put, Some(data), device_id, hlc)
    }

    /// Delete a row as another device would. Returns its version.
    pub fn remote_delete(
        &self,
        tenant: &str,
        table: &str,
        key: &str,
        device_id: &str,
        hlc: Hlc,
    ) -> ProviderResult<Version> {
        self.remote_write(tenant, table, key, OpKind::Delete, None, device_id, hlc)
    }

    #[allow(clippy::too_many_arguments)]
    fn remote_write(
        &self,
        tenant: &str,
        table: &str,
        key: &str,
        kind: OpKind,
        data: Option<Value>,
        device_id: &str,
        hlc: Hlc,
    ) -> ProviderResult<Version> {
        let now = self.time.now_ms();
        let op = BatchOp {
            op_ids: vec![OpId::new()],
            table: table.to_string(),
            primary_key: key.to_string(),
            kind,
            patch: data,
            replace: true,
            base_version: None,
            created_at: now,
            hlc,
        };
        let version = self
            .tenants
            .entry(tenant.to_string())
            .or_default()
            .apply(&op, device_id, now)?;
        self.notify(tenant, table, version);
        Ok(version)
    }

    /// Append `change` to the change log as is, skipping validation and the
    /// row table. Stands in for a backend serving a malformed change.
    pub fn append_raw(&self, tenant: &str, mut change: RemoteChange) -> Version {
        let table = change.table.clone();
        let version = {
            let mut log = self.tenants.entry(tenant.to_string()).or_default();
            log.version += 1;
            change.version = log.version;
            let version = log.version;
            log.log.entry(table.clone()).or_default().push(change);
            version
        };
        self.notify(tenant, &table, version);
        version
    }

    /// Current row contents (`None` if absent or deleted).
    pub fn row(&self, tenant: &str, table: &str, key: &str) -> Option<Value> {
        let log = self.tenants.get(tenant)?;
        log.rows.get(table)?.get(key)?.data.clone()
    }

    /// Server version of a row, deleted rows included.
    pub fn row_version(&self, tenant: &str, table: &str, key: &str) -> Option<Version> {
        let log = self.tenants.get(tenant)?;
        Some(log.rows.get(table)?.get(key)?.version)
    }

    /// Number of change-log entries for a table.
    pub fn log_len(&self, tenant: &str, table: &str) -> usize {
        self.tenants
            .get(tenant)
            .and_then(|log| log.log.get(table).map(Vec::len))
            .unwrap_or(0)
    }

    pub fn checkpoint(&self, tenant: &str, table: &str, device_id: &str) -> Option<Version> {
        let log = self.tenants.get(tenant)?;
        log.checkpoints.get(table)?.get(device_id).copied()
    }

    /// Compact the change log unconditionally (expires older cursors).
    pub fn compact(&self, tenant: &str, table: &str, through: Version) -> usize {
        self.tenants
            .entry(tenant.to_string())
            .or_default()
            .compact(table, through)
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Send a change notice to every subscriber of the scope.
    ///
    /// Returns the number of subscribers that received it.
    fn notify(&self, tenant: &str, table: &str, version: Version) -> usize {
        let mut sent = 0;
        let mut closed = Vec::new();
        for entry in self.subscribers.iter() {
            let sub = entry.value();
            if sub.tenant != tenant || sub.table != table {
                continue;
            }
            let notice = ChangeNotice {
                tenant: tenant.to_string(),
                table: table.to_string(),
                version,
            };
            if sub.sink.send(notice).is_ok() {
                sent += 1;
            } else {
                closed.push(*entry.key());
            }
        }
        for id in closed {
            self.subscribers.remove(&id);
        }

        tracing::debug!(tenant, table, version, recipients = sent, "Notified subscribers");
        sent
    }
}

#[async_trait]
impl Provider for MemoryProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    async fn subscribe(
        &self,
        credential: &Credential,
        scope: &Scope,
        sink: ChangeSink,
    ) -> ProviderResult<Supported<SubscriptionId>> {
        if !self.capabilities.realtime {
            return Ok(Supported::Unsupported);
        }
        self.check(Call::Pull, credential, scope)?;
        let id = SubscriptionId::new();
        self.subscribers.insert(
            id,
            Subscriber {
                tenant: scope.tenant.clone(),
                table: scope.table.clone(),
                sink,
            },
        );
        tracing::debug!(scope = %scope.key(), "Realtime subscription registered");
        Ok(Supported::Done(id))
    }

    async fn unsubscribe(&self, subscription: SubscriptionId) -> ProviderResult<()> {
        if let Some((_, sub)) = self.subscribers.remove(&subscription) {
            tracing::debug!(
                tenant = %sub.tenant,
                table = %sub.table,
                "Realtime subscription removed"
            );
        }
        Ok(())
    }

    async fn pull(
        &self,
        credential: &Credential,
        scope: &Scope,
        cursor: Option<&Cursor>,
        limit: usize,
    ) -> ProviderResult<PullResponse> {
        self.pull_calls.fetch_add(1, Ordering::SeqCst);
        self.check(Call::Pull, credential, scope)?;
        let limit = limit.clamp(1, MAX_LIMIT);

        let log = self.tenants.entry(scope.tenant.clone()).or_default();
        match cursor.map(|c| parse_token(&c.token)) {
            None => Ok(log.snapshot_page(&scope.table, log.version, "", limit)),
            Some(Some(Token::Snapshot { as_of, after })) => {
                Ok(log.snapshot_page(&scope.table, as_of, after, limit))
            }
            Some(Some(Token::Log(since))) => log.log_page(&scope.table, since, limit),
            Some(None) => Err(ProviderError::cursor_expired("unrecognized cursor")),
        }
    }

    async fn push(
        &self,
        credential: &Credential,
        scope: &Scope,
        device_id: &DeviceId,
        batch: &PushBatch,
    ) -> ProviderResult<PushResponse> {
        self.push_calls.fetch_add(1, Ordering::SeqCst);
        self.check(Call::Push, credential, scope)?;
        if batch.table != scope.table {
            return Err(ProviderError::validation(format!(
                "batch for {} sent to scope {}",
                batch.table,
                scope.key()
            )));
        }

        let now = self.time.now_ms();
        let mut response = PushResponse {
            rate_limit: *self.rate_limit.lock(),
            ..PushResponse::default()
        };
        let mut versions = Vec::new();
        {
            let mut log = self.tenants.entry(scope.tenant.clone()).or_default();
            for op in &batch.ops {
                if let Some(version) = log.replayed(&op.op_ids) {
                    // Already applied; acknowledge again without a second effect
                    response.acked.push(PushAck {
                        op_ids: op.op_ids.clone(),
                        primary_key: op.primary_key.clone(),
                        version,
                    });
                    continue;
                }
                let rejection = self
                    .rejected_keys
                    .get(&(op.table.clone(), op.primary_key.clone()))
                    .map(|e| e.value().clone());
                let outcome = match rejection {
                    Some(err) => Err(err),
                    None => log.apply(op, device_id, now),
                };
                match outcome {
                    Ok(version) => {
                        versions.push(version);
                        response.acked.push(PushAck {
                            op_ids: op.op_ids.clone(),
                            primary_key: op.primary_key.clone(),
                            version,
                        });
                    }
                    Err(err) => response.rejected.push(PushRejection {
                        op_ids: op.op_ids.clone(),
                        primary_key: op.primary_key.clone(),
                        error: err.into(),
                    }),
                }
            }
        }

        if let Some(&latest) = versions.last() {
            self.notify(&scope.tenant, &scope.table, latest);
        }
        tracing::debug!(
            scope = %scope.key(),
            acked = response.acked.len(),
            rejected = response.rejected.len(),
            "Push processed"
        );
        Ok(response)
    }

    async fn update_cursor(
        &self,
        credential: &Credential,
        scope: &Scope,
        device_id: &DeviceId,
        version: Version,
    ) -> ProviderResult<()> {
        self.check(Call::UpdateCursor, credential, scope)?;
        let mut log = self.tenants.entry(scope.tenant.clone()).or_default();
        let checkpoint = log
            .checkpoints
            .entry(scope.table.clone())
            .or_default()
            .entry(device_id.clone())
            .or_insert(0);
        *checkpoint = (*checkpoint).max(version);
        Ok(())
    }

    async fn gc_tombstones(
        &self,
        credential: &Credential,
        scope: &Scope,
        candidates: &[GcCandidate],
    ) -> ProviderResult<Supported<Vec<PrimaryKey>>> {
        if !self.capabilities.gc_tombstones {
            return Ok(Supported::Unsupported);
        }
        self.check(Call::Gc, credential, scope)?;
        let log = self.tenants.entry(scope.tenant.clone()).or_default();
        let Some(floor) = log.min_checkpoint(&scope.table) else {
            return Ok(Supported::Done(Vec::new()));
        };
        let purgeable = candidates
            .iter()
            .filter(|c| c.version.is_some_and(|v| v <= floor))
            .map(|c| c.id.clone())
            .collect();
        Ok(Supported::Done(purgeable))
    }

    async fn gc_change_log(
        &self,
        credential: &Credential,
        scope: &Scope,
        up_to: Version,
    ) -> ProviderResult<Supported<usize>> {
        if !self.capabilities.gc_change_log {
            return Ok(Supported::Unsupported);
        }
        self.check(Call::Gc, credential, scope)?;
        let mut log = self.tenants.entry(scope.tenant.clone()).or_default();
        let floor = log
            .min_checkpoint(&scope.table)
            .map_or(0, |min| min.min(up_to));
        Ok(Supported::Done(log.compact(&scope.table, floor)))
    }
}
