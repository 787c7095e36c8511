//! The pull loop and cursor manager.
//!
//! A pull cycle pages through the provider's change stream for one table.
//! Each page is resolved into the local store and the cursor advanced in the
//! same transaction, so the cursor never runs ahead of applied data. An
//! expired cursor switches the table into rescan mode: a full snapshot is
//! buffered aside, pending local ops are replayed on top of it, and the
//! result replaces the table in a single transaction.

use driftsync_engine::{
    Conflict, Cursor, ErrorCode, OpId, OpKind, Origin, PendingOp, Record, RemoteChange, RunKind,
    SyncRun, Table, TableName,
};
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::auth::Credential;
use crate::context::SyncContext;
use crate::error::{ProviderError, Result, SyncError};
use crate::events::{ErrorNotice, SyncEvent};
use crate::provider::{
    ChangeNotice, ChangeSink, Provider, PullResponse, Scope, SubscriptionId, Supported,
};

/// Outcome of pulling one or more tables.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PullReport {
    pub pages: usize,
    /// Changes that touched local state
    pub pulled: usize,
    pub conflicts: usize,
    /// Invalid remote changes skipped with an error event
    pub skipped: usize,
    /// Tables rebuilt from a snapshot
    pub rescanned: Vec<TableName>,
    /// The iteration guard stopped the cycle with changes left
    pub has_more: bool,
}

impl PullReport {
    fn absorb(&mut self, other: PullReport) {
        self.pages += other.pages;
        self.pulled += other.pulled;
        self.conflicts += other.conflicts;
        self.skipped += other.skipped;
        self.rescanned.extend(other.rescanned);
        self.has_more |= other.has_more;
    }
}

/// What one applied page did to local state.
#[derive(Default)]
struct PageOutcome<'p> {
    applied: usize,
    conflicts: Vec<Conflict>,
    skipped: Vec<(&'p RemoteChange, driftsync_engine::Error)>,
}

/// Per-call inputs captured at the start of a cycle.
struct Session {
    provider: Arc<dyn Provider>,
    credential: Credential,
    scope: Scope,
    generation: u64,
    token: CancellationToken,
}

/// Fetches remote changes and applies them locally.
#[derive(Debug, Clone)]
pub struct PullLoop {
    ctx: Arc<SyncContext>,
}

impl PullLoop {
    pub fn new(ctx: Arc<SyncContext>) -> Self {
        Self { ctx }
    }

    fn session(&self, table: &str) -> Result<Session> {
        self.ctx.ensure_healthy()?;
        Ok(Session {
            provider: self.ctx.provider()?,
            credential: self.ctx.credential()?,
            scope: self.ctx.scope(table),
            generation: self.ctx.generation(),
            token: self.ctx.scope_token(),
        })
    }

    /// Pull every synced table.
    pub async fn pull_all(&self) -> Result<PullReport> {
        let mut report = PullReport::default();
        for table in self.ctx.tables() {
            match self.pull_scope(&table).await {
                Ok(r) => report.absorb(r),
                Err(
                    err @ (SyncError::AuthBlocked
                    | SyncError::Cancelled
                    | SyncError::Unhealthy(_)),
                ) => return Err(err),
                Err(err) => {
                    tracing::warn!(table = %table, error = %err, "Pull failed");
                }
            }
        }
        Ok(report)
    }

    /// Pull one table until the stream is drained or the iteration guard
    /// is hit. Falls back to a rescan if the cursor has expired.
    pub async fn pull_scope(&self, table: &str) -> Result<PullReport> {
        let _cycle = self.ctx.pull_lock.lock().await;
        let session = self.session(table)?;

        let mut run = self.ctx.start_run(RunKind::Pull, Some(table))?;
        let mut report = PullReport::default();
        let outcome = self.pull_pages(&session, &mut run, &mut report).await;

        let outcome = match outcome {
            Err(SyncError::Provider(err)) if err.code == ErrorCode::CursorExpired => {
                tracing::warn!(table, message = %err.message, "Cursor expired, rescanning");
                run.record_error(err.code, err.message);
                self.ctx.finish_run(run);
                self.rescan_locked(table).await?;
                report.rescanned.push(table.to_string());
                return Ok(report);
            }
            Err(SyncError::Provider(err)) => Err(self.pull_failed(table, err, &mut run)),
            other => other,
        };

        run.pulled = report.pulled as u32;
        run.conflicts = report.conflicts as u32;
        self.ctx.finish_run(run);
        outcome.map(|()| report)
    }

    async fn pull_pages(
        &self,
        session: &Session,
        run: &mut SyncRun,
        report: &mut PullReport,
    ) -> Result<()> {
        let table = session.scope.table.as_str();
        let limit = self.ctx.config.pull_limit;

        for _ in 0..self.ctx.config.max_pull_iterations.max(1) {
            let cursor = self.ctx.store.lock().state().cursors.cursor(table).cloned();
            let page = self
                .ctx
                .call(
                    &session.token,
                    session
                        .provider
                        .pull(&session.credential, &session.scope, cursor.as_ref(), limit),
                )
                .await?;
            if !self.ctx.is_current(session.generation) {
                tracing::debug!(
                    table,
                    generation = session.generation,
                    "Discarding pull result from a previous scope"
                );
                return Err(SyncError::Cancelled);
            }

            let outcome = self.apply_page(table, &page)?;
            report.pages += 1;
            report.pulled += outcome.applied;
            report.conflicts += outcome.conflicts.len();
            report.skipped += outcome.skipped.len();
            report.has_more = page.has_more;
            tracing::debug!(
                table,
                changes = page.changes.len(),
                applied = outcome.applied,
                skipped = outcome.skipped.len(),
                cursor = page.next_cursor.version,
                has_more = page.has_more,
                "Applied pull page"
            );
            for conflict in outcome.conflicts {
                tracing::info!(
                    table,
                    key = %conflict.key,
                    winner = ?conflict.winner,
                    "Conflict resolved"
                );
                self.ctx.events.emit(SyncEvent::Conflict(Box::new(conflict)));
            }
            for (change, err) in outcome.skipped {
                tracing::error!(
                    table,
                    key = %change.key,
                    version = change.version,
                    error = %err,
                    "Skipped invalid remote change"
                );
                run.record_error(ErrorCode::Validation, err.to_string());
                self.ctx.events.emit(SyncEvent::Error(ErrorNotice {
                    table: Some(table.to_string()),
                    op_ids: change.op_ids.clone(),
                    code: ErrorCode::Validation,
                    message: format!("remote change {}/{}: {err}", change.table, change.key),
                }));
            }
            if !page.has_more {
                break;
            }
        }

        if report.has_more {
            tracing::debug!(table, "Pull iteration guard reached, resuming next cycle");
        } else {
            self.checkpoint(session, run).await;
        }
        Ok(())
    }

    /// Resolve a page and advance the cursor atomically.
    ///
    /// A change the resolver refuses (a put without an object payload) is
    /// skipped and reported; the rest of the page still applies and the
    /// cursor moves past it.
    fn apply_page<'p>(&self, table: &str, page: &'p PullResponse) -> Result<PageOutcome<'p>> {
        let now = self.ctx.now();
        let resolver = &self.ctx.resolver;
        self.ctx.remote_tx(|tx| {
            let mut outcome = PageOutcome::default();
            for change in &page.changes {
                let resolution = match resolver.resolve(tx.state(), change, tx.now()) {
                    Ok(resolution) => resolution,
                    Err(err) if !err.is_fatal() => {
                        outcome.skipped.push((change, err));
                        continue;
                    }
                    Err(err) => return Err(err),
                };
                let resolution = resolver.commit(tx, change, resolution)?;
                if !resolution.is_noop() {
                    outcome.applied += 1;
                }
                outcome.conflicts.extend(resolution.conflict);
            }
            if !tx
                .state_mut()
                .cursors
                .advance(table, page.next_cursor.clone(), now)
            {
                tracing::debug!(
                    table,
                    cursor = page.next_cursor.version,
                    "Ignoring regressing cursor"
                );
            }
            Ok(outcome)
        })
    }

    /// Report this replica's position so the backend can GC behind it.
    async fn checkpoint(&self, session: &Session, run: &mut SyncRun) {
        let table = session.scope.table.as_str();
        let version = self
            .ctx
            .store
            .lock()
            .state()
            .cursors
            .cursor(table)
            .map(|c| c.version);
        let Some(version) = version else {
            return;
        };
        let device_id = self.ctx.device_id();
        let result = self
            .ctx
            .call(
                &session.token,
                session
                    .provider
                    .update_cursor(&session.credential, &session.scope, &device_id, version),
            )
            .await;
        if let Err(err) = result {
            tracing::debug!(table, version, error = %err, "Checkpoint not recorded");
            if let SyncError::Provider(err) = err {
                run.record_error(err.code, err.message);
            }
        }
    }

    fn pull_failed(&self, table: &str, err: ProviderError, run: &mut SyncRun) -> SyncError {
        run.record_error(err.code, err.message.clone());
        match err.code {
            ErrorCode::AuthExpired => {
                self.ctx.auth_rejected(&err);
                SyncError::AuthBlocked
            }
            code if code.is_retriable() => {
                tracing::warn!(
                    table,
                    %code,
                    message = %err.message,
                    "Pull failed, retrying next cycle"
                );
                SyncError::Provider(err)
            }
            code => {
                tracing::error!(table, %code, message = %err.message, "Pull failed");
                self.ctx.events.emit(SyncEvent::Error(ErrorNotice {
                    table: Some(table.to_string()),
                    op_ids: Vec::new(),
                    code,
                    message: err.message.clone(),
                }));
                SyncError::Provider(err)
            }
        }
    }

    // ------------------------------------------------------------------
    // Rescan
    // ------------------------------------------------------------------

    /// Rebuild a table from a full snapshot.
    ///
    /// Returns the number of rows in the rebuilt table.
    pub async fn rescan(&self, table: &str) -> Result<usize> {
        let _cycle = self.ctx.pull_lock.lock().await;
        self.rescan_locked(table).await
    }

    async fn rescan_locked(&self, table: &str) -> Result<usize> {
        tracing::info!(table, "Rescan started");
        self.ctx.events.emit(SyncEvent::RescanStarted {
            table: table.to_string(),
        });

        let result = self.rescan_inner(table).await;
        match &result {
            Ok(rows) => {
                tracing::info!(table, rows, "Rescan completed");
                self.ctx.events.emit(SyncEvent::RescanCompleted {
                    table: table.to_string(),
                    rows: *rows,
                });
            }
            Err(err) => {
                tracing::warn!(table, error = %err, "Rescan failed");
                self.ctx.events.emit(SyncEvent::RescanFailed {
                    table: table.to_string(),
                    code: err.code(),
                    message: err.to_string(),
                });
            }
        }
        result
    }

    async fn rescan_inner(&self, table: &str) -> Result<usize> {
        let session = self.session(table)?;
        let mut run = self.ctx.start_run(RunKind::Rescan, Some(table))?;

        let fetched = self.fetch_snapshot(&session).await;
        let (buffer, cursor) = match fetched {
            Ok(snapshot) => snapshot,
            Err(err) => {
                let err = match err {
                    SyncError::Provider(err) => self.pull_failed(table, err, &mut run),
                    other => other,
                };
                self.ctx.finish_run(run);
                return Err(err);
            }
        };

        let now = self.ctx.now();
        let rows = self.ctx.remote_tx(|tx| {
            let state = tx.state();
            let echoed: HashSet<OpId> = buffer
                .iter()
                .flat_map(|c| c.op_ids.iter().copied())
                .collect();
            let (acked, pending): (Vec<PendingOp>, Vec<PendingOp>) = state
                .outbox
                .iter()
                .filter(|op| !op.is_failed() && op.table == table)
                .cloned()
                .partition(|op| echoed.contains(&op.id()));

            let mut rows: Table = buffer
                .iter()
                .filter(|c| {
                    !state
                        .tombstones
                        .guards(table, &c.key, Some(c.version), &c.hlc)
                })
                .filter_map(|c| {
                    let Some(data) = c.data.clone().filter(Value::is_object) else {
                        if c.kind == OpKind::Put {
                            tracing::warn!(
                                table,
                                key = %c.key,
                                "Snapshot row without object payload dropped"
                            );
                        }
                        return None;
                    };
                    let hlc = c.hlc.clone();
                    Some(Record::new_remote(table, c.key.clone(), data, c.version, now, hlc))
                })
                .collect();
            replay(&mut rows, &pending, now);

            let state = tx.state_mut();
            let acked_ids: Vec<OpId> = acked.iter().map(PendingOp::id).collect();
            state.outbox.acknowledge(&acked_ids);
            let keys: BTreeSet<&str> = pending.iter().map(|op| op.primary_key.as_str()).collect();
            for key in keys {
                let base = buffer.iter().find(|c| c.key == key).map(|c| c.version);
                let data = rows
                    .get(key)
                    .map(|r| r.data.clone())
                    .unwrap_or_else(|| Value::Object(Map::new()));
                state.outbox.rebase_key(table, key, &data, base);
            }

            state.cursors.reset(table);
            state.cursors.advance(table, cursor, now);
            let count = rows.len();
            tx.replace_table(table, rows);
            Ok(count)
        })?;

        run.pulled = buffer.len() as u32;
        self.ctx.finish_run(run);
        Ok(rows)
    }

    /// Page through a full snapshot into a side buffer.
    async fn fetch_snapshot(&self, session: &Session) -> Result<(Vec<RemoteChange>, Cursor)> {
        let mut buffer = Vec::new();
        let mut cursor: Option<Cursor> = None;
        loop {
            let page = self
                .ctx
                .call(
                    &session.token,
                    session.provider.pull(
                        &session.credential,
                        &session.scope,
                        cursor.as_ref(),
                        self.ctx.config.pull_limit,
                    ),
                )
                .await?;
            if !self.ctx.is_current(session.generation) {
                return Err(SyncError::Cancelled);
            }
            buffer.extend(page.changes);
            if !page.has_more {
                return Ok((buffer, page.next_cursor));
            }
            cursor = Some(page.next_cursor);
        }
    }

    // ------------------------------------------------------------------
    // Loop
    // ------------------------------------------------------------------

    async fn subscribe_all(&self, sink: &ChangeSink) -> Vec<(Arc<dyn Provider>, SubscriptionId)> {
        let mut subscriptions = Vec::new();
        let (Ok(provider), Ok(credential)) = (self.ctx.provider(), self.ctx.credential()) else {
            return subscriptions;
        };
        if !provider.capabilities().realtime {
            tracing::debug!(provider = provider.id(), "Realtime unsupported, polling only");
            return subscriptions;
        }
        for table in self.ctx.tables() {
            let scope = self.ctx.scope(&table);
            match provider.subscribe(&credential, &scope, sink.clone()).await {
                Ok(Supported::Done(id)) => subscriptions.push((provider.clone(), id)),
                Ok(Supported::Unsupported) => break,
                Err(err) => {
                    tracing::warn!(scope = %scope.key(), error = %err, "Realtime subscribe failed")
                }
            }
        }
        tracing::debug!(count = subscriptions.len(), "Realtime subscriptions active");
        subscriptions
    }

    async fn unsubscribe_all(subscriptions: &mut Vec<(Arc<dyn Provider>, SubscriptionId)>) {
        for (provider, id) in subscriptions.drain(..) {
            if let Err(err) = provider.unsubscribe(id).await {
                tracing::debug!(error = %err, "Unsubscribe failed");
            }
        }
    }

    /// Collect notices arriving within the realtime window after `first`.
    async fn coalesce_notices(
        &self,
        first: ChangeNotice,
        notices: &mut mpsc::UnboundedReceiver<ChangeNotice>,
    ) -> BTreeSet<TableName> {
        let tenant = self.ctx.tenant();
        let mut tables = BTreeSet::new();
        let mut accept = |notice: ChangeNotice| {
            if notice.tenant == tenant {
                tables.insert(notice.table);
            }
        };
        accept(first);
        let window = tokio::time::sleep(self.ctx.config.realtime_window);
        tokio::pin!(window);
        loop {
            tokio::select! {
                _ = &mut window => break,
                Some(notice) = notices.recv() => accept(notice),
            }
        }
        tables
    }

    /// Pull on the interval and on realtime notices until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) {
        tracing::info!("Pull loop started");
        let (sink, mut notices) = mpsc::unbounded_channel();
        let mut subscriptions = Vec::new();
        let mut subscribed: Option<u64> = None;
        let mut visibility = self.ctx.visibility.subscribe();
        let mut notified: Option<BTreeSet<TableName>> = None;

        loop {
            if !self.ctx.wait_runnable(&shutdown).await {
                break;
            }

            let generation = self.ctx.generation();
            if subscribed != Some(generation) {
                Self::unsubscribe_all(&mut subscriptions).await;
                subscriptions = self.subscribe_all(&sink).await;
                subscribed = Some(generation);
            }

            let result = match notified.take() {
                Some(tables) => {
                    let mut report = PullReport::default();
                    for table in tables {
                        match self.pull_scope(&table).await {
                            Ok(r) => report.absorb(r),
                            Err(err) => tracing::debug!(
                                table = %table,
                                error = %err,
                                "Realtime pull failed"
                            ),
                        }
                    }
                    Ok(report)
                }
                None => self.pull_all().await,
            };
            let mut wait = self.ctx.throttle(self.ctx.config.pull_interval);
            match result {
                Ok(report) if report.has_more => wait = std::time::Duration::ZERO,
                Ok(report) if report.pages > 0 => {
                    tracing::debug!(
                        pulled = report.pulled,
                        conflicts = report.conflicts,
                        "Pull cycle finished"
                    );
                }
                Ok(_)
                | Err(
                    SyncError::AuthBlocked | SyncError::Cancelled | SyncError::Unhealthy(_),
                ) => {}
                Err(err) => tracing::warn!(error = %err, "Pull cycle failed"),
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = visibility.changed() => {}
                _ = self.ctx.scope_changed.notified() => {}
                _ = tokio::time::sleep(wait) => {}
                Some(notice) = notices.recv() => {
                    notified = Some(self.coalesce_notices(notice, &mut notices).await);
                }
            }
        }

        Self::unsubscribe_all(&mut subscriptions).await;
        tracing::info!("Pull loop stopped");
    }
}

/// Replay pending local ops (in capture order) on top of snapshot rows.
fn replay(rows: &mut Table, pending: &[PendingOp], now: driftsync_engine::Timestamp) {
    for op in pending {
        match op.kind {
            OpKind::Put => {
                let Some(Value::Object(fields)) = &op.patch else {
                    continue;
                };
                match rows.get_mut(&op.primary_key) {
                    Some(record) => {
                        record.apply_patch(fields, now, op.stamp.hlc.clone(), Origin::Local)
                    }
                    None => {
                        rows.insert(Record::new_local(
                            op.table.clone(),
                            op.primary_key.clone(),
                            Value::Object(fields.clone()),
                            now,
                            op.stamp.hlc.clone(),
                        ));
                    }
                }
            }
            OpKind::Delete => {
                rows.remove(&op.primary_key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::memory::{Call, MemoryProvider};
    use crate::registry::ProviderRegistry;
    use crate::time::ManualTime;
    use driftsync_engine::{
        FieldDef, FieldType, Hlc, LocalStore, PolicySet, Resolver, Schema, TableSchema, Winner,
    };
    use serde_json::json;

    struct Fixture {
        ctx: Arc<SyncContext>,
        provider: Arc<MemoryProvider>,
        pull: PullLoop,
    }

    fn fixture(config: SyncConfig) -> Fixture {
        let schema = Schema::new(1).with_table(TableSchema::new(
            "threads",
            vec![
                FieldDef::optional("title", FieldType::String),
                FieldDef::optional("body", FieldType::String),
            ],
        ));
        let provider = MemoryProvider::new_shared("mem");
        let registry = ProviderRegistry::new_shared();
        registry.register(provider.clone());
        let ctx = Arc::new(SyncContext::new(
            config.with_tenant("acme"),
            LocalStore::with_capture(schema, "dev-a"),
            registry,
            Resolver::new(PolicySet::new()),
            Arc::new(ManualTime::new(1_000)),
        ));
        ctx.set_credential(Credential::new("token", "acme"));
        Fixture {
            pull: PullLoop::new(ctx.clone()),
            ctx,
            provider,
        }
    }

    fn remote_put(provider: &MemoryProvider, key: &str, title: &str, ts: u64) -> u64 {
        let hlc = Hlc::new(ts, 0, "dev-b");
        provider
            .remote_put("acme", "threads", key, json!({"title": title}), "dev-b", hlc)
            .unwrap()
    }

    fn local_put(ctx: &SyncContext, key: &str, data: Value) {
        let now = ctx.now();
        ctx.store
            .lock()
            .transaction(Origin::Local, now, |tx| tx.put("threads", key, data))
            .unwrap();
    }

    #[tokio::test]
    async fn pull_applies_changes_and_checkpoints() {
        let f = fixture(SyncConfig::default());
        remote_put(&f.provider, "t1", "Hello", 500);
        remote_put(&f.provider, "t2", "World", 600);

        let report = f.pull.pull_scope("threads").await.unwrap();
        assert_eq!(report.pulled, 2);
        assert!(!report.has_more);

        let store = f.ctx.store.lock();
        assert_eq!(store.get("threads", "t1").unwrap().data, json!({"title": "Hello"}));
        assert_eq!(store.state().cursors.cursor("threads").unwrap().version, 2);
        assert!(store.state().outbox.is_empty());
        drop(store);
        assert_eq!(f.provider.checkpoint("acme", "threads", "dev-a"), Some(2));
    }

    #[tokio::test]
    async fn iteration_guard_bounds_a_cycle() {
        let f = fixture(SyncConfig::default().with_pull_limit(2).with_max_pull_iterations(2));
        for i in 0..5 {
            remote_put(&f.provider, &format!("t{i}"), "x", 500 + i);
        }

        let first = f.pull.pull_scope("threads").await.unwrap();
        assert_eq!(first.pages, 2);
        assert!(first.has_more);
        assert_eq!(f.provider.checkpoint("acme", "threads", "dev-a"), None);

        let second = f.pull.pull_scope("threads").await.unwrap();
        assert!(!second.has_more);
        assert_eq!(f.ctx.store.lock().records("threads").len(), 5);
    }

    #[tokio::test]
    async fn failed_pull_keeps_cursor() {
        let f = fixture(SyncConfig::default());
        remote_put(&f.provider, "t1", "Hello", 500);
        f.pull.pull_scope("threads").await.unwrap();

        remote_put(&f.provider, "t2", "World", 600);
        f.provider
            .fail_next(Call::Pull, ProviderError::from_status(503, "unavailable"), 1);
        assert!(f.pull.pull_scope("threads").await.is_err());
        assert_eq!(f.ctx.store.lock().state().cursors.cursor("threads").unwrap().version, 1);

        f.pull.pull_scope("threads").await.unwrap();
        assert_eq!(f.ctx.store.lock().state().cursors.cursor("threads").unwrap().version, 2);
    }

    #[tokio::test]
    async fn concurrent_edit_emits_conflict() {
        let f = fixture(SyncConfig::default());
        let mut events = f.ctx.events.subscribe();
        local_put(&f.ctx, "t1", json!({"title": "mine"}));
        remote_put(&f.provider, "t1", "theirs", 5_000);

        f.pull.pull_scope("threads").await.unwrap();
        let conflict = std::iter::from_fn(|| events.try_recv().ok())
            .find_map(|e| match e {
                SyncEvent::Conflict(c) => Some(c),
                _ => None,
            })
            .unwrap();
        assert_eq!(conflict.winner, Winner::Remote);
        assert!(f.ctx.store.lock().state().outbox.is_empty());
    }

    #[tokio::test]
    async fn expired_cursor_rescans_and_rebases() {
        let f = fixture(SyncConfig::default());
        let mut events = f.ctx.events.subscribe();
        remote_put(&f.provider, "t1", "one", 500);
        f.pull.pull_scope("threads").await.unwrap();

        remote_put(&f.provider, "t1", "one v2", 600);
        remote_put(&f.provider, "t2", "two", 700);
        f.provider.compact("acme", "threads", 3);
        local_put(&f.ctx, "t2", json!({"body": "local"}));

        let report = f.pull.pull_scope("threads").await.unwrap();
        assert_eq!(report.rescanned, vec!["threads".to_string()]);

        let store = f.ctx.store.lock();
        assert_eq!(store.get("threads", "t1").unwrap().data, json!({"title": "one v2"}));
        assert_eq!(
            store.get("threads", "t2").unwrap().data,
            json!({"title": "two", "body": "local"})
        );
        let pending: Vec<_> = store.state().outbox.iter().collect();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].base_version, Some(3));
        assert_eq!(store.state().cursors.cursor("threads").unwrap().token, "log:3");
        drop(store);

        let names: Vec<_> = std::iter::from_fn(|| events.try_recv().ok())
            .map(|e| e.name())
            .collect();
        assert!(names.contains(&"sync:rescan:started"));
        assert!(names.contains(&"sync:rescan:completed"));
    }

    #[tokio::test]
    async fn invalid_change_is_skipped_and_reported() {
        let f = fixture(SyncConfig::default());
        f.pull.pull_scope("threads").await.unwrap();
        let mut events = f.ctx.events.subscribe();
        f.provider.append_raw(
            "acme",
            RemoteChange {
                table: "threads".into(),
                key: "x".into(),
                kind: OpKind::Put,
                data: Some(json!("not an object")),
                version: 0,
                hlc: Hlc::new(400, 0, "dev-b"),
                device_id: "dev-b".into(),
                op_ids: Vec::new(),
                changed_at: 400,
            },
        );
        remote_put(&f.provider, "y", "valid", 500);

        let report = f.pull.pull_scope("threads").await.unwrap();
        assert_eq!(report.pulled, 1);
        assert_eq!(report.skipped, 1);

        let store = f.ctx.store.lock();
        assert!(store.get("threads", "x").is_none());
        assert_eq!(store.get("threads", "y").unwrap().data, json!({"title": "valid"}));
        assert_eq!(store.state().cursors.cursor("threads").unwrap().version, 2);
        drop(store);

        let notice = std::iter::from_fn(|| events.try_recv().ok())
            .find_map(|e| match e {
                SyncEvent::Error(notice) => Some(notice),
                _ => None,
            })
            .unwrap();
        assert_eq!(notice.code, ErrorCode::Validation);
        assert_eq!(notice.table.as_deref(), Some("threads"));

        let again = f.pull.pull_scope("threads").await.unwrap();
        assert_eq!(again.skipped, 0);
        assert_eq!(again.pulled, 0);
    }

    #[tokio::test]
    async fn rescan_respects_tombstones() {
        let f = fixture(SyncConfig::default());
        remote_put(&f.provider, "t1", "one", 500);
        f.pull.pull_scope("threads").await.unwrap();

        let now = f.ctx.now();
        f.ctx
            .store
            .lock()
            .transaction(Origin::Local, now, |tx| tx.delete("threads", "t1"))
            .unwrap();

        let rows = f.pull.rescan("threads").await.unwrap();
        assert_eq!(rows, 0);
        assert!(f.ctx.store.lock().get("threads", "t1").is_none());
    }

    #[tokio::test]
    async fn failed_rescan_leaves_table_untouched() {
        let f = fixture(SyncConfig::default());
        remote_put(&f.provider, "t1", "one", 500);
        f.pull.pull_scope("threads").await.unwrap();

        f.provider
            .fail_next(Call::Pull, ProviderError::from_status(500, "boom"), 1);
        assert!(f.pull.rescan("threads").await.is_err());
        assert!(f.ctx.store.lock().get("threads", "t1").is_some());
        assert_eq!(f.ctx.store.lock().state().cursors.cursor("threads").unwrap().version, 1);
    }

    #[test]
    fn replay_applies_pending_in_order() {
        let mut rows = Table::new();
        let hlc = Hlc::new(1, 0, "b");
        rows.insert(Record::new_remote("threads", "t1", json!({"title": "a"}), 1, 0, hlc));
        let stamp = |ts| {
            driftsync_engine::ChangeStamp::new("dev-a", OpId::new(), Hlc::new(ts, 0, "dev-a"))
        };
        let pending = vec![
            PendingOp::put(stamp(2), "threads", "t1", json!({"body": "x"}), None, 2),
            PendingOp::delete(stamp(3), "threads", "t1", None, 3),
            PendingOp::put(stamp(4), "threads", "t1", json!({"title": "new"}), None, 4),
        ];
        replay(&mut rows, &pending, 5);
        assert_eq!(rows.get("t1").unwrap().data, json!({"title": "new"}));
    }
}
