//! The engine facade hosts talk to.
//!
//! [`SyncEngine`] owns the shared [`SyncContext`] and the three background
//! loops. Local writes go through it so that every write is captured into
//! the outbox and wakes the push loop.

use driftsync_engine::{
    LocalStore, OpId, Origin, PendingOp, PolicySet, Record, Resolver, SyncRun, Transaction,
};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::auth::{AuthGate, Credential};
use crate::config::SyncConfig;
use crate::context::SyncContext;
use crate::error::{Result, SyncError};
use crate::events::SyncEvent;
use crate::gc::{GcManager, GcReport};
use crate::pull::{PullLoop, PullReport};
use crate::push::{PushLoop, PushReport};
use crate::registry::ProviderRegistry;
use crate::time::{SystemTime, TimeSource};

/// Host application visibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Foreground,
    /// Loops keep running with stretched intervals
    Background,
    /// Loops park until the host returns to the foreground
    Suspended,
}

/// Point-in-time view of the engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Health {
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unhealthy_reason: Option<String>,
    pub read_only: bool,
    pub auth_blocked: bool,
    pub visibility: Visibility,
    pub tenant: String,
    pub generation: u64,
    /// Ops waiting to be pushed (including those waiting on a retry delay)
    pub pending: usize,
    /// Ops parked in the `failed` state
    pub failed: usize,
    pub gc_breaker_open: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run: Option<SyncRun>,
}

/// Builder for [`SyncEngine`].
pub struct SyncEngineBuilder {
    config: SyncConfig,
    store: LocalStore,
    registry: Option<Arc<ProviderRegistry>>,
    policies: PolicySet,
    time: Arc<dyn TimeSource>,
}

impl SyncEngineBuilder {
    pub fn registry(mut self, registry: Arc<ProviderRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Per-table conflict policies. Tables without one use LWW.
    pub fn policies(mut self, policies: PolicySet) -> Self {
        self.policies = policies;
        self
    }

    pub fn time_source(mut self, time: Arc<dyn TimeSource>) -> Self {
        self.time = time;
        self
    }

    pub fn build(self) -> SyncEngine {
        let registry = self.registry.unwrap_or_else(ProviderRegistry::new_shared);
        let ctx = Arc::new(SyncContext::new(
            self.config,
            self.store,
            registry,
            Resolver::new(self.policies),
            self.time,
        ));
        SyncEngine::from_context(ctx)
    }
}

/// Offline-first sync engine.
///
/// Created stopped; [`SyncEngine::start`] spawns the push, pull and GC loops
/// on the current tokio runtime. Every operation can also be driven by hand
/// (`flush`, `pull_now`, `gc_now`) without starting the loops.
pub struct SyncEngine {
    ctx: Arc<SyncContext>,
    push: PushLoop,
    pull: PullLoop,
    gc: Arc<GcManager>,
    shutdown: CancellationToken,
    started: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("tenant", &self.ctx.tenant())
            .field("generation", &self.ctx.generation())
            .field("started", &self.started.load(Ordering::SeqCst))
            .finish()
    }
}

impl SyncEngine {
    pub fn builder(config: SyncConfig, store: LocalStore) -> SyncEngineBuilder {
        SyncEngineBuilder {
            config,
            store,
            registry: None,
            policies: PolicySet::new(),
            time: Arc::new(SystemTime),
        }
    }

    /// An engine with default conflict policies and the system clock.
    pub fn new(config: SyncConfig, store: LocalStore, registry: Arc<ProviderRegistry>) -> Self {
        Self::builder(config, store).registry(registry).build()
    }

    fn from_context(ctx: Arc<SyncContext>) -> Self {
        Self {
            push: PushLoop::new(Arc::clone(&ctx)),
            pull: PullLoop::new(Arc::clone(&ctx)),
            gc: Arc::new(GcManager::new(Arc::clone(&ctx))),
            shutdown: CancellationToken::new(),
            started: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
            ctx,
        }
    }

    /// Spawn the background loops.
    pub fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(SyncError::AlreadyRunning);
        }
        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(self.push.clone().run(self.shutdown.child_token())));
        tasks.push(tokio::spawn(self.pull.clone().run(self.shutdown.child_token())));
        tasks.push(tokio::spawn(Arc::clone(&self.gc).run(self.shutdown.child_token())));
        tracing::info!(
            tenant = %self.ctx.tenant(),
            device_id = %self.ctx.device_id(),
            "Sync engine started"
        );
        Ok(())
    }

    pub fn set_credential(&self, credential: Credential) {
        self.ctx.set_credential(credential);
    }

    pub fn auth(&self) -> &AuthGate {
        &self.ctx.auth
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.ctx.registry
    }

    pub fn config(&self) -> &SyncConfig {
        &self.ctx.config
    }

    pub fn events(&self) -> broadcast::Receiver<SyncEvent> {
        self.ctx.events.subscribe()
    }

    /// The local datastore. Hold the lock briefly; the loops share it.
    pub fn store(&self) -> &Arc<Mutex<LocalStore>> {
        &self.ctx.store
    }

    // ------------------------------------------------------------------
    // Local writes
    // ------------------------------------------------------------------

    /// Write `patch` into a row, capturing it for push.
    pub fn put(&self, table: &str, key: &str, patch: serde_json::Value) -> Result<OpId> {
        self.local_tx(|tx| tx.put(table, key, patch))
    }

    /// Delete a row, capturing a tombstone and a delete op.
    pub fn delete(&self, table: &str, key: &str) -> Result<OpId> {
        self.local_tx(|tx| tx.delete(table, key))
    }

    /// Write the caller's pick after a `sync:conflict` as an ordinary local
    /// put.
    pub fn resolve_conflict(
        &self,
        table: &str,
        key: &str,
        data: serde_json::Value,
    ) -> Result<OpId> {
        tracing::info!(table, key, "Conflict resolved by caller");
        self.put(table, key, data)
    }

    pub fn get(&self, table: &str, key: &str) -> Option<Record> {
        self.ctx.store.lock().get(table, key).cloned()
    }

    fn local_tx<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Transaction<'_>) -> driftsync_engine::error::Result<T>,
    {
        self.ctx.ensure_healthy()?;
        let now = self.ctx.now();
        let result = self.ctx.store.lock().transaction(Origin::Local, now, f);
        let value = result.map_err(|e| self.ctx.check_fatal(e.into()))?;
        self.ctx.local_write.notify_one();
        Ok(value)
    }

    // ------------------------------------------------------------------
    // Manual cycles
    // ------------------------------------------------------------------

    /// Push every pending op now, ignoring the debounce window.
    pub async fn flush(&self) -> Result<PushReport> {
        self.push.push_once(true).await
    }

    pub async fn pull_now(&self) -> Result<PullReport> {
        self.pull.pull_all().await
    }

    /// Rebuild one table from a full snapshot.
    pub async fn rescan(&self, table: &str) -> Result<usize> {
        self.pull.rescan(table).await
    }

    pub async fn gc_now(&self) -> Result<Vec<GcReport>> {
        self.gc.collect_all().await
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Switch visibility. Leaving the foreground flushes pending ops first.
    pub async fn set_visibility(&self, visibility: Visibility) {
        let previous = self.ctx.visibility();
        if previous == visibility {
            return;
        }
        if previous == Visibility::Foreground {
            match self.push.push_once(true).await {
                Ok(report) => tracing::debug!(
                    pushed = report.pushed,
                    "Final flush before leaving foreground"
                ),
                Err(err) => tracing::warn!(error = %err, "Final flush failed"),
            }
        }
        self.ctx.visibility.send_replace(visibility);
        tracing::info!(?previous, ?visibility, "Visibility changed");
        self.ctx.events.emit(SyncEvent::VisibilityChanged { visibility });
    }

    /// Move the engine to another tenant with its own local store.
    ///
    /// In-flight provider calls are cancelled; once the loops have let go
    /// (bounded by the cancellation deadline) the store is swapped and the
    /// previous one returned for the host to persist. On timeout nothing is
    /// switched.
    pub async fn switch_tenant(&self, tenant: &str, store: LocalStore) -> Result<LocalStore> {
        let from = self.ctx.tenant();
        self.ctx.cancel_in_flight();

        let idle = async {
            let push = self.ctx.push_lock.lock().await;
            let pull = self.ctx.pull_lock.lock().await;
            (push, pull)
        };
        let deadline = self.ctx.config.cancellation_deadline;
        let Ok(_idle) = tokio::time::timeout(deadline, idle).await else {
            tracing::warn!(
                from = %from,
                to = tenant,
                deadline_ms = deadline.as_millis() as u64,
                "In-flight sync work did not stop in time, tenant not switched"
            );
            return Err(SyncError::Timeout);
        };

        let generation = self.ctx.begin_scope(tenant);
        let previous = std::mem::replace(&mut *self.ctx.store.lock(), store);
        tracing::info!(from = %from, to = tenant, generation, "Tenant switched");

        self.ctx.scope_changed.notify_one();
        self.ctx.local_write.notify_one();
        Ok(previous)
    }

    pub fn health(&self) -> Health {
        let unhealthy_reason = self.ctx.unhealthy_reason();
        let store = self.ctx.store.lock();
        let state = store.state();
        Health {
            healthy: unhealthy_reason.is_none(),
            unhealthy_reason,
            read_only: state.read_only,
            auth_blocked: self.ctx.auth.is_blocked(),
            visibility: self.ctx.visibility(),
            tenant: self.ctx.tenant(),
            generation: self.ctx.generation(),
            pending: state.outbox.pending_count(),
            failed: state.outbox.failed().count(),
            gc_breaker_open: self.gc.breaker().is_open(),
            last_run: state.ledger.last_finished().cloned(),
        }
    }

    /// Leave the unhealthy state after the host repaired the store.
    ///
    /// The store is re-validated first; if it is still corrupt the engine
    /// stays unhealthy and the validation error is returned.
    pub fn restart(&self) -> Result<()> {
        let validation = {
            let store = self.ctx.store.lock();
            store.export_snapshot().validate(&store.state().schema)
        };
        if let Err(err) = validation {
            tracing::error!(error = %err, "Store still invalid, staying unhealthy");
            return Err(err.into());
        }
        if self.ctx.clear_unhealthy() {
            self.ctx.local_write.notify_one();
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Failed ops
    // ------------------------------------------------------------------

    pub fn failed_ops(&self) -> Vec<PendingOp> {
        self.ctx.store.lock().state().outbox.failed().cloned().collect()
    }

    /// Put a failed op back into the queue with the same op id.
    pub fn retry_failed(&self, id: &OpId) -> Result<()> {
        self.ctx.remote_tx(|tx| tx.state_mut().outbox.requeue(id))?;
        tracing::info!(op_id = %id, "Failed op requeued");
        self.ctx.local_write.notify_one();
        Ok(())
    }

    /// Drop a failed op for good.
    pub fn discard_failed(&self, id: &OpId) -> Result<PendingOp> {
        let op = self.ctx.remote_tx(|tx| {
            let outbox = &mut tx.state_mut().outbox;
            match outbox.get(id) {
                None => Err(driftsync_engine::Error::OpNotFound(*id)),
                Some(op) if !op.is_failed() => Err(driftsync_engine::Error::OpNotFailed(*id)),
                Some(_) => outbox
                    .remove(id)
                    .ok_or(driftsync_engine::Error::OpNotFound(*id)),
            }
        })?;
        tracing::info!(
            op_id = %id,
            table = %op.table,
            key = %op.primary_key,
            "Failed op discarded"
        );
        Ok(op)
    }

    /// Flush what is pending, stop the loops and wait for them to exit.
    pub async fn shutdown(&self) {
        if self.ctx.ensure_healthy().is_ok() {
            if let Err(err) = self.push.push_once(true).await {
                tracing::warn!(error = %err, "Final flush on shutdown failed");
            }
        }
        self.shutdown.cancel();
        self.ctx.cancel_in_flight();

        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for result in futures::future::join_all(tasks).await {
            if let Err(err) = result {
                tracing::error!(error = %err, "Sync loop panicked");
            }
        }
        tracing::info!("Sync engine stopped");
    }
}
