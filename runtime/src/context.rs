//! State shared by the sync loops and the engine facade.

use driftsync_engine::{
    DeviceId, LocalStore, Origin, Resolver, RunKind, SyncRun, TableName, Timestamp, Transaction,
};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio_util::sync::CancellationToken;

use crate::auth::{AuthGate, Credential};
use crate::config::SyncConfig;
use crate::engine::Visibility;
use crate::error::{ProviderError, Result, SyncError};
use crate::events::{EventBus, SyncEvent};
use crate::provider::{Provider, ProviderResult, Scope};
use crate::registry::ProviderRegistry;
use crate::throttle::RateGovernor;
use crate::time::TimeSource;

/// Everything the loops share. Held behind an `Arc`.
#[derive(Debug)]
pub struct SyncContext {
    pub config: SyncConfig,
    pub store: Arc<Mutex<LocalStore>>,
    pub registry: Arc<ProviderRegistry>,
    pub events: EventBus,
    pub auth: Arc<AuthGate>,
    pub time: Arc<dyn TimeSource>,
    pub resolver: Resolver,
    pub governor: RateGovernor,
    tenant: RwLock<String>,
    generation: AtomicU64,
    scope_token: Mutex<CancellationToken>,
    unhealthy: Mutex<Option<String>>,
    /// Woken on every local write
    pub local_write: Notify,
    /// Woken when the engine becomes healthy again
    pub health_changed: Notify,
    /// Woken after a tenant switch swapped the store
    pub scope_changed: Notify,
    pub visibility: watch::Sender<Visibility>,
    /// Serializes push cycles
    pub push_lock: tokio::sync::Mutex<()>,
    /// Serializes pull and rescan cycles
    pub pull_lock: tokio::sync::Mutex<()>,
}

impl SyncContext {
    pub fn new(
        config: SyncConfig,
        store: LocalStore,
        registry: Arc<ProviderRegistry>,
        resolver: Resolver,
        time: Arc<dyn TimeSource>,
    ) -> Self {
        let (visibility, _) = watch::channel(Visibility::Foreground);
        Self {
            tenant: RwLock::new(config.tenant.clone()),
            events: EventBus::new(config.event_capacity),
            governor: RateGovernor::new(config.rate_limit_threshold),
            store: Arc::new(Mutex::new(store)),
            registry,
            auth: Arc::new(AuthGate::new()),
            time,
            resolver,
            generation: AtomicU64::new(0),
            scope_token: Mutex::new(CancellationToken::new()),
            unhealthy: Mutex::new(None),
            local_write: Notify::new(),
            health_changed: Notify::new(),
            scope_changed: Notify::new(),
            visibility,
            push_lock: tokio::sync::Mutex::new(()),
            pull_lock: tokio::sync::Mutex::new(()),
            config,
        }
    }

    pub fn now(&self) -> Timestamp {
        self.time.now_ms()
    }

    pub fn device_id(&self) -> DeviceId {
        self.store.lock().node_id().clone()
    }

    pub fn tenant(&self) -> String {
        self.tenant.read().clone()
    }

    pub fn scope(&self, table: &str) -> Scope {
        Scope::new(self.tenant(), table)
    }

    /// Tables to sync: the schema's, or whatever the store holds when the
    /// schema declares none.
    pub fn tables(&self) -> Vec<TableName> {
        let store = self.store.lock();
        let state = store.state();
        if state.schema.tables.is_empty() {
            state.table_names().cloned().collect()
        } else {
            state.schema.tables.keys().cloned().collect()
        }
    }

    pub fn provider(&self) -> Result<Arc<dyn Provider>> {
        self.registry.active()
    }

    // ------------------------------------------------------------------
    // Scope generation
    // ------------------------------------------------------------------

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.generation() == generation
    }

    /// Token cancelled when the current scope is torn down.
    pub fn scope_token(&self) -> CancellationToken {
        self.scope_token.lock().clone()
    }

    /// Cancel every provider call awaiting on the current token.
    pub fn cancel_in_flight(&self) {
        let old = std::mem::replace(&mut *self.scope_token.lock(), CancellationToken::new());
        old.cancel();
    }

    /// Tear down the current scope: cancel its in-flight calls and start a
    /// new generation. Returns the new generation.
    pub fn begin_scope(&self, tenant: &str) -> u64 {
        self.cancel_in_flight();
        *self.tenant.write() = tenant.to_string();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::info!(tenant, generation, "Sync scope switched");
        generation
    }

    /// Await a provider call unless the scope is torn down first.
    pub async fn call<T, F>(&self, token: &CancellationToken, call: F) -> Result<T>
    where
        F: Future<Output = ProviderResult<T>>,
    {
        tokio::select! {
            biased;
            _ = token.cancelled() => Err(SyncError::Cancelled),
            result = call => result.map_err(SyncError::from),
        }
    }

    // ------------------------------------------------------------------
    // Health
    // ------------------------------------------------------------------

    pub fn ensure_healthy(&self) -> Result<()> {
        match self.unhealthy.lock().as_ref() {
            Some(reason) => Err(SyncError::Unhealthy(reason.clone())),
            None => Ok(()),
        }
    }

    pub fn unhealthy_reason(&self) -> Option<String> {
        self.unhealthy.lock().clone()
    }

    /// Halt the automatic loops until [`SyncContext::clear_unhealthy`].
    pub fn mark_unhealthy(&self, reason: impl Into<String>) {
        let reason = reason.into();
        {
            let mut slot = self.unhealthy.lock();
            if slot.is_some() {
                return;
            }
            *slot = Some(reason.clone());
        }
        tracing::error!(%reason, "Sync engine unhealthy, automatic sync halted");
        self.events.emit(SyncEvent::Unhealthy { reason });
    }

    pub fn clear_unhealthy(&self) -> bool {
        let cleared = self.unhealthy.lock().take().is_some();
        if cleared {
            tracing::info!("Sync engine healthy again");
            self.health_changed.notify_waiters();
        }
        cleared
    }

    /// Turn a fatal engine error into the unhealthy state, passing it on.
    pub fn check_fatal(&self, err: SyncError) -> SyncError {
        if err.is_fatal() {
            self.mark_unhealthy(err.to_string());
        }
        err
    }

    // ------------------------------------------------------------------
    // Auth
    // ------------------------------------------------------------------

    /// The credential for the next provider call.
    ///
    /// Emits `sync:auth:blocked` on the transition into the blocked state.
    pub fn credential(&self) -> Result<Credential> {
        let was_blocked = self.auth.is_blocked();
        if let Some(credential) = self.auth.current(self.now()) {
            return Ok(credential);
        }
        if !was_blocked {
            let reason = if self.auth.is_blocked() {
                "credential expired"
            } else {
                self.auth.block("no credential");
                "no credential"
            };
            self.events.emit(SyncEvent::AuthBlocked {
                reason: reason.to_string(),
            });
        }
        Err(SyncError::AuthBlocked)
    }

    /// The backend refused the credential.
    pub fn auth_rejected(&self, err: &ProviderError) {
        if self.auth.block(&err.message) {
            self.events.emit(SyncEvent::AuthBlocked {
                reason: err.message.clone(),
            });
        }
    }

    /// Install a fresh credential, resuming blocked loops.
    pub fn set_credential(&self, credential: Credential) {
        if self.auth.set(credential) {
            self.events.emit(SyncEvent::AuthResumed);
        }
    }

    // ------------------------------------------------------------------
    // Store access
    // ------------------------------------------------------------------

    /// Run a sync-bookkeeping transaction (remote origin, never captured).
    pub fn remote_tx<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Transaction<'_>) -> driftsync_engine::error::Result<T>,
    {
        let now = self.now();
        let result = self.store.lock().transaction(Origin::Remote, now, f);
        result.map_err(|e| self.check_fatal(e.into()))
    }

    pub fn start_run(&self, kind: RunKind, table: Option<&str>) -> Result<SyncRun> {
        let now = self.now();
        let table = table.map(str::to_string);
        self.remote_tx(|tx| Ok(tx.state_mut().ledger.start(kind, table, now)))
    }

    /// Finalize a run in the ledger and publish it as `sync:stats`.
    pub fn finish_run(&self, mut run: SyncRun) {
        let now = self.now();
        run.ended_at = Some(now.max(run.started_at));
        let retention = self.config.ledger_retention;
        let finished = run.clone();
        let result = self.remote_tx(|tx| {
            let ledger = &mut tx.state_mut().ledger;
            ledger.finish(finished, now);
            ledger.trim(retention);
            Ok(())
        });
        if let Err(err) = result {
            tracing::warn!(error = %err, "Failed to record sync run");
        }
        self.events.emit(SyncEvent::Stats(Box::new(run)));
    }

    // ------------------------------------------------------------------
    // Pacing
    // ------------------------------------------------------------------

    /// Delay before retrying after `err`, given the op's earlier failures.
    ///
    /// A server-specified delay is used as-is; the backoff schedule gets
    /// jitter.
    pub fn retry_delay(&self, err: &ProviderError, attempts: u32) -> Duration {
        if let Some(ms) = err.retry_after_ms {
            return Duration::from_millis(ms);
        }
        self.jittered(self.config.backoff_delay(attempts))
    }

    pub fn jittered(&self, delay: Duration) -> Duration {
        let ratio = self.config.jitter_ratio;
        if ratio <= 0.0 {
            return delay;
        }
        let factor = rand::thread_rng().gen_range((1.0 - ratio)..=(1.0 + ratio));
        delay.mul_f64(factor.max(0.0))
    }

    pub fn visibility(&self) -> Visibility {
        *self.visibility.borrow()
    }

    /// Stretch a loop wait for the current visibility.
    pub fn throttle(&self, wait: Duration) -> Duration {
        match self.visibility() {
            Visibility::Foreground => wait,
            Visibility::Background | Visibility::Suspended => {
                wait.saturating_mul(self.config.background_throttle.max(1))
            }
        }
    }

    /// Wait until the loops may run: healthy, not suspended, and not blocked
    /// on auth. Returns `false` if `shutdown` fired first.
    pub async fn wait_runnable(&self, shutdown: &CancellationToken) -> bool {
        let mut visibility = self.visibility.subscribe();
        let mut credential = self.auth.watch();
        loop {
            if shutdown.is_cancelled() {
                return false;
            }
            let healthy = self.ensure_healthy().is_ok();
            let awake = *visibility.borrow_and_update() != Visibility::Suspended;
            let authorized = !self.auth.is_blocked();
            if healthy && awake && authorized {
                return true;
            }
            tokio::select! {
                _ = shutdown.cancelled() => return false,
                _ = self.health_changed.notified() => {}
                _ = visibility.changed() => {}
                _ = credential.changed() => {}
            }
        }
    }
}
