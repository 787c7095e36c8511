//! Tombstone and change-log garbage collection.
//!
//! Tombstones past the retention window are purged only when the provider
//! confirms every known replica has moved past their version. Without that
//! capability the purge is skipped and recorded as skipped. Repeated
//! provider failures open a circuit breaker that suspends remote GC calls
//! for a cooldown.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use driftsync_engine::{PrimaryKey, RunKind, SyncRun, TableName, Timestamp};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::context::SyncContext;
use crate::error::{Result, SyncError};
use crate::provider::{GcCandidate, Scope, Supported};

/// Suspends calls after repeated failures.
///
/// Closed until `threshold` consecutive failures, then open for `cooldown`.
/// After the cooldown one trial call is let through (half-open): success
/// closes the breaker, failure opens it again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreaker {
    threshold: u32,
    cooldown_ms: u64,
    failures: u32,
    opened_at: Option<Timestamp>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            cooldown_ms: cooldown.as_millis() as u64,
            failures: 0,
            opened_at: None,
        }
    }

    /// Whether a call may go through at `now`.
    pub fn allow(&self, now: Timestamp) -> bool {
        match self.opened_at {
            None => true,
            Some(at) => now >= at.saturating_add(self.cooldown_ms),
        }
    }

    pub fn is_open(&self) -> bool {
        self.opened_at.is_some()
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Returns `true` if this closed an open breaker.
    pub fn record_success(&mut self) -> bool {
        self.failures = 0;
        self.opened_at.take().is_some()
    }

    /// Returns `true` if this opened the breaker.
    pub fn record_failure(&mut self, now: Timestamp) -> bool {
        self.failures = self.failures.saturating_add(1);
        if self.failures < self.threshold {
            return false;
        }
        let newly = self.opened_at.is_none();
        self.opened_at = Some(now);
        newly
    }
}

/// Why a GC cycle did not run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Another cycle for the same table is running
    InFlight,
    BreakerOpen,
    /// The provider cannot confirm replica checkpoints
    Unsupported,
}

/// Outcome of one GC cycle for a table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcReport {
    pub table: TableName,
    pub expired: usize,
    pub purged: usize,
    /// Change-log entries compacted by the provider
    pub compacted: usize,
    pub skipped: Option<SkipReason>,
}

/// Removes its table from the in-flight set when dropped.
struct InFlight<'a> {
    set: &'a DashMap<Scope, ()>,
    scope: Scope,
}

impl<'a> InFlight<'a> {
    fn acquire(set: &'a DashMap<Scope, ()>, scope: &Scope) -> Option<Self> {
        match set.entry(scope.clone()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                slot.insert(());
                Some(Self {
                    set,
                    scope: scope.clone(),
                })
            }
        }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set.remove(&self.scope);
    }
}

/// Periodic tombstone and change-log collection.
#[derive(Debug)]
pub struct GcManager {
    ctx: Arc<SyncContext>,
    breaker: Mutex<CircuitBreaker>,
    in_flight: DashMap<Scope, ()>,
}

impl GcManager {
    pub fn new(ctx: Arc<SyncContext>) -> Self {
        let breaker =
            CircuitBreaker::new(ctx.config.breaker_threshold, ctx.config.breaker_cooldown);
        Self {
            ctx,
            breaker: Mutex::new(breaker),
            in_flight: DashMap::new(),
        }
    }

    pub fn breaker(&self) -> CircuitBreaker {
        self.breaker.lock().clone()
    }

    /// Collect every synced table.
    pub async fn collect_all(&self) -> Result<Vec<GcReport>> {
        let mut reports = Vec::new();
        for table in self.ctx.tables() {
            reports.push(self.collect_scope(&table).await?);
        }
        Ok(reports)
    }

    /// Run one GC cycle for `table`.
    pub async fn collect_scope(&self, table: &str) -> Result<GcReport> {
        let mut report = GcReport {
            table: table.to_string(),
            ..GcReport::default()
        };
        let generation = self.ctx.generation();
        let scope = self.ctx.scope(table);
        let Some(_guard) = InFlight::acquire(&self.in_flight, &scope) else {
            tracing::debug!(scope = %scope.key(), "GC already running for scope");
            report.skipped = Some(SkipReason::InFlight);
            return Ok(report);
        };
        self.ctx.ensure_healthy()?;

        let mut run = self.ctx.start_run(RunKind::Gc, Some(table))?;
        if !self.breaker.lock().allow(self.ctx.now()) {
            tracing::info!(table, "GC skipped, circuit breaker open");
            report.skipped = Some(SkipReason::BreakerOpen);
            run.skipped = true;
            self.ctx.finish_run(run);
            return Ok(report);
        }

        let result = self.collect(&scope, generation, &mut run, &mut report).await;
        match &result {
            Ok(()) => {
                if self.breaker.lock().record_success() {
                    tracing::info!(table, "GC circuit breaker closed");
                }
            }
            Err(SyncError::Provider(err)) => {
                run.record_error(err.code, err.message.clone());
                let opened = self.breaker.lock().record_failure(self.ctx.now());
                if opened {
                    tracing::warn!(
                        table,
                        cooldown_secs = self.ctx.config.breaker_cooldown.as_secs(),
                        "GC circuit breaker opened"
                    );
                } else {
                    tracing::warn!(
                        table,
                        code = %err.code,
                        message = %err.message,
                        "GC call failed"
                    );
                }
            }
            Err(_) => {}
        }
        run.purged = report.purged as u32;
        self.ctx.finish_run(run);
        result.map(|()| report)
    }

    async fn collect(
        &self,
        scope: &Scope,
        generation: u64,
        run: &mut SyncRun,
        report: &mut GcReport,
    ) -> Result<()> {
        let table = scope.table.as_str();
        let provider = self.ctx.provider()?;
        let capabilities = provider.capabilities();
        let now = self.ctx.now();
        let candidates: Vec<GcCandidate> = self
            .ctx
            .store
            .lock()
            .state()
            .tombstones
            .expired(table, now, self.ctx.config.retention_ms())
            .into_iter()
            .map(|t| GcCandidate {
                id: t.id.clone(),
                version: t.version,
            })
            .collect();
        report.expired = candidates.len();

        if !capabilities.gc_tombstones {
            if !candidates.is_empty() {
                tracing::info!(
                    table,
                    expired = candidates.len(),
                    provider = provider.id(),
                    "Provider cannot confirm replica checkpoints, tombstone purge skipped"
                );
            }
            report.skipped = Some(SkipReason::Unsupported);
            run.skipped = true;
        }
        if candidates.is_empty() && !capabilities.gc_change_log {
            return Ok(());
        }

        let credential = self.ctx.credential()?;
        let token = self.ctx.scope_token();

        if capabilities.gc_tombstones && !candidates.is_empty() {
            let confirmed = self
                .ctx
                .call(&token, provider.gc_tombstones(&credential, scope, &candidates))
                .await?;
            if !self.ctx.is_current(generation) {
                return Err(SyncError::Cancelled);
            }
            match confirmed {
                Supported::Done(ids) => {
                    let ids: Vec<PrimaryKey> = ids
                        .into_iter()
                        .filter(|id| candidates.iter().any(|c| &c.id == id))
                        .collect();
                    let purged = self
                        .ctx
                        .remote_tx(|tx| Ok(tx.state_mut().tombstones.purge(table, &ids)))?;
                    report.purged = purged;
                    tracing::info!(table, expired = candidates.len(), purged, "Tombstones purged");
                }
                Supported::Unsupported => {
                    report.skipped = Some(SkipReason::Unsupported);
                    run.skipped = true;
                }
            }
        }

        if capabilities.gc_change_log {
            let up_to = self
                .ctx
                .store
                .lock()
                .state()
                .cursors
                .cursor(table)
                .map(|c| c.version);
            if let Some(up_to) = up_to {
                let compacted = self
                    .ctx
                    .call(&token, provider.gc_change_log(&credential, scope, up_to))
                    .await?;
                if let Supported::Done(entries) = compacted {
                    report.compacted = entries;
                    tracing::debug!(table, up_to, entries, "Change log compacted");
                }
            }
        }
        Ok(())
    }

    /// Collect once at startup, then on the GC interval, until `shutdown`.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        tracing::info!(interval_secs = self.ctx.config.gc_interval.as_secs(), "GC manager started");
        loop {
            if !self.ctx.wait_runnable(&shutdown).await {
                break;
            }
            if let Err(err) = self.collect_all().await {
                tracing::debug!(error = %err, "GC cycle stopped early");
            }

            let interval = self.ctx.config.gc_interval;
            let wait = if self.breaker.lock().is_open() {
                interval.saturating_mul(2).max(self.ctx.config.breaker_cooldown)
            } else {
                interval
            };
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.ctx.throttle(wait)) => {}
            }
        }
        tracing::info!("GC manager stopped");
    }
}
