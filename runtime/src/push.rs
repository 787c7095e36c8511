//! The push loop: drains the outbox to the active provider.

use driftsync_engine::{
    coalesce, ErrorCode, OpId, OpKind, PrimaryKey, PushBatch, RunKind, SyncRun, Version,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::context::SyncContext;
use crate::error::{ProviderError, Result, SyncError};
use crate::events::{ErrorNotice, RetryNotice, SyncEvent};
use crate::provider::PushResponse;

/// Wait when the outbox is empty and nothing else wakes the loop.
const IDLE_WAIT: Duration = Duration::from_secs(60);

/// Outcome of one push cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushReport {
    pub batches: usize,
    /// Ops acknowledged by the backend
    pub pushed: usize,
    /// Ops moved to the `failed` state
    pub failed: usize,
    /// Ops waiting for a retry
    pub retrying: usize,
}

enum Flow {
    Continue,
    Stop,
    Abort(SyncError),
}

/// Sends pending ops in coalesced batches.
#[derive(Debug, Clone)]
pub struct PushLoop {
    ctx: Arc<SyncContext>,
}

impl PushLoop {
    pub fn new(ctx: Arc<SyncContext>) -> Self {
        Self { ctx }
    }

    /// Run one push cycle.
    ///
    /// `force` ignores the debounce window (flush on shutdown or
    /// backgrounding) but never a scheduled retry delay.
    pub async fn push_once(&self, force: bool) -> Result<PushReport> {
        let _cycle = self.ctx.push_lock.lock().await;
        self.ctx.ensure_healthy()?;

        let now = self.ctx.now();
        let max_batch = self.ctx.governor.batch_size(self.ctx.config.max_batch);
        let batches = {
            let store = self.ctx.store.lock();
            let eligible = store
                .state()
                .outbox
                .eligible(now, self.ctx.config.debounce_ms(), force);
            if eligible.is_empty() {
                return Ok(PushReport::default());
            }
            coalesce(&eligible, max_batch)
        }
        .map_err(|e| self.ctx.check_fatal(e.into()))?;

        let provider = self.ctx.provider()?;
        let credential = self.ctx.credential()?;
        let generation = self.ctx.generation();
        let token = self.ctx.scope_token();
        let device_id = self.ctx.device_id();

        let mut run = self.ctx.start_run(RunKind::Push, None)?;
        let mut report = PushReport::default();
        let mut outcome = Ok(());

        for (i, batch) in batches.iter().enumerate() {
            if i > 0 {
                if let Some(hold) = self.ctx.governor.hold() {
                    tracing::debug!(
                        hold_ms = hold.as_millis() as u64,
                        "Rate limit exhausted, holding"
                    );
                    tokio::select! {
                        _ = token.cancelled() => {
                            outcome = Err(SyncError::Cancelled);
                            break;
                        }
                        _ = tokio::time::sleep(hold) => {}
                    }
                }
            }

            let scope = self.ctx.scope(&batch.table);
            tracing::debug!(
                table = %batch.table,
                op_count = batch.op_ids().len(),
                generation,
                "Pushing batch"
            );
            let result = self
                .ctx
                .call(&token, provider.push(&credential, &scope, &device_id, batch))
                .await;
            if !self.ctx.is_current(generation) {
                tracing::debug!(generation, "Discarding push result from a previous scope");
                outcome = Err(SyncError::Cancelled);
                break;
            }
            report.batches += 1;

            let flow = match result {
                Ok(response) => self.apply_response(batch, response, &mut run, &mut report)?,
                Err(SyncError::Provider(err)) => {
                    self.handle_failure(batch, err, &mut run, &mut report)?
                }
                Err(err) => Flow::Abort(err),
            };
            match flow {
                Flow::Continue => {}
                Flow::Stop => break,
                Flow::Abort(err) => {
                    outcome = Err(err);
                    break;
                }
            }
        }

        self.ctx.finish_run(run);
        outcome.map(|()| report)
    }

    fn apply_response(
        &self,
        batch: &PushBatch,
        response: PushResponse,
        run: &mut SyncRun,
        report: &mut PushReport,
    ) -> Result<Flow> {
        self.ctx.governor.observe(response.rate_limit);

        let acked: Vec<OpId> = response
            .acked
            .iter()
            .flat_map(|ack| ack.op_ids.iter().copied())
            .collect();
        let deleted: Vec<(PrimaryKey, Version)> = response
            .acked
            .iter()
            .filter(|ack| {
                batch
                    .ops
                    .iter()
                    .any(|op| op.primary_key == ack.primary_key && op.kind == OpKind::Delete)
            })
            .map(|ack| (ack.primary_key.clone(), ack.version))
            .collect();
        let unanswered: Vec<OpId> = batch
            .op_ids()
            .into_iter()
            .filter(|id| {
                !acked.contains(id) && !response.rejected.iter().any(|r| r.op_ids.contains(id))
            })
            .collect();
        let schema_rejected = response
            .rejected
            .iter()
            .any(|r| r.error.code == ErrorCode::SchemaUnsupported);

        let table = batch.table.clone();
        self.ctx.remote_tx(|tx| {
            let state = tx.state_mut();
            state.outbox.acknowledge(&acked);
            for (key, version) in &deleted {
                state.tombstones.set_version(&table, key, *version);
            }
            for rejection in &response.rejected {
                state.outbox.mark_failed(
                    &rejection.op_ids,
                    rejection.error.code,
                    &rejection.error.message,
                );
            }
            if schema_rejected {
                state.read_only = true;
            }
            Ok(())
        })?;

        run.pushed += acked.len() as u32;
        report.pushed += acked.len();
        tracing::info!(table = %batch.table, op_count = acked.len(), "Batch acknowledged");

        for rejection in response.rejected {
            let code = rejection.error.code;
            tracing::warn!(
                table = %batch.table,
                key = %rejection.primary_key,
                %code,
                message = %rejection.error.message,
                "Push rejected, ops moved to failed"
            );
            run.record_error(code, rejection.error.message.clone());
            report.failed += rejection.op_ids.len();
            self.ctx.events.emit(SyncEvent::Error(ErrorNotice {
                table: Some(batch.table.clone()),
                op_ids: rejection.op_ids,
                code,
                message: rejection.error.message,
            }));
        }
        if schema_rejected {
            tracing::error!(
                table = %batch.table,
                "Backend does not support the local schema, local writes disabled"
            );
        }

        if !unanswered.is_empty() {
            let err = ProviderError::network("backend did not answer every batch row");
            self.retry(&batch.table, &unanswered, &err, run, report)?;
        }
        Ok(Flow::Continue)
    }

    fn handle_failure(
        &self,
        batch: &PushBatch,
        err: ProviderError,
        run: &mut SyncRun,
        report: &mut PushReport,
    ) -> Result<Flow> {
        let ids = batch.op_ids();
        match err.code {
            code if code.is_retriable() => {
                self.retry(&batch.table, &ids, &err, run, report)?;
                Ok(Flow::Stop)
            }
            ErrorCode::AuthExpired => {
                run.record_error(err.code, err.message.clone());
                self.ctx.auth_rejected(&err);
                Ok(Flow::Abort(SyncError::AuthBlocked))
            }
            code => {
                let read_only = code == ErrorCode::SchemaUnsupported;
                self.ctx.remote_tx(|tx| {
                    let state = tx.state_mut();
                    state.outbox.mark_failed(&ids, code, &err.message);
                    if read_only {
                        state.read_only = true;
                    }
                    Ok(())
                })?;
                tracing::warn!(
                    table = %batch.table,
                    op_count = ids.len(),
                    %code,
                    message = %err.message,
                    "Push failed terminally, ops moved to failed"
                );
                run.record_error(code, err.message.clone());
                report.failed += ids.len();
                self.ctx.events.emit(SyncEvent::Error(ErrorNotice {
                    table: Some(batch.table.clone()),
                    op_ids: ids,
                    code,
                    message: err.message,
                }));
                Ok(Flow::Continue)
            }
        }
    }

    /// Keep `ids` queued until their backoff delay has passed.
    fn retry(
        &self,
        table: &str,
        ids: &[OpId],
        err: &ProviderError,
        run: &mut SyncRun,
        report: &mut PushReport,
    ) -> Result<()> {
        let attempts = {
            let store = self.ctx.store.lock();
            let outbox = &store.state().outbox;
            ids.iter()
                .filter_map(|id| outbox.get(id).map(|op| op.attempts))
                .max()
                .unwrap_or(0)
        };
        let delay = self.ctx.retry_delay(err, attempts);
        let delay_ms = delay.as_millis() as u64;
        let not_before = self.ctx.now().saturating_add(delay_ms);
        self.ctx.remote_tx(|tx| {
            tx.state_mut().outbox.schedule_retry(ids, not_before);
            Ok(())
        })?;

        let attempt = attempts + 1;
        tracing::warn!(
            table,
            op_count = ids.len(),
            attempt,
            delay_ms,
            code = %err.code,
            "Push failed, retry scheduled"
        );
        run.record_error(err.code, err.message.clone());
        report.retrying += ids.len();
        self.ctx.events.emit(SyncEvent::Retry(RetryNotice {
            table: table.to_string(),
            op_ids: ids.to_vec(),
            attempt,
            delay_ms,
            code: err.code,
            message: err.message.clone(),
        }));
        Ok(())
    }

    /// Time until the next op becomes eligible, paced by rate limits and
    /// visibility.
    fn next_wait(&self) -> Duration {
        let now = self.ctx.now();
        let due = self
            .ctx
            .store
            .lock()
            .state()
            .outbox
            .next_due(self.ctx.config.debounce_ms());
        let wait = due.map_or(IDLE_WAIT, |t| Duration::from_millis(t.saturating_sub(now)));
        let wait = self.ctx.governor.pace(wait);
        let wait = match self.ctx.governor.hold() {
            Some(hold) => wait.max(hold),
            None => wait,
        };
        self.ctx.throttle(wait)
    }

    /// Push whenever ops become due until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) {
        tracing::info!("Push loop started");
        let mut visibility = self.ctx.visibility.subscribe();
        loop {
            if !self.ctx.wait_runnable(&shutdown).await {
                break;
            }

            let stalled = match self.push_once(false).await {
                Ok(report) => {
                    if report.batches > 0 {
                        tracing::debug!(
                            batches = report.batches,
                            pushed = report.pushed,
                            failed = report.failed,
                            retrying = report.retrying,
                            "Push cycle finished"
                        );
                    }
                    false
                }
                Err(
                    SyncError::AuthBlocked | SyncError::Cancelled | SyncError::Unhealthy(_),
                ) => false,
                Err(err) => {
                    tracing::warn!(error = %err, "Push cycle failed");
                    true
                }
            };

            let mut wait = self.next_wait();
            if stalled {
                wait = wait.max(self.ctx.config.backoff_delay(0));
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.ctx.local_write.notified() => {}
                _ = visibility.changed() => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
        tracing::info!("Push loop stopped");
    }
}
