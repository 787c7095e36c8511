//! The sync run ledger.
//!
//! Every push, pull, rescan and GC cycle opens a [`SyncRun`] when it starts
//! and finalizes it when it ends. The ledger is append-only apart from
//! retention trimming of the oldest runs.

use crate::{ErrorCode, TableName, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use uuid::Uuid;

/// Default number of runs kept.
pub const DEFAULT_LEDGER_RETENTION: usize = 200;

/// What a run did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunKind {
    Push,
    Pull,
    Rescan,
    Gc,
}

/// An error recorded against a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunError {
    pub code: ErrorCode,
    pub message: String,
}

/// Statistics of one sync cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRun {
    pub id: Uuid,
    pub kind: RunKind,
    /// Table the run was scoped to, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<TableName>,
    pub started_at: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<Timestamp>,
    pub pushed: u32,
    pub pulled: u32,
    pub conflicts: u32,
    /// Rows purged by GC
    #[serde(default)]
    pub purged: u32,
    /// Set when the cycle was skipped (e.g. GC without provider support)
    #[serde(default)]
    pub skipped: bool,
    pub errors: Vec<RunError>,
}

impl SyncRun {
    fn open(kind: RunKind, scope: Option<TableName>, now: Timestamp) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            scope,
            started_at: now,
            ended_at: None,
            pushed: 0,
            pulled: 0,
            conflicts: 0,
            purged: 0,
            skipped: false,
            errors: Vec::new(),
        }
    }

    pub fn record_error(&mut self, code: ErrorCode, message: impl Into<String>) {
        self.errors.push(RunError {
            code,
            message: message.into(),
        });
    }

    pub fn is_finished(&self) -> bool {
        self.ended_at.is_some()
    }
}

/// Bounded, ordered history of sync runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncLedger {
    retention: usize,
    runs: VecDeque<SyncRun>,
}

impl Default for SyncLedger {
    fn default() -> Self {
        Self::new(DEFAULT_LEDGER_RETENTION)
    }
}

impl SyncLedger {
    pub fn new(retention: usize) -> Self {
        Self {
            retention: retention.max(1),
            runs: VecDeque::new(),
        }
    }

    /// Open a run. The returned copy is filled in by the caller and handed
    /// back to [`SyncLedger::finish`].
    pub fn start(&mut self, kind: RunKind, scope: Option<TableName>, now: Timestamp) -> SyncRun {
        let run = SyncRun::open(kind, scope, now);
        self.runs.push_back(run.clone());
        self.trim(self.retention);
        run
    }

    /// Finalize a run with its statistics.
    pub fn finish(&mut self, mut run: SyncRun, now: Timestamp) {
        run.ended_at = Some(now.max(run.started_at));
        match self.runs.iter_mut().find(|r| r.id == run.id) {
            Some(slot) => *slot = run,
            None => {
                self.runs.push_back(run);
                self.trim(self.retention);
            }
        }
    }

    /// Most recent runs first.
    pub fn recent(&self, limit: usize) -> Vec<&SyncRun> {
        self.runs.iter().rev().take(limit).collect()
    }

    /// Most recently finished run.
    pub fn last_finished(&self) -> Option<&SyncRun> {
        self.runs.iter().rev().find(|r| r.is_finished())
    }

    /// Drop the oldest runs so at most `keep` remain.
    pub fn trim(&mut self, keep: usize) -> usize {
        let excess = self.runs.len().saturating_sub(keep);
        self.runs.drain(..excess);
        excess
    }

    pub fn set_retention(&mut self, retention: usize) {
        self.retention = retention.max(1);
        self.trim(self.retention);
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_and_finish() {
        let mut ledger = SyncLedger::default();
        let mut run = ledger.start(RunKind::Push, Some("threads".into()), 100);
        assert!(!ledger.recent(1)[0].is_finished());

        run.pushed = 3;
        run.record_error(ErrorCode::Network, "503");
        ledger.finish(run, 150);

        let last = ledger.last_finished().unwrap();
        assert_eq!(last.pushed, 3);
        assert_eq!(last.ended_at, Some(150));
        assert_eq!(last.errors[0].code, ErrorCode::Network);
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn retention_trims_oldest() {
        let mut ledger = SyncLedger::new(3);
        for i in 0..5 {
            let run = ledger.start(RunKind::Pull, None, i);
            ledger.finish(run, i + 1);
        }
        assert_eq!(ledger.len(), 3);
        let starts: Vec<_> = ledger.recent(10).iter().map(|r| r.started_at).collect();
        assert_eq!(starts, vec![4, 3, 2]);
    }

    #[test]
    fn finish_of_trimmed_run_is_still_recorded() {
        let mut ledger = SyncLedger::new(1);
        let early = ledger.start(RunKind::Gc, None, 0);
        let late = ledger.start(RunKind::Push, None, 1);
        ledger.finish(early, 5);
        ledger.finish(late, 6);
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger.last_finished().unwrap().kind, RunKind::Push);
    }

    #[test]
    fn explicit_trim() {
        let mut ledger = SyncLedger::default();
        for i in 0..4 {
            ledger.start(RunKind::Pull, None, i);
        }
        assert_eq!(ledger.trim(1), 3);
        assert_eq!(ledger.recent(5)[0].started_at, 3);
    }
}
