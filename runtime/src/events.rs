//! Typed sync events.
//!
//! Every event the engine emits is a variant of [`SyncEvent`]; subscribers
//! get their own [`broadcast::Receiver`]. A slow subscriber lags and loses
//! the oldest events, the loops never block on it.

use driftsync_engine::{Conflict, ErrorCode, OpId, SyncRun, TableName};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::engine::Visibility;

/// A retriable failure that will be retried after `delay_ms`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryNotice {
    pub table: TableName,
    pub op_ids: Vec<OpId>,
    /// Failed attempts so far, including this one
    pub attempt: u32,
    pub delay_ms: u64,
    pub code: ErrorCode,
    pub message: String,
}

/// A terminal failure.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorNotice {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table: Option<TableName>,
    /// Ops left in the `failed` state (empty for pull errors)
    pub op_ids: Vec<OpId>,
    pub code: ErrorCode,
    pub message: String,
}

/// Events emitted by the engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "payload")]
pub enum SyncEvent {
    #[serde(rename = "sync:conflict")]
    Conflict(Box<Conflict>),
    #[serde(rename = "sync:retry")]
    Retry(RetryNotice),
    #[serde(rename = "sync:error")]
    Error(ErrorNotice),
    #[serde(rename = "sync:rescan:started")]
    RescanStarted { table: TableName },
    #[serde(rename = "sync:rescan:completed")]
    RescanCompleted { table: TableName, rows: usize },
    #[serde(rename = "sync:rescan:failed")]
    RescanFailed {
        table: TableName,
        code: ErrorCode,
        message: String,
    },
    #[serde(rename = "sync:stats")]
    Stats(Box<SyncRun>),
    #[serde(rename = "sync:auth:blocked")]
    AuthBlocked { reason: String },
    #[serde(rename = "sync:auth:resumed")]
    AuthResumed,
    #[serde(rename = "sync:visibility")]
    VisibilityChanged { visibility: Visibility },
    #[serde(rename = "sync:unhealthy")]
    Unhealthy { reason: String },
}

impl SyncEvent {
    /// Wire name of the event kind.
    pub fn name(&self) -> &'static str {
        match self {
            SyncEvent::Conflict(_) => "sync:conflict",
            SyncEvent::Retry(_) => "sync:retry",
            SyncEvent::Error(_) => "sync:error",
            SyncEvent::RescanStarted { .. } => "sync:rescan:started",
            SyncEvent::RescanCompleted { .. } => "sync:rescan:completed",
            SyncEvent::RescanFailed { .. } => "sync:rescan:failed",
            SyncEvent::Stats(_) => "sync:stats",
            SyncEvent::AuthBlocked { .. } => "sync:auth:blocked",
            SyncEvent::AuthResumed => "sync:auth:resumed",
            SyncEvent::VisibilityChanged { .. } => "sync:visibility",
            SyncEvent::Unhealthy { .. } => "sync:unhealthy",
        }
    }
}

/// Publish/subscribe hub for [`SyncEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SyncEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event. Returns the number of subscribers that got it.
    pub fn emit(&self, event: SyncEvent) -> usize {
        let name = event.name();
        match self.sender.send(event) {
            Ok(receivers) => {
                tracing::trace!(event = name, receivers, "Emitted sync event");
                receivers
            }
            Err(_) => 0,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emit_reaches_every_subscriber() {
        let bus = EventBus::new(8);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        let sent = bus.emit(SyncEvent::AuthResumed);
        assert_eq!(sent, 2);
        assert_eq!(a.try_recv().unwrap(), SyncEvent::AuthResumed);
        assert_eq!(b.try_recv().unwrap(), SyncEvent::AuthResumed);
    }

    #[test]
    fn emit_without_subscribers_is_fine() {
        let bus = EventBus::new(8);
        assert_eq!(bus.emit(SyncEvent::AuthResumed), 0);
    }

    #[test]
    fn serializes_with_wire_name() {
        let event = SyncEvent::RescanStarted {
            table: "threads".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "sync:rescan:started");
        assert_eq!(json["payload"]["table"], "threads");
        assert_eq!(event.name(), "sync:rescan:started");
    }
}
