//! Pending operations: durable, not-yet-confirmed local mutations.
//!
//! Changes are recorded as operations, never as bare mutations. A pending op
//! lives in the outbox from the moment its local write commits until the
//! provider acknowledges it or it is judged permanently non-retriable.

use crate::{ChangeStamp, ErrorCode, OpId, PrimaryKey, TableName, Timestamp, Version};
use serde::{Deserialize, Serialize};

/// What a pending op does to its row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpKind {
    Put,
    Delete,
}

/// Delivery state of a pending op.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum OpStatus {
    /// Waiting to be pushed (or waiting for its retry delay)
    #[default]
    Pending,
    /// Rejected with a terminal error; kept until the caller acts on it
    Failed { code: ErrorCode, message: String },
}

/// One durable local mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingOp {
    /// Identity of the event (op id, device, hlc)
    pub stamp: ChangeStamp,
    /// Target table
    pub table: TableName,
    /// Target row
    pub primary_key: PrimaryKey,
    /// Put or delete
    pub kind: OpKind,
    /// Fields written by a put (JSON object)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch: Option<serde_json::Value>,
    /// Server version the local write was based on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_version: Option<Version>,
    /// Capture time (milliseconds since epoch)
    pub created_at: Timestamp,
    #[serde(default)]
    pub status: OpStatus,
    /// Number of failed send attempts so far
    #[serde(default)]
    pub attempts: u32,
    /// Earliest time the op may be re-sent after a retriable failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_before: Option<Timestamp>,
}

impl PendingOp {
    /// Create a put.
    pub fn put(
        stamp: ChangeStamp,
        table: impl Into<TableName>,
        primary_key: impl Into<PrimaryKey>,
        patch: serde_json::Value,
        base_version: Option<Version>,
        created_at: Timestamp,
    ) -> Self {
        Self {
            stamp,
            table: table.into(),
            primary_key: primary_key.into(),
            kind: OpKind::Put,
            patch: Some(patch),
            base_version,
            created_at,
            status: OpStatus::Pending,
            attempts: 0,
            not_before: None,
        }
    }

    /// Create a delete.
    pub fn delete(
        stamp: ChangeStamp,
        table: impl Into<TableName>,
        primary_key: impl Into<PrimaryKey>,
        base_version: Option<Version>,
        created_at: Timestamp,
    ) -> Self {
        Self {
            stamp,
            table: table.into(),
            primary_key: primary_key.into(),
            kind: OpKind::Delete,
            patch: None,
            base_version,
            created_at,
            status: OpStatus::Pending,
            attempts: 0,
            not_before: None,
        }
    }

    /// The idempotency key.
    pub fn id(&self) -> OpId {
        self.stamp.op_id
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.status, OpStatus::Failed { .. })
    }

    /// Whether the op may be sent at `now`.
    ///
    /// A forced flush ignores the debounce window but never a retry delay.
    pub fn is_eligible(&self, now: Timestamp, debounce_ms: u64, force: bool) -> bool {
        if self.is_failed() {
            return false;
        }
        if self.not_before.is_some_and(|t| now < t) {
            return false;
        }
        force || self.attempts > 0 || now.saturating_sub(self.created_at) >= debounce_ms
    }
}
