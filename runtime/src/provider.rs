//! The provider boundary.
//!
//! A [`Provider`] is the pluggable transport to one backend. The engine only
//! speaks to it through this trait; wire formats live in the implementation.
//! Optional operations answer [`Supported::Unsupported`] instead of failing,
//! so callers check [`Provider::capabilities`] and degrade gracefully.

use async_trait::async_trait;
use driftsync_engine::{
    Cursor, DeviceId, OpId, PrimaryKey, PushBatch, RemoteChange, TableName, Version,
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::auth::Credential;
use crate::error::ProviderError;
use crate::throttle::RateLimit;

pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// One sync scope: a table within a tenant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Scope {
    pub tenant: String,
    pub table: TableName,
}

impl Scope {
    pub fn new(tenant: impl Into<String>, table: impl Into<TableName>) -> Self {
        Self {
            tenant: tenant.into(),
            table: table.into(),
        }
    }

    /// Stable key for per-scope bookkeeping.
    pub fn key(&self) -> String {
        format!("{}/{}", self.tenant, self.table)
    }
}

/// Optional features a provider supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    /// Pushes change notifications to subscribers
    pub realtime: bool,
    /// Confirms tombstones as purgeable from replica checkpoints
    pub gc_tombstones: bool,
    /// Compacts the server change log
    pub gc_change_log: bool,
}

/// Outcome of an optional provider operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Supported<T> {
    Done(T),
    Unsupported,
}

impl<T> Supported<T> {
    pub fn is_supported(&self) -> bool {
        matches!(self, Supported::Done(_))
    }

    pub fn done(self) -> Option<T> {
        match self {
            Supported::Done(value) => Some(value),
            Supported::Unsupported => None,
        }
    }
}

/// One page of remote changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullResponse {
    pub changes: Vec<RemoteChange>,
    /// Where the next pull resumes
    pub next_cursor: Cursor,
    /// More changes are available right away
    pub has_more: bool,
}

/// A batch row the backend persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushAck {
    pub op_ids: Vec<OpId>,
    pub primary_key: PrimaryKey,
    /// Server version assigned to the row
    pub version: Version,
}

/// A batch row the backend refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushRejection {
    pub op_ids: Vec<OpId>,
    pub primary_key: PrimaryKey,
    pub error: RejectionReason,
}

/// Serializable form of a per-row rejection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectionReason {
    pub code: driftsync_engine::ErrorCode,
    pub message: String,
}

impl From<ProviderError> for RejectionReason {
    fn from(err: ProviderError) -> Self {
        Self {
            code: err.code,
            message: err.message,
        }
    }
}

/// Result of a push.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushResponse {
    pub acked: Vec<PushAck>,
    pub rejected: Vec<PushRejection>,
    /// Remaining-quota headers, if the backend sends them
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimit>,
}

/// Tombstone offered for purging.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GcCandidate {
    pub id: PrimaryKey,
    pub version: Option<Version>,
}

/// Realtime notice that a scope has new changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeNotice {
    pub tenant: String,
    pub table: TableName,
    pub version: Version,
}

/// Where realtime notices are delivered.
pub type ChangeSink = mpsc::UnboundedSender<ChangeNotice>;

/// Handle of a realtime subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(pub Uuid);

impl SubscriptionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

/// Transport to one backend.
///
/// Every request carries the caller's credential and scope; the backend,
/// not the client, is responsible for checking one against the other.
#[async_trait]
pub trait Provider: Send + Sync + std::fmt::Debug {
    /// Registry id of the provider.
    fn id(&self) -> &str;

    fn capabilities(&self) -> Capabilities;

    /// Deliver a [`ChangeNotice`] to `sink` whenever `scope` changes.
    async fn subscribe(
        &self,
        credential: &Credential,
        scope: &Scope,
        sink: ChangeSink,
    ) -> ProviderResult<Supported<SubscriptionId>>;

    async fn unsubscribe(&self, subscription: SubscriptionId) -> ProviderResult<()>;

    /// Changes after `cursor`, or a full snapshot when `cursor` is `None`.
    async fn pull(
        &self,
        credential: &Credential,
        scope: &Scope,
        cursor: Option<&Cursor>,
        limit: usize,
    ) -> ProviderResult<PullResponse>;

    /// Persist a batch. Op ids are idempotency keys: a row whose ops were
    /// already applied is acknowledged again without a second effect.
    async fn push(
        &self,
        credential: &Credential,
        scope: &Scope,
        device_id: &DeviceId,
        batch: &PushBatch,
    ) -> ProviderResult<PushResponse>;

    /// Record that `device_id` has applied `scope` up to `version`.
    async fn update_cursor(
        &self,
        credential: &Credential,
        scope: &Scope,
        device_id: &DeviceId,
        version: Version,
    ) -> ProviderResult<()>;

    /// Ids among `candidates` that every known replica has moved past.
    async fn gc_tombstones(
        &self,
        _credential: &Credential,
        _scope: &Scope,
        _candidates: &[GcCandidate],
    ) -> ProviderResult<Supported<Vec<PrimaryKey>>> {
        Ok(Supported::Unsupported)
    }

    /// Compact the change log up to `up_to`; returns removed entries.
    async fn gc_change_log(
        &self,
        _credential: &Credential,
        _scope: &Scope,
        _up_to: Version,
    ) -> ProviderResult<Supported<usize>> {
        Ok(Supported::Unsupported)
    }
}
