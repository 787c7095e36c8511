//! Rows of the local business tables.

use crate::{Hlc, PrimaryKey, TableName, Timestamp, Version};
use serde::{Deserialize, Serialize};

/// Origin of a write.
///
/// Remote-origin writes are applied by the pull loop and are never captured
/// into the outbox again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    /// Created or modified by application code on this device
    Local,
    /// Received from the provider
    Remote,
}

/// Metadata associated with a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    /// When the record was first written here (milliseconds since epoch)
    pub created_at: Timestamp,
    /// When the record was last written here
    pub updated_at: Timestamp,
    /// Whether the last write was local or remote
    pub origin: Origin,
    /// HLC of the last write
    pub hlc: Hlc,
}

impl Metadata {
    pub fn new(timestamp: Timestamp, hlc: Hlc, origin: Origin) -> Self {
        Self {
            created_at: timestamp,
            updated_at: timestamp,
            origin,
            hlc,
        }
    }

    /// Update metadata for a modification.
    pub fn touch(&mut self, timestamp: Timestamp, hlc: Hlc, origin: Origin) {
        self.updated_at = timestamp;
        self.hlc = hlc;
        self.origin = origin;
    }
}

/// A row in a business table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    pub table: TableName,
    pub key: PrimaryKey,
    /// Last server version applied to this row
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<Version>,
    /// Row contents (JSON object)
    pub data: serde_json::Value,
    pub metadata: Metadata,
}

impl Record {
    /// A row first written locally.
    pub fn new_local(
        table: impl Into<TableName>,
        key: impl Into<PrimaryKey>,
        data: serde_json::Value,
        timestamp: Timestamp,
        hlc: Hlc,
    ) -> Self {
        Self {
            table: table.into(),
            key: key.into(),
            version: None,
            data,
            metadata: Metadata::new(timestamp, hlc, Origin::Local),
        }
    }

    /// A row received from the provider.
    pub fn new_remote(
        table: impl Into<TableName>,
        key: impl Into<PrimaryKey>,
        data: serde_json::Value,
        version: Version,
        timestamp: Timestamp,
        hlc: Hlc,
    ) -> Self {
        Self {
            table: table.into(),
            key: key.into(),
            version: Some(version),
            data,
            metadata: Metadata::new(timestamp, hlc, Origin::Remote),
        }
    }

    /// Shallow-merge `patch` into the row.
    pub fn apply_patch(
        &mut self,
        patch: &serde_json::Map<String, serde_json::Value>,
        timestamp: Timestamp,
        hlc: Hlc,
        origin: Origin,
    ) {
        match self.data.as_object_mut() {
            Some(fields) => {
                for (k, v) in patch {
                    fields.insert(k.clone(), v.clone());
                }
            }
            None => self.data = serde_json::Value::Object(patch.clone()),
        }
        self.metadata.touch(timestamp, hlc, origin);
    }

    /// Replace the row contents wholesale.
    pub fn replace(
        &mut self,
        data: serde_json::Value,
        version: Option<Version>,
        timestamp: Timestamp,
        hlc: Hlc,
        origin: Origin,
    ) {
        self.data = data;
        if version.is_some() {
            self.version = version;
        }
        self.metadata.touch(timestamp, hlc, origin);
    }

    /// Raise the last applied server version.
    pub fn confirm(&mut self, version: Version) {
        if self.version.map_or(true, |v| v < version) {
            self.version = Some(version);
        }
    }
}
