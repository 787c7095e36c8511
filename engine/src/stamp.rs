//! Change stamps: the identity of one causal event.

use crate::{DeviceId, Hlc, Version};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Globally unique operation id, also used as the idempotency key.
///
/// An `OpId` is generated once when a mutation is captured and reused on
/// every re-send of the same logical operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OpId(Uuid);

impl OpId {
    /// Generate a fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing uuid.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// The underlying uuid.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for OpId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for OpId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Identifies a causal event.
///
/// `hlc` orders concurrent local events until the server assigns a version;
/// once `server_version` is present it is authoritative.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeStamp {
    pub device_id: DeviceId,
    pub op_id: OpId,
    pub hlc: Hlc,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_version: Option<Version>,
}

impl ChangeStamp {
    /// Stamp a new local event.
    pub fn new(device_id: impl Into<DeviceId>, op_id: OpId, hlc: Hlc) -> Self {
        Self {
            device_id: device_id.into(),
            op_id,
            hlc,
            server_version: None,
        }
    }

    /// Record the version the server assigned.
    pub fn confirmed(mut self, version: Version) -> Self {
        self.server_version = Some(version);
        self
    }

    /// Whether `self` supersedes `other`.
    ///
    /// Server versions decide when both sides have one, otherwise the HLC does.
    pub fn supersedes(&self, other: &ChangeStamp) -> bool {
        match (self.server_version, other.server_version) {
            (Some(a), Some(b)) if a != b => a > b,
            _ => self.hlc > other.hlc,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn op_ids_are_unique() {
        assert_ne!(OpId::new(), OpId::new());
    }

    #[test]
    fn op_id_string_roundtrip() {
        let id = OpId::new();
        let parsed: OpId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn server_version_beats_hlc() {
        let older_hlc = ChangeStamp::new("a", OpId::new(), Hlc::new(1, 0, "a")).confirmed(9);
        let newer_hlc = ChangeStamp::new("b", OpId::new(), Hlc::new(5, 0, "b")).confirmed(3);
        assert!(older_hlc.supersedes(&newer_hlc));
        assert!(!newer_hlc.supersedes(&older_hlc));
    }

    #[test]
    fn hlc_decides_without_server_version() {
        let a = ChangeStamp::new("a", OpId::new(), Hlc::new(1, 0, "a"));
        let b = ChangeStamp::new("b", OpId::new(), Hlc::new(2, 0, "b")).confirmed(4);
        assert!(b.supersedes(&a));
        assert!(!a.supersedes(&b));
    }

    #[test]
    fn serialization_format() {
        let stamp = ChangeStamp::new("device-1", OpId::new(), Hlc::new(1, 0, "device-1"));
        let json = serde_json::to_string(&stamp).unwrap();
        assert!(json.contains("deviceId"));
        assert!(json.contains("opId"));
        assert!(!json.contains("serverVersion"));
    }
}
