//! Tombstones: durable markers for deleted rows.
//!
//! A tombstone outlives the pending delete that created it. Once the delete is
//! acknowledged, the tombstone still guards the row against stale payloads
//! that would otherwise resurrect it, until garbage collection confirms no
//! replica can still send one.

use crate::{DeviceId, Hlc, PrimaryKey, TableName, Timestamp, Version};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A deleted row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tombstone {
    pub table: TableName,
    /// Primary key of the deleted row
    pub id: PrimaryKey,
    pub deleted_at: Timestamp,
    pub last_writer: DeviceId,
    pub hlc: Hlc,
    /// Server version of the delete, once known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<Version>,
}

impl Tombstone {
    pub fn new(
        table: impl Into<TableName>,
        id: impl Into<PrimaryKey>,
        deleted_at: Timestamp,
        last_writer: impl Into<DeviceId>,
        hlc: Hlc,
        version: Option<Version>,
    ) -> Self {
        Self {
            table: table.into(),
            id: id.into(),
            deleted_at,
            last_writer: last_writer.into(),
            hlc,
            version,
        }
    }

    /// Last-writer-wins between two tombstones for the same row.
    pub fn supersedes(&self, other: &Tombstone) -> bool {
        match (self.version, other.version) {
            (Some(a), Some(b)) if a != b => a > b,
            _ => (self.deleted_at, &self.hlc) > (other.deleted_at, &other.hlc),
        }
    }

    /// Whether an inbound payload for this row is older than the delete.
    ///
    /// Versions decide when both sides have one; otherwise the HLC does.
    pub fn guards(&self, incoming_version: Option<Version>, incoming_hlc: &Hlc) -> bool {
        match (self.version, incoming_version) {
            (Some(tomb), Some(incoming)) => incoming <= tomb,
            _ => incoming_hlc <= &self.hlc,
        }
    }
}

/// All tombstones, keyed by `(table, id)`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<Tombstone>", into = "Vec<Tombstone>")]
pub struct TombstoneStore {
    entries: BTreeMap<(TableName, PrimaryKey), Tombstone>,
}

impl From<Vec<Tombstone>> for TombstoneStore {
    fn from(list: Vec<Tombstone>) -> Self {
        let mut store = TombstoneStore::new();
        for t in list {
            store.upsert(t);
        }
        store
    }
}

impl From<TombstoneStore> for Vec<Tombstone> {
    fn from(store: TombstoneStore) -> Self {
        store.entries.into_values().collect()
    }
}

impl TombstoneStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a tombstone, last writer wins.
    ///
    /// Returns `true` if the stored tombstone changed.
    pub fn upsert(&mut self, tombstone: Tombstone) -> bool {
        let key = (tombstone.table.clone(), tombstone.id.clone());
        match self.entries.get(&key) {
            Some(existing) if !tombstone.supersedes(existing) => false,
            _ => {
                self.entries.insert(key, tombstone);
                true
            }
        }
    }

    pub fn get(&self, table: &str, id: &str) -> Option<&Tombstone> {
        self.entries.get(&(table.to_string(), id.to_string()))
    }

    /// Whether a tombstone drops an inbound payload for the row.
    pub fn guards(
        &self,
        table: &str,
        id: &str,
        incoming_version: Option<Version>,
        incoming_hlc: &Hlc,
    ) -> bool {
        self.get(table, id)
            .is_some_and(|t| t.guards(incoming_version, incoming_hlc))
    }

    /// Record the server version of an acknowledged delete.
    pub fn set_version(&mut self, table: &str, id: &str, version: Version) {
        if let Some(t) = self.entries.get_mut(&(table.to_string(), id.to_string())) {
            if t.version.map_or(true, |v| v < version) {
                t.version = Some(version);
            }
        }
    }

    /// Drop the tombstone of a row that has been legitimately recreated.
    pub fn remove(&mut self, table: &str, id: &str) -> Option<Tombstone> {
        self.entries.remove(&(table.to_string(), id.to_string()))
    }

    /// Tombstones of `table` past the retention window at `now`.
    pub fn expired(&self, table: &str, now: Timestamp, retention_ms: u64) -> Vec<&Tombstone> {
        self.entries
            .values()
            .filter(|t| t.table == table && t.deleted_at.saturating_add(retention_ms) <= now)
            .collect()
    }

    /// Remove the given rows' tombstones; returns how many were removed.
    pub fn purge(&mut self, table: &str, ids: &[PrimaryKey]) -> usize {
        ids.iter()
            .filter(|id| self.remove(table, id).is_some())
            .count()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Tombstone> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tomb(id: &str, deleted_at: u64, version: Option<u64>) -> Tombstone {
        Tombstone::new(
            "threads",
            id,
            deleted_at,
            "device-1",
            Hlc::new(deleted_at, 0, "device-1"),
            version,
        )
    }

    #[test]
    fn guards_older_versions() {
        let t = tomb("2", 1000, Some(5));
        assert!(t.guards(Some(3), &Hlc::new(9999, 0, "x")));
        assert!(t.guards(Some(5), &Hlc::new(9999, 0, "x")));
        assert!(!t.guards(Some(6), &Hlc::new(0, 0, "x")));
    }

    #[test]
    fn unversioned_tombstone_guards_by_hlc() {
        let t = tomb("2", 1000, None);
        assert!(t.guards(Some(3), &Hlc::new(900, 0, "x")));
        assert!(!t.guards(Some(3), &Hlc::new(1100, 0, "x")));
    }

    #[test]
    fn upsert_is_last_writer_wins() {
        let mut store = TombstoneStore::new();
        assert!(store.upsert(tomb("1", 1000, Some(5))));
        assert!(!store.upsert(tomb("1", 2000, Some(4))));
        assert_eq!(store.get("threads", "1").unwrap().version, Some(5));

        assert!(store.upsert(tomb("1", 500, Some(8))));
        assert_eq!(store.get("threads", "1").unwrap().version, Some(8));
    }

    #[test]
    fn set_version_only_moves_forward() {
        let mut store = TombstoneStore::new();
        store.upsert(tomb("1", 1000, None));
        store.set_version("threads", "1", 7);
        store.set_version("threads", "1", 3);
        assert_eq!(store.get("threads", "1").unwrap().version, Some(7));
    }

    #[test]
    fn expired_and_purge() {
        let mut store = TombstoneStore::new();
        store.upsert(tomb("old", 1_000, Some(1)));
        store.upsert(tomb("new", 9_000, Some(2)));

        let expired: Vec<_> = store
            .expired("threads", 10_000, 5_000)
            .into_iter()
            .map(|t| t.id.clone())
            .collect();
        assert_eq!(expired, vec!["old".to_string()]);

        assert_eq!(store.purge("threads", &expired), 1);
        assert_eq!(store.len(), 1);
        assert!(store.get("threads", "old").is_none());
    }
}
