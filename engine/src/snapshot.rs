//! Snapshot types for persisting and restoring store state.
//!
//! Snapshots are the bridge between the in-memory store and persistent
//! storage. Records, outbox, tombstones, cursors, ledger and clock travel
//! together so a restored store resumes exactly where it stopped.

use crate::{
    error::Result, CursorStore, DeviceId, Error, HybridClock, OpKind, Outbox, PendingOp,
    PrimaryKey, Record, Schema, SchemaVersion, StoreState, SyncLedger, Table, TableName,
    TombstoneStore,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Version of the snapshot format for future compatibility.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// A point-in-time snapshot of the store state.
///
/// Uses BTreeMap instead of HashMap for deterministic serialization order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreSnapshot {
    pub format_version: u32,
    pub schema_version: SchemaVersion,
    pub node_id: DeviceId,
    pub clock: HybridClock,
    /// All records by table, then by primary key
    pub tables: BTreeMap<TableName, BTreeMap<PrimaryKey, Record>>,
    /// Pending ops in capture order
    pub outbox: Vec<PendingOp>,
    pub tombstones: TombstoneStore,
    pub cursors: CursorStore,
    pub ledger: SyncLedger,
    #[serde(default)]
    pub read_only: bool,
}

impl StoreSnapshot {
    /// Create a new empty snapshot.
    pub fn new(schema_version: SchemaVersion, node_id: impl Into<DeviceId>) -> Self {
        let node_id = node_id.into();
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            schema_version,
            clock: HybridClock::new(node_id.clone()),
            node_id,
            tables: BTreeMap::new(),
            outbox: Vec::new(),
            tombstones: TombstoneStore::new(),
            cursors: CursorStore::new(),
            ledger: SyncLedger::default(),
            read_only: false,
        }
    }

    pub(crate) fn from_state(state: &StoreState) -> Self {
        let mut snapshot = Self::new(state.schema.version, state.node_id.clone());
        snapshot.clock = state.clock.clone();
        for table in state.tables.values() {
            for record in table.iter() {
                snapshot.add_record(record.clone());
            }
        }
        snapshot.outbox = state.outbox.iter().cloned().collect();
        snapshot.tombstones = state.tombstones.clone();
        snapshot.cursors = state.cursors.clone();
        snapshot.ledger = state.ledger.clone();
        snapshot.read_only = state.read_only;
        snapshot
    }

    pub(crate) fn into_state(self, schema: Schema) -> StoreState {
        let mut state = StoreState::new(schema, self.node_id);
        state.clock = self.clock;
        for (name, records) in self.tables {
            state.tables.insert(name, records.into_values().collect::<Table>());
        }
        state.outbox = Outbox::from(self.outbox);
        state.tombstones = self.tombstones;
        state.cursors = self.cursors;
        state.ledger = self.ledger;
        state.read_only = self.read_only;
        state
    }

    pub fn add_record(&mut self, record: Record) {
        self.tables
            .entry(record.table.clone())
            .or_default()
            .insert(record.key.clone(), record);
    }

    pub fn get_record(&self, table: &str, key: &str) -> Option<&Record> {
        self.tables.get(table)?.get(key)
    }

    pub fn record_count(&self) -> usize {
        self.tables.values().map(|t| t.len()).sum()
    }

    /// Validate the snapshot against a schema.
    ///
    /// Every outbox record is checked; a malformed one is reported as
    /// [`Error::CorruptRecord`].
    pub fn validate(&self, schema: &Schema) -> Result<()> {
        if self.schema_version != schema.version {
            return Err(Error::SchemaVersionMismatch {
                expected: schema.version,
                actual: self.schema_version,
            });
        }

        for (table, records) in &self.tables {
            if let Some(table_schema) = schema.table(table) {
                for record in records.values() {
                    table_schema.validate_row(&record.data)?;
                }
            } else if !schema.tables.is_empty() {
                return Err(Error::TableNotFound(table.clone()));
            }
        }

        let mut seen = std::collections::HashSet::new();
        for op in &self.outbox {
            if !seen.insert(op.id()) {
                return Err(Error::CorruptRecord(format!("duplicate op id {}", op.id())));
            }
            let patch_ok = match op.kind {
                OpKind::Put => op.patch.as_ref().is_some_and(|p| p.is_object()),
                OpKind::Delete => op.patch.is_none(),
            };
            if !patch_ok || op.table.is_empty() || op.primary_key.is_empty() {
                return Err(Error::CorruptRecord(format!(
                    "malformed pending op {} on {}/{}",
                    op.id(),
                    op.table,
                    op.primary_key
                )));
            }
        }

        Ok(())
    }

    /// Serialize to JSON with deterministic ordering.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    /// Deserialize from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        let snapshot: Self =
            serde_json::from_str(json).map_err(|e| Error::InvalidSnapshot(e.to_string()))?;

        if snapshot.format_version > SNAPSHOT_FORMAT_VERSION {
            return Err(Error::InvalidSnapshot(format!(
                "unsupported snapshot format version: {} (max supported: {})",
                snapshot.format_version, SNAPSHOT_FORMAT_VERSION
            )));
        }

        Ok(snapshot)
    }
}

/// Metadata about a snapshot (without the full data).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotMetadata {
    pub format_version: u32,
    pub schema_version: SchemaVersion,
    pub node_id: DeviceId,
    pub record_count: usize,
    pub pending_count: usize,
    pub tombstone_count: usize,
}

impl From<&StoreSnapshot> for SnapshotMetadata {
    fn from(snapshot: &StoreSnapshot) -> Self {
        Self {
            format_version: snapshot.format_version,
            schema_version: snapshot.schema_version,
            node_id: snapshot.node_id.clone(),
            record_count: snapshot.record_count(),
            pending_count: snapshot.outbox.len(),
            tombstone_count: snapshot.tombstones.len(),
        }
    }
}
