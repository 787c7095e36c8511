//! LocalStore - the transactional in-memory datastore.
//!
//! The store holds the business tables together with the sync engine's own
//! state (outbox, tombstones, cursors, ledger). Every write goes through
//! [`LocalStore::transaction`]: row writes land in place and are journaled,
//! registered [`MutationHook`]s observe each mutation inside the same
//! transaction, and a failed transaction replays the journal backwards and
//! restores the sync state saved when it began.

use crate::{
    error::Result, CursorStore, DeviceId, Error, Hlc, HybridClock, OpId, Origin, Outbox,
    PrimaryKey, Record, Schema, SyncLedger, TableName, Timestamp, TombstoneStore, Version,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Rows of one business table, ordered by primary key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Table {
    records: BTreeMap<PrimaryKey, Record>,
}

impl Table {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Record> {
        self.records.get(key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut Record> {
        self.records.get_mut(key)
    }

    pub fn insert(&mut self, record: Record) -> Option<Record> {
        self.records.insert(record.key.clone(), record)
    }

    pub fn remove(&mut self, key: &str) -> Option<Record> {
        self.records.remove(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Record> {
        self.records.values()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl FromIterator<Record> for Table {
    fn from_iter<I: IntoIterator<Item = Record>>(iter: I) -> Self {
        let mut table = Table::new();
        for record in iter {
            table.insert(record);
        }
        table
    }
}

/// Everything the store persists.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreState {
    pub node_id: DeviceId,
    pub clock: HybridClock,
    pub schema: Schema,
    /// Row writes go through [`Transaction`] so they can be rolled back
    pub(crate) tables: BTreeMap<TableName, Table>,
    pub outbox: Outbox,
    pub tombstones: TombstoneStore,
    pub cursors: CursorStore,
    pub ledger: SyncLedger,
    /// Set after the backend reports an unsupported schema; local writes
    /// are refused until cleared
    pub read_only: bool,
}

impl StoreState {
    pub fn new(schema: Schema, node_id: impl Into<DeviceId>) -> Self {
        let node_id = node_id.into();
        let tables = schema
            .tables
            .keys()
            .map(|name| (name.clone(), Table::new()))
            .collect();
        Self {
            clock: HybridClock::new(node_id.clone()),
            node_id,
            schema,
            tables,
            outbox: Outbox::new(),
            tombstones: TombstoneStore::new(),
            cursors: CursorStore::new(),
            ledger: SyncLedger::default(),
            read_only: false,
        }
    }

    pub fn get(&self, table: &str, key: &str) -> Option<&Record> {
        self.tables.get(table).and_then(|t| t.get(key))
    }

    /// Rows of a table in key order.
    pub fn records(&self, table: &str) -> Vec<&Record> {
        self.tables
            .get(table)
            .map(|t| t.iter().collect())
            .unwrap_or_default()
    }

    pub fn record_count(&self) -> usize {
        self.tables.values().map(Table::len).sum()
    }

    /// Names of the tables holding rows, in order.
    pub fn table_names(&self) -> impl Iterator<Item = &TableName> {
        self.tables.keys()
    }

    /// Everything except the business rows.
    fn without_tables(&self) -> StoreState {
        StoreState {
            node_id: self.node_id.clone(),
            clock: self.clock.clone(),
            schema: self.schema.clone(),
            tables: BTreeMap::new(),
            outbox: self.outbox.clone(),
            tombstones: self.tombstones.clone(),
            cursors: self.cursors.clone(),
            ledger: self.ledger.clone(),
            read_only: self.read_only,
        }
    }

    pub(crate) fn table_mut(&mut self, table: &str) -> &mut Table {
        self.tables.entry(table.to_string()).or_default()
    }
}

/// Kind of row mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationKind {
    Put,
    Delete,
}

/// One row mutation, as observed by hooks.
#[derive(Debug, Clone, PartialEq)]
pub struct Mutation {
    /// Event id; Change Capture uses it as the op id
    pub op_id: OpId,
    pub table: TableName,
    pub key: PrimaryKey,
    pub kind: MutationKind,
    /// Fields written by a put
    pub patch: Option<serde_json::Value>,
    /// Row contents before the mutation
    pub previous: Option<Record>,
    pub hlc: Hlc,
    pub origin: Origin,
    pub now: Timestamp,
}

/// Changelog-style observer of row mutations.
///
/// Hooks run inside the writing transaction. An error aborts the whole
/// transaction, including the row write that triggered it.
pub trait MutationHook: Send + Sync {
    fn on_mutation(&self, state: &mut StoreState, mutation: &Mutation) -> Result<()>;
}

/// How to undo one row-level write.
enum Undo {
    Row {
        table: TableName,
        key: PrimaryKey,
        previous: Option<Record>,
    },
    Table {
        table: TableName,
        previous: Option<Table>,
    },
    Created(TableName),
}

fn rollback(tables: &mut BTreeMap<TableName, Table>, journal: Vec<Undo>) {
    for undo in journal.into_iter().rev() {
        match undo {
            Undo::Row {
                table,
                previous: Some(record),
                ..
            } => {
                tables.entry(table).or_default().insert(record);
            }
            Undo::Row {
                table,
                key,
                previous: None,
            } => {
                if let Some(rows) = tables.get_mut(&table) {
                    rows.remove(&key);
                }
            }
            Undo::Table {
                table,
                previous: Some(rows),
            } => {
                tables.insert(table, rows);
            }
            Undo::Table {
                table,
                previous: None,
            }
            | Undo::Created(table) => {
                tables.remove(&table);
            }
        }
    }
}

/// A write transaction on the store state.
pub struct Transaction<'a> {
    state: &'a mut StoreState,
    hooks: &'a [Arc<dyn MutationHook>],
    journal: Vec<Undo>,
    origin: Origin,
    now: Timestamp,
}

impl<'a> Transaction<'a> {
    pub fn origin(&self) -> Origin {
        self.origin
    }

    pub fn now(&self) -> Timestamp {
        self.now
    }

    pub fn get(&self, table: &str, key: &str) -> Option<&Record> {
        self.state.get(table, key)
    }

    pub fn state(&self) -> &StoreState {
        self.state
    }

    /// Direct access to the sync tables (outbox, tombstones, cursors, ledger).
    pub fn state_mut(&mut self) -> &mut StoreState {
        self.state
    }

    fn check_writable(&self) -> Result<()> {
        if self.origin == Origin::Local && self.state.read_only {
            return Err(Error::ReadOnly);
        }
        Ok(())
    }

    /// Journal the current contents of a row before it is written.
    fn journal_row(&mut self, table: &str, key: &str) {
        if !self.state.tables.contains_key(table) {
            self.journal.push(Undo::Created(table.to_string()));
        }
        self.journal.push(Undo::Row {
            table: table.to_string(),
            key: key.to_string(),
            previous: self.state.get(table, key).cloned(),
        });
    }

    fn notify(&mut self, mutation: Mutation) -> Result<()> {
        for hook in self.hooks {
            hook.on_mutation(self.state, &mutation)?;
        }
        Ok(())
    }

    /// Shallow-merge `patch` into a row, creating it if needed.
    pub fn put(&mut self, table: &str, key: &str, patch: serde_json::Value) -> Result<OpId> {
        self.check_writable()?;
        let fields = patch
            .as_object()
            .ok_or_else(|| Error::InvalidPayload("patch must be an object".into()))?;

        let hlc = self.state.clock.tick(self.now);
        let previous = self.state.get(table, key).cloned();
        let (now, origin) = (self.now, self.origin);
        self.journal_row(table, key);

        let rows = self.state.table_mut(table);
        match rows.get_mut(key) {
            Some(record) => record.apply_patch(fields, now, hlc.clone(), origin),
            None => {
                let mut record = Record::new_local(table, key, patch.clone(), now, hlc.clone());
                record.metadata.origin = origin;
                rows.insert(record);
            }
        }

        let op_id = OpId::new();
        self.notify(Mutation {
            op_id,
            table: table.to_string(),
            key: key.to_string(),
            kind: MutationKind::Put,
            patch: Some(patch),
            previous,
            hlc,
            origin,
            now,
        })?;
        Ok(op_id)
    }

    /// Delete a row. Deleting a row that is not present locally is still
    /// recorded, since it may exist remotely.
    pub fn delete(&mut self, table: &str, key: &str) -> Result<OpId> {
        self.check_writable()?;
        let hlc = self.state.clock.tick(self.now);
        self.journal_row(table, key);
        let previous = self.state.table_mut(table).remove(key);

        let op_id = OpId::new();
        self.notify(Mutation {
            op_id,
            table: table.to_string(),
            key: key.to_string(),
            kind: MutationKind::Delete,
            patch: None,
            previous,
            hlc,
            origin: self.origin,
            now: self.now,
        })?;
        Ok(op_id)
    }

    /// Replace a row wholesale (used when applying resolved remote state).
    pub fn write_record(&mut self, record: Record) -> Result<()> {
        self.check_writable()?;
        self.state.clock.observe(&record.metadata.hlc, self.now);
        self.journal_row(&record.table, &record.key);
        let previous = self.state.table_mut(&record.table).insert(record.clone());
        self.notify(Mutation {
            op_id: OpId::new(),
            table: record.table,
            key: record.key,
            kind: MutationKind::Put,
            patch: Some(record.data),
            previous,
            hlc: record.metadata.hlc,
            origin: self.origin,
            now: self.now,
        })
    }

    /// Remove a row without capturing a new delete (remote deletes).
    pub fn remove_record(&mut self, table: &str, key: &str, hlc: &Hlc) -> Result<Option<Record>> {
        self.check_writable()?;
        self.state.clock.observe(hlc, self.now);
        self.journal_row(table, key);
        let previous = self.state.table_mut(table).remove(key);
        self.notify(Mutation {
            op_id: OpId::new(),
            table: table.to_string(),
            key: key.to_string(),
            kind: MutationKind::Delete,
            patch: None,
            previous: previous.clone(),
            hlc: hlc.clone(),
            origin: self.origin,
            now: self.now,
        })?;
        Ok(previous)
    }

    /// Swap in a complete table, as rebuilt by a rescan.
    ///
    /// Hooks are not notified; the swap is a bulk remote-origin write.
    pub fn replace_table(&mut self, table: &str, rows: Table) -> Table {
        let previous = self.state.tables.insert(table.to_string(), rows);
        self.journal.push(Undo::Table {
            table: table.to_string(),
            previous: previous.clone(),
        });
        previous.unwrap_or_default()
    }

    /// Mark a row as persisted by the backend at `version`.
    ///
    /// Returns `false` when the row is not present.
    pub fn confirm_record(&mut self, table: &str, key: &str, version: Version) -> bool {
        if self.state.get(table, key).is_none() {
            return false;
        }
        self.journal_row(table, key);
        match self.state.table_mut(table).get_mut(key) {
            Some(record) => {
                record.confirm(version);
                true
            }
            None => false,
        }
    }
}

/// The transactional local datastore.
#[derive(Clone)]
pub struct LocalStore {
    state: StoreState,
    hooks: Vec<Arc<dyn MutationHook>>,
}

impl std::fmt::Debug for LocalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalStore")
            .field("state", &self.state)
            .field("hooks", &self.hooks.len())
            .finish()
    }
}

impl LocalStore {
    /// Create a store without any hooks.
    pub fn new(schema: Schema, node_id: impl Into<DeviceId>) -> Self {
        Self {
            state: StoreState::new(schema, node_id),
            hooks: Vec::new(),
        }
    }

    /// Create a store whose local writes are captured into the outbox.
    pub fn with_capture(schema: Schema, node_id: impl Into<DeviceId>) -> Self {
        let mut store = Self::new(schema, node_id);
        store.add_hook(Arc::new(crate::ChangeCapture));
        store
    }

    /// Register a mutation hook.
    pub fn add_hook(&mut self, hook: Arc<dyn MutationHook>) {
        self.hooks.push(hook);
    }

    pub fn node_id(&self) -> &DeviceId {
        &self.state.node_id
    }

    pub fn state(&self) -> &StoreState {
        &self.state
    }

    pub fn get(&self, table: &str, key: &str) -> Option<&Record> {
        self.state.get(table, key)
    }

    pub fn records(&self, table: &str) -> Vec<&Record> {
        self.state.records(table)
    }

    /// Run `f` as one atomic transaction.
    ///
    /// Writes and hook side effects become visible together when `f` returns
    /// `Ok`; on any error the store is left as it was. Only the sync state is
    /// copied up front; rows are restored from the transaction's journal.
    pub fn transaction<T, F>(&mut self, origin: Origin, now: Timestamp, f: F) -> Result<T>
    where
        F: FnOnce(&mut Transaction<'_>) -> Result<T>,
    {
        let saved = self.state.without_tables();
        let mut tx = Transaction {
            state: &mut self.state,
            hooks: &self.hooks,
            journal: Vec::new(),
            origin,
            now,
        };
        match f(&mut tx) {
            Ok(value) => Ok(value),
            Err(err) => {
                let journal = std::mem::take(&mut tx.journal);
                let mut tables = std::mem::take(&mut self.state.tables);
                rollback(&mut tables, journal);
                self.state = saved;
                self.state.tables = tables;
                Err(err)
            }
        }
    }

    /// Export the current state as a snapshot.
    pub fn export_snapshot(&self) -> crate::StoreSnapshot {
        crate::StoreSnapshot::from_state(&self.state)
    }

    /// Replace the current state with a validated snapshot.
    ///
    /// The snapshot must belong to this node and match the schema version.
    /// Hooks are kept.
    pub fn import_snapshot(&mut self, snapshot: crate::StoreSnapshot) -> Result<()> {
        snapshot.validate(&self.state.schema)?;
        if snapshot.node_id != self.state.node_id {
            return Err(Error::InvalidSnapshot(format!(
                "node ID mismatch: expected '{}', got '{}'",
                self.state.node_id, snapshot.node_id
            )));
        }
        self.state = snapshot.into_state(self.state.schema.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FieldDef, FieldType, TableSchema};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_schema() -> Schema {
        Schema::new(1).with_table(TableSchema::new(
            "threads",
            vec![
                FieldDef::required("title", FieldType::String),
                FieldDef::optional("replies", FieldType::Int),
            ],
        ))
    }

    struct Counter(AtomicUsize);

    impl MutationHook for Counter {
        fn on_mutation(&self, _state: &mut StoreState, _mutation: &Mutation) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Reject;

    impl MutationHook for Reject {
        fn on_mutation(&self, _state: &mut StoreState, _mutation: &Mutation) -> Result<()> {
            Err(Error::CaptureFailed("rejected".into()))
        }
    }

    #[test]
    fn create_store() {
        let store = LocalStore::new(test_schema(), "device-1");
        assert_eq!(store.node_id(), "device-1");
        assert!(store.state().tables.contains_key("threads"));
        assert!(store.records("threads").is_empty());
    }

    #[test]
    fn put_then_patch() {
        let mut store = LocalStore::new(test_schema(), "device-1");
        store
            .transaction(Origin::Local, 1000, |tx| {
                tx.put("threads", "t-1", json!({"title": "a"}))
            })
            .unwrap();
        store
            .transaction(Origin::Local, 2000, |tx| {
                tx.put("threads", "t-1", json!({"replies": 2}))
            })
            .unwrap();

        let record = store.get("threads", "t-1").unwrap();
        assert_eq!(record.data, json!({"title": "a", "replies": 2}));
        assert_eq!(record.metadata.created_at, 1000);
        assert_eq!(record.metadata.hlc.timestamp, 2000);
    }

    #[test]
    fn hooks_observe_each_mutation() {
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        let mut store = LocalStore::new(test_schema(), "device-1");
        store.add_hook(counter.clone());

        store
            .transaction(Origin::Local, 1000, |tx| {
                tx.put("threads", "a", json!({"title": "a"}))?;
                tx.put("threads", "b", json!({"title": "b"}))?;
                tx.delete("threads", "a")
            })
            .unwrap();
        assert_eq!(counter.0.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn hook_failure_rolls_back_the_write() {
        let mut store = LocalStore::new(test_schema(), "device-1");
        store.add_hook(Arc::new(Reject));

        let result = store.transaction(Origin::Local, 1000, |tx| {
            tx.put("threads", "a", json!({"title": "a"}))
        });
        assert!(matches!(result, Err(Error::CaptureFailed(_))));
        assert!(store.get("threads", "a").is_none());
        assert_eq!(store.state().clock.last().timestamp, 0);
    }

    #[test]
    fn closure_error_rolls_back_earlier_writes() {
        let mut store = LocalStore::new(test_schema(), "device-1");
        let result: Result<()> = store.transaction(Origin::Local, 1000, |tx| {
            tx.put("threads", "a", json!({"title": "a"}))?;
            Err(Error::InvalidPayload("later failure".into()))
        });
        assert!(result.is_err());
        assert!(store.records("threads").is_empty());
    }

    #[test]
    fn failed_transaction_restores_every_row_write() {
        let mut store = LocalStore::with_capture(test_schema(), "device-1");
        store
            .transaction(Origin::Local, 1000, |tx| {
                tx.put("threads", "a", json!({"title": "a"}))?;
                tx.put("threads", "b", json!({"title": "b", "replies": 1}))?;
                Ok(())
            })
            .unwrap();
        let before = store.state().clone();

        let result: Result<()> = store.transaction(Origin::Remote, 2000, |tx| {
            tx.put("threads", "a", json!({"replies": 3}))?;
            tx.put("threads", "a", json!({"title": "a2"}))?;
            tx.delete("threads", "b")?;
            tx.put("threads", "c", json!({"title": "c"}))?;
            tx.confirm_record("threads", "a", 9);
            let hlc = Hlc::new(3000, 0, "s");
            tx.write_record(Record::new_remote("notes", "n", json!({}), 1, 2000, hlc))?;
            tx.replace_table("threads", Table::new());
            tx.state_mut().read_only = true;
            Err(Error::InvalidPayload("later failure".into()))
        });

        assert!(result.is_err());
        assert_eq!(store.state(), &before);
        assert!(store.state().table_names().all(|name| name == "threads"));
    }

    #[test]
    fn read_only_refuses_local_writes_only() {
        let mut store = LocalStore::new(test_schema(), "device-1");
        store
            .transaction(Origin::Remote, 0, |tx| {
                tx.state_mut().read_only = true;
                Ok(())
            })
            .unwrap();

        let local = store.transaction(Origin::Local, 1, |tx| {
            tx.put("threads", "a", json!({"title": "a"}))
        });
        assert!(matches!(local, Err(Error::ReadOnly)));

        let hlc = Hlc::new(1, 0, "s");
        let remote = Record::new_remote("threads", "b", json!({"title": "b"}), 1, 1, hlc);
        store
            .transaction(Origin::Remote, 1, |tx| tx.write_record(remote))
            .unwrap();
        assert!(store.get("threads", "b").is_some());
    }

    #[test]
    fn write_record_advances_clock_past_remote() {
        let mut store = LocalStore::new(test_schema(), "device-1");
        let hlc = Hlc::new(9000, 4, "s");
        let remote = Record::new_remote("threads", "b", json!({"title": "b"}), 1, 0, hlc);
        store
            .transaction(Origin::Remote, 100, |tx| tx.write_record(remote))
            .unwrap();
        assert!(store.state().clock.last() >= &Hlc::new(9000, 4, "device-1"));
    }

    #[test]
    fn replace_table_swaps_rows() {
        let mut store = LocalStore::new(test_schema(), "device-1");
        store
            .transaction(Origin::Local, 1, |tx| {
                tx.put("threads", "old", json!({"title": "x"}))
            })
            .unwrap();

        let fresh: Table = vec![Record::new_remote(
            "threads",
            "new",
            json!({"title": "y"}),
            5,
            2,
            Hlc::new(2, 0, "s"),
        )]
        .into_iter()
        .collect();
        let previous = store
            .transaction(Origin::Remote, 2, |tx| Ok(tx.replace_table("threads", fresh)))
            .unwrap();

        assert_eq!(previous.len(), 1);
        assert!(store.get("threads", "old").is_none());
        assert_eq!(store.get("threads", "new").unwrap().version, Some(5));
    }

    #[test]
    fn rejects_non_object_patch() {
        let mut store = LocalStore::new(test_schema(), "device-1");
        let result = store.transaction(Origin::Local, 1, |tx| tx.put("threads", "a", json!(3)));
        assert!(matches!(result, Err(Error::InvalidPayload(_))));
    }
}
