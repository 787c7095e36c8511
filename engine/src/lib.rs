//! # Driftsync Engine
//!
//! The deterministic core of an offline-first sync engine.
//!
//! This crate holds every piece of sync state and every decision about it,
//! with no knowledge of time sources, networks or threads. The async shell in
//! `driftsync-runtime` drives it.
//!
//! ## Design Principles
//!
//! - **No IO**: callers pass the current time in; nothing here blocks
//! - **Deterministic**: the same inputs always produce the same outputs
//! - **Transactional**: row writes and their sync bookkeeping commit together
//!
//! ## Core Concepts
//!
//! ### Change capture
//!
//! Every local write goes through a [`LocalStore`] transaction. The
//! [`ChangeCapture`] hook stamps it with a [`ChangeStamp`] and appends a
//! [`PendingOp`] to the [`Outbox`] (plus a [`Tombstone`] for deletes) inside
//! the same transaction. Remote-origin writes are not captured.
//!
//! ### Outbox
//!
//! Pending ops keep capture order. [`coalesce`] folds several ops on the same
//! row into one [`BatchOp`] carrying every involved [`OpId`], grouped into
//! per-table [`PushBatch`]es.
//!
//! ### Conflict resolution
//!
//! The [`Resolver`] applies pulled [`RemoteChange`]s: stale replays and
//! changes older than a tombstone are dropped, collisions with pending local
//! ops follow the table's [`TablePolicy`] (`lww`, `merge` or `crdt`).
//!
//! ## Quick Start
//!
//! ```rust
//! use driftsync_engine::{
//!     coalesce, FieldDef, FieldType, LocalStore, Origin, Schema, TableSchema,
//! };
//! use serde_json::json;
//!
//! let schema = Schema::new(1).with_table(TableSchema::new(
//!     "threads",
//!     vec![FieldDef::required("title", FieldType::String)],
//! ));
//! let mut store = LocalStore::with_capture(schema, "device-1");
//!
//! store
//!     .transaction(Origin::Local, 1_706_745_600_000, |tx| {
//!         tx.put("threads", "t-1", json!({"title": "Hello"}))
//!     })
//!     .unwrap();
//!
//! let pending: Vec<_> = store.state().outbox.iter().cloned().collect();
//! let batches = coalesce(&pending, 50).unwrap();
//! assert_eq!(batches[0].table, "threads");
//! ```
//!
//! ## Persistence
//!
//! [`LocalStore::export_snapshot`] and [`LocalStore::import_snapshot`] move
//! the whole state through a [`StoreSnapshot`], serialized as JSON with
//! deterministic ordering.

pub mod capture;
pub mod clock;
pub mod cursor;
pub mod error;
pub mod ledger;
pub mod operation;
pub mod outbox;
pub mod record;
pub mod resolver;
pub mod schema;
pub mod snapshot;
pub mod stamp;
pub mod store;
pub mod tombstone;

// Re-export main types at crate root
pub use capture::ChangeCapture;
pub use clock::{Hlc, HybridClock};
pub use cursor::{Cursor, CursorStore, SyncState};
pub use error::{Error, ErrorCode};
pub use ledger::{RunError, RunKind, SyncLedger, SyncRun};
pub use operation::{OpKind, OpStatus, PendingOp};
pub use outbox::{coalesce, BatchOp, Outbox, PushBatch};
pub use record::{Metadata, Origin, Record};
pub use resolver::{
    crdt, Conflict, CrdtMerge, CrdtType, Decision, FieldStrategy, PolicyKind, PolicySet,
    Rebase, RemoteChange, Resolution, Resolver, RowWrite, TablePolicy, Winner,
};
pub use schema::{FieldDef, FieldType, Schema, SchemaVersion, TableSchema};
pub use snapshot::{SnapshotMetadata, StoreSnapshot, SNAPSHOT_FORMAT_VERSION};
pub use stamp::{ChangeStamp, OpId};
pub use store::{LocalStore, Mutation, MutationHook, MutationKind, StoreState, Table, Transaction};
pub use tombstone::{Tombstone, TombstoneStore};

/// Type aliases for clarity
pub type TableName = String;
pub type PrimaryKey = String;
pub type DeviceId = String;
pub type Version = u64;
pub type Timestamp = u64;
