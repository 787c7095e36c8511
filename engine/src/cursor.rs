//! Per-scope bookmarks into the remote change stream.

use crate::{TableName, Timestamp, Version};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// An opaque provider token plus the server version it stands for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cursor {
    pub token: String,
    pub version: Version,
}

impl Cursor {
    pub fn new(token: impl Into<String>, version: Version) -> Self {
        Self {
            token: token.into(),
            version,
        }
    }
}

/// Sync state of one scope.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_server_version: Option<Version>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_cursor: Option<Cursor>,
    #[serde(default)]
    pub updated_at: Timestamp,
}

/// Cursor store, one row per table of the current tenant.
///
/// Only the pull loop writes here, and only in the same transaction that
/// applies the batch the cursor describes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CursorStore {
    scopes: BTreeMap<TableName, SyncState>,
}

impl CursorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, table: &str) -> Option<&SyncState> {
        self.scopes.get(table)
    }

    /// The cursor to resume pulling `table` from.
    pub fn cursor(&self, table: &str) -> Option<&Cursor> {
        self.scopes.get(table).and_then(|s| s.last_cursor.as_ref())
    }

    /// Move the cursor forward.
    ///
    /// Returns `false` (and changes nothing) if `next` is behind the stored
    /// version; the cursor never regresses.
    pub fn advance(&mut self, table: &str, next: Cursor, now: Timestamp) -> bool {
        let state = self.scopes.entry(table.to_string()).or_default();
        if state.last_server_version.is_some_and(|v| next.version < v) {
            return false;
        }
        state.last_server_version = Some(next.version);
        state.last_cursor = Some(next);
        state.updated_at = now;
        true
    }

    /// Forget a scope's position (rescan installs a fresh one afterwards).
    pub fn reset(&mut self, table: &str) -> Option<SyncState> {
        self.scopes.remove(table)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&TableName, &SyncState)> {
        self.scopes.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn advance_sets_cursor() {
        let mut store = CursorStore::new();
        assert!(store.advance("threads", Cursor::new("v3", 3), 100));
        let state = store.get("threads").unwrap();
        assert_eq!(state.last_server_version, Some(3));
        assert_eq!(state.updated_at, 100);
        assert_eq!(store.cursor("threads").unwrap().token, "v3");
    }

    #[test]
    fn advance_never_regresses() {
        let mut store = CursorStore::new();
        store.advance("threads", Cursor::new("v9", 9), 0);
        assert!(!store.advance("threads", Cursor::new("v4", 4), 1));
        assert_eq!(store.cursor("threads").unwrap().version, 9);
        assert!(store.advance("threads", Cursor::new("v9b", 9), 2));
    }

    #[test]
    fn reset_clears_scope() {
        let mut store = CursorStore::new();
        store.advance("threads", Cursor::new("v1", 1), 0);
        assert!(store.reset("threads").is_some());
        assert!(store.cursor("threads").is_none());
        assert!(store.advance("threads", Cursor::new("v0", 0), 0));
    }

    proptest! {
        #[test]
        fn prop_cursor_is_monotonic(versions in proptest::collection::vec(0u64..1000, 1..40)) {
            let mut store = CursorStore::new();
            let mut high = None;
            for v in versions {
                store.advance("t", Cursor::new(format!("v{v}"), v), 0);
                high = Some(high.map_or(v, |h: u64| h.max(v)));
                prop_assert_eq!(store.get("t").unwrap().last_server_version, high);
            }
        }
    }
}
