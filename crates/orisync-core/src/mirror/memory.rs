// # Memory Mirror Store
//
// In-memory implementation of MirrorStore.
//
// ## Purpose
//
// Provides a fast mirror that doesn't persist across restarts. Useful for
// tests, short-lived tools, and hosts that rebuild the mirror from live
// subscriptions on every launch.
//
// ## Crash Behavior
//
// - All mirrored records are lost on restart
// - The first subscription after a restart starts from an empty view

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::watch;

use super::{put_into, upsert_into, ScopeNotifier, ScopeTable};
use crate::config::MirrorStoreConfig;
use crate::traits::mirror_store::{ListQuery, MirrorStore, MirrorStoreFactory, MirroredRecord};
use crate::Error;

/// In-memory mirror store implementation
///
/// Records live in a map protected by a `RwLock`; cloning the store shares
/// the same data.
///
/// # Example
///
/// ```rust
/// use orisync_core::mirror::MemoryMirrorStore;
/// use orisync_core::traits::{ListQuery, MirrorStore, MirroredRecord};
/// use serde_json::json;
///
/// let mirror = MemoryMirrorStore::new();
/// mirror.upsert("events/e1/entries", MirroredRecord::pending("runner-7", json!({"class": "H21"})));
///
/// let entries = mirror.list("events/e1/entries", &ListQuery::default());
/// assert_eq!(entries.len(), 1);
/// assert!(entries[0].pending_write);
/// ```
#[derive(Debug, Clone, Default)]
pub struct MemoryMirrorStore {
    table: Arc<RwLock<ScopeTable>>,
    notifier: Arc<ScopeNotifier>,
}

impl MemoryMirrorStore {
    /// Create a new empty memory mirror
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the number of records across all scopes
    pub fn len(&self) -> usize {
        self.read().values().map(|records| records.len()).sum()
    }

    /// Check if the mirror is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> RwLockReadGuard<'_, ScopeTable> {
        match self.table.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, ScopeTable> {
        match self.table.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl MirrorStore for MemoryMirrorStore {
    fn upsert(&self, scope: &str, record: MirroredRecord) -> MirroredRecord {
        let stored = upsert_into(&mut self.write(), scope, record);
        self.notifier.notify(scope);
        stored
    }

    fn put_many(&self, scope: &str, records: Vec<MirroredRecord>) -> usize {
        let changed = put_into(&mut self.write(), scope, records);
        if changed > 0 {
            self.notifier.notify(scope);
        }
        changed
    }

    fn get(&self, scope: &str, id: &str) -> Option<MirroredRecord> {
        self.read().get(scope).and_then(|records| records.get(id)).cloned()
    }

    fn remove(&self, scope: &str, id: &str) -> bool {
        let removed = self
            .write()
            .get_mut(scope)
            .and_then(|records| records.remove(id))
            .is_some();
        if removed {
            self.notifier.notify(scope);
        }
        removed
    }

    fn mark_confirmed(&self, scope: &str, id: &str) -> bool {
        let changed = {
            let mut table = self.write();
            match table.get_mut(scope).and_then(|records| records.get_mut(id)) {
                Some(record) if record.pending_write => {
                    record.pending_write = false;
                    true
                }
                _ => false,
            }
        };
        if changed {
            self.notifier.notify(scope);
        }
        changed
    }

    fn list(&self, scope: &str, query: &ListQuery) -> Vec<MirroredRecord> {
        match self.read().get(scope) {
            Some(records) => query.apply(records.values()),
            None => Vec::new(),
        }
    }

    fn scopes(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }

    fn watch(&self, scope: &str) -> watch::Receiver<u64> {
        self.notifier.subscribe(scope)
    }

    fn flush(&self) -> crate::Result<()> {
        // Nothing buffered
        Ok(())
    }
}

/// Factory for [`MemoryMirrorStore`]
#[derive(Debug, Default)]
pub struct MemoryMirrorStoreFactory;

impl MirrorStoreFactory for MemoryMirrorStoreFactory {
    fn create(&self, config: &MirrorStoreConfig) -> crate::Result<Arc<dyn MirrorStore>> {
        match config {
            MirrorStoreConfig::Memory => Ok(Arc::new(MemoryMirrorStore::new())),
            _ => Err(Error::config("Invalid config for memory mirror store")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_memory_mirror_basic() {
        let mirror = MemoryMirrorStore::new();
        assert!(mirror.is_empty());

        let stored = mirror.upsert("results", MirroredRecord::pending("r1", json!({"time": 3600})));
        assert!(stored.pending_write);
        assert_eq!(mirror.len(), 1);

        let fetched = mirror.get("results", "r1").unwrap();
        assert_eq!(fetched.payload, json!({"time": 3600}));

        assert!(mirror.remove("results", "r1"));
        assert!(!mirror.remove("results", "r1"));
        assert!(mirror.is_empty());
    }

    #[test]
    fn test_memory_mirror_upsert_merges_and_refreshes() {
        let mirror = MemoryMirrorStore::new();
        let first = mirror.upsert("entries", MirroredRecord::pending("e1", json!({"name": "Eva", "class": "D21"})));
        let second = mirror.upsert("entries", MirroredRecord::pending("e1", json!({"class": "D20"})));

        assert_eq!(second.payload, json!({"name": "Eva", "class": "D20"}));
        assert!(second.updated_at >= first.updated_at);
        assert_eq!(mirror.list("entries", &ListQuery::default()).len(), 1);
    }

    #[test]
    fn test_memory_mirror_mark_confirmed() {
        let mirror = MemoryMirrorStore::new();
        mirror.upsert("entries", MirroredRecord::pending("e1", json!({})));

        assert!(mirror.mark_confirmed("entries", "e1"));
        assert!(!mirror.get("entries", "e1").unwrap().pending_write);
        assert!(!mirror.mark_confirmed("entries", "e1"));
        assert!(!mirror.mark_confirmed("entries", "missing"));
    }

    #[tokio::test]
    async fn test_memory_mirror_notifications_are_level_triggered() {
        let mirror = MemoryMirrorStore::new();
        let mut rx = mirror.watch("entries");

        mirror.upsert("entries", MirroredRecord::pending("e1", json!({"a": 1})));
        mirror.upsert("entries", MirroredRecord::pending("e2", json!({"a": 2})));

        // Two mutations collapse into one observable change
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), 2);
        assert!(!rx.has_changed().unwrap());

        // Unchanged write-back does not notify
        let current = mirror.list("entries", &ListQuery::default());
        assert_eq!(mirror.put_many("entries", current), 0);
        assert!(!rx.has_changed().unwrap());
    }

    #[test]
    fn test_memory_mirror_scopes_are_isolated() {
        let mirror = MemoryMirrorStore::new();
        mirror.upsert("clubs/a/members", MirroredRecord::pending("u1", json!({})));
        mirror.upsert("clubs/b/members", MirroredRecord::pending("u1", json!({})));

        assert_eq!(mirror.list("clubs/a/members", &ListQuery::default()).len(), 1);
        assert!(mirror.remove("clubs/a/members", "u1"));
        assert!(mirror.get("clubs/b/members", "u1").is_some());

        let mut scopes = mirror.scopes();
        scopes.sort();
        assert_eq!(scopes, vec!["clubs/a/members", "clubs/b/members"]);
    }
}
