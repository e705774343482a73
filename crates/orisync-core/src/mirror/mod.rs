// # Mirror Store Implementations
//
// This module provides implementations of the MirrorStore trait for
// different persistence strategies, plus the record-table and notification
// plumbing they share.

pub mod file;
pub mod memory;

pub use file::{FileMirrorStore, FileMirrorStoreFactory};
pub use memory::{MemoryMirrorStore, MemoryMirrorStoreFactory};

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::watch;

use crate::traits::mirror_store::{merge_payload, MirroredRecord};

/// Records keyed by scope, then by id
pub(crate) type ScopeTable = HashMap<String, HashMap<String, MirroredRecord>>;

/// Merge a record into the table, returning the stored value
pub(crate) fn upsert_into(table: &mut ScopeTable, scope: &str, record: MirroredRecord) -> MirroredRecord {
    let records = table.entry(scope.to_string()).or_default();
    let stored = match records.get(&record.id) {
        Some(existing) => MirroredRecord {
            id: record.id.clone(),
            payload: merge_payload(&existing.payload, &record.payload),
            updated_at: record.updated_at,
            pending_write: record.pending_write,
        },
        None => record,
    };
    records.insert(stored.id.clone(), stored.clone());
    stored
}

/// Store records verbatim, returning how many changed
pub(crate) fn put_into(table: &mut ScopeTable, scope: &str, incoming: Vec<MirroredRecord>) -> usize {
    let records = table.entry(scope.to_string()).or_default();
    let mut changed = 0;
    for record in incoming {
        let unchanged = records
            .get(&record.id)
            .is_some_and(|existing| existing.same_content(&record) && existing.updated_at == record.updated_at);
        if !unchanged {
            records.insert(record.id.clone(), record);
            changed += 1;
        }
    }
    changed
}

/// Per-scope level-triggered change notification
///
/// Each scope owns a `watch` channel carrying a version counter. Receivers
/// only learn that something changed and re-read the collection.
#[derive(Debug, Default)]
pub(crate) struct ScopeNotifier {
    senders: Mutex<HashMap<String, watch::Sender<u64>>>,
}

impl ScopeNotifier {
    pub(crate) fn subscribe(&self, scope: &str) -> watch::Receiver<u64> {
        let mut senders = match self.senders.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        senders
            .entry(scope.to_string())
            .or_insert_with(|| watch::channel(0).0)
            .subscribe()
    }

    pub(crate) fn notify(&self, scope: &str) {
        let senders = match self.senders.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(sender) = senders.get(scope) {
            sender.send_modify(|version| *version = version.wrapping_add(1));
        }
    }
}
