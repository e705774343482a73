// # File Mirror Store
//
// File-based implementation of MirrorStore with crash recovery.
//
// ## Purpose
//
// Keeps the local mirror across restarts so an offline launch starts from
// the latest remote-confirmed state plus any unconfirmed local writes.
//
// ## Crash Recovery
//
// - Atomic writes: write-then-rename
// - Automatic backup: `.backup` holds the last known good file
// - Corruption detection: JSON validated on load, backup used as fallback
//
// ## Failure Behavior
//
// Mirror mutations never fail outwardly. A failed write is logged and the
// in-memory table keeps serving reads; the next successful write persists
// everything.
//
// ## File Format
//
// ```json
// {
//   "version": "1.0",
//   "scopes": {
//     "events/e1/entries": {
//       "runner-7": {
//         "id": "runner-7",
//         "payload": {"class": "H21"},
//         "updatedAt": "2025-05-01T10:00:00Z",
//         "pendingWrite": true
//       }
//     }
//   }
// }
// ```

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::watch;

use super::{put_into, upsert_into, ScopeNotifier, ScopeTable};
use crate::config::MirrorStoreConfig;
use crate::traits::mirror_store::{ListQuery, MirrorStore, MirrorStoreFactory, MirroredRecord};
use crate::Error;

/// Mirror file format version
const MIRROR_FILE_VERSION: &str = "1.0";

/// File-based mirror store with crash recovery
///
/// # Example
///
/// ```rust,no_run
/// use orisync_core::mirror::FileMirrorStore;
/// use orisync_core::traits::{MirrorStore, MirroredRecord};
/// use serde_json::json;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let mirror = FileMirrorStore::open("/var/lib/orisync/mirror.json")?;
///     mirror.upsert("events/e1/entries", MirroredRecord::pending("runner-7", json!({"class": "H21"})));
///     Ok(())
/// }
/// ```
#[derive(Debug)]
pub struct FileMirrorStore {
    path: PathBuf,
    table: RwLock<ScopeTable>,
    notifier: ScopeNotifier,
}

/// Serializable mirror file format
#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct MirrorFileFormat {
    version: String,
    scopes: ScopeTable,
}

impl FileMirrorStore {
    /// Create or load a file mirror
    ///
    /// This will:
    /// 1. Create parent directories if needed
    /// 2. Try to load the existing file
    /// 3. If it is corrupted, load the backup
    /// 4. If both fail, start empty
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            fs::create_dir_all(parent).map_err(|e| {
                Error::config(format!(
                    "Failed to create mirror directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let table = Self::load_with_recovery(&path)?;

        Ok(Self {
            path,
            table: RwLock::new(table),
            notifier: ScopeNotifier::default(),
        })
    }

    /// Load the mirror, falling back to the backup on corruption
    fn load_with_recovery(path: &Path) -> Result<ScopeTable, Error> {
        match Self::load(path) {
            Ok(table) => {
                tracing::debug!("Loaded mirror from file: {} scopes", table.len());
                Ok(table)
            }
            Err(Error::Json(e)) => {
                tracing::warn!(
                    "Mirror file appears corrupted: {}. Attempting recovery from backup.",
                    e
                );

                let backup_path = Self::backup_path(path);
                if !backup_path.exists() {
                    tracing::warn!("No mirror backup found. Starting with empty mirror.");
                    return Ok(ScopeTable::new());
                }

                match Self::load(&backup_path) {
                    Ok(table) => {
                        tracing::info!("Recovered mirror from backup: {} scopes", table.len());
                        if let Err(restore_err) = fs::copy(&backup_path, path) {
                            tracing::error!(
                                "Failed to restore mirror file from backup: {}",
                                restore_err
                            );
                        }
                        Ok(table)
                    }
                    Err(backup_err) => {
                        tracing::error!(
                            "Mirror backup also unreadable: {}. Starting with empty mirror.",
                            backup_err
                        );
                        Ok(ScopeTable::new())
                    }
                }
            }
            Err(e) => Err(e),
        }
    }

    fn load(path: &Path) -> Result<ScopeTable, Error> {
        if !path.exists() {
            tracing::debug!("Mirror file does not exist: {}", path.display());
            return Ok(ScopeTable::new());
        }

        let content = fs::read_to_string(path).map_err(|e| {
            Error::mirror_store(format!("Failed to read mirror file {}: {}", path.display(), e))
        })?;

        let file: MirrorFileFormat = serde_json::from_str(&content)?;

        if file.version != MIRROR_FILE_VERSION {
            tracing::warn!(
                "Mirror file version mismatch: expected {}, got {}. Attempting to load anyway.",
                MIRROR_FILE_VERSION,
                file.version
            );
        }

        Ok(file.scopes)
    }

    /// Write the table atomically (temp file, backup, rename)
    fn persist(&self, table: &ScopeTable) -> Result<(), Error> {
        let json = serde_json::to_string_pretty(&MirrorFileFormat {
            version: MIRROR_FILE_VERSION.to_string(),
            scopes: table.clone(),
        })?;

        let temp_path = self.temp_path();
        {
            let mut file = fs::File::create(&temp_path).map_err(|e| {
                Error::mirror_store(format!(
                    "Failed to create temp file {}: {}",
                    temp_path.display(),
                    e
                ))
            })?;
            file.write_all(json.as_bytes())?;
            file.sync_all()?;
        }

        if self.path.exists()
            && let Err(e) = fs::copy(&self.path, Self::backup_path(&self.path))
        {
            tracing::warn!("Failed to create mirror backup: {}", e);
        }

        fs::rename(&temp_path, &self.path).map_err(|e| {
            Error::mirror_store(format!(
                "Failed to rename {} to {}: {}",
                temp_path.display(),
                self.path.display(),
                e
            ))
        })?;

        tracing::trace!("Mirror written to file: {}", self.path.display());
        Ok(())
    }

    /// Persist, downgrading failures to a warning
    fn persist_or_warn(&self, table: &ScopeTable) {
        if let Err(e) = self.persist(table) {
            tracing::warn!(
                "Mirror write to {} failed, continuing in memory: {}",
                self.path.display(),
                e
            );
        }
    }

    fn temp_path(&self) -> PathBuf {
        let mut temp = self.path.clone();
        temp.set_extension("tmp");
        temp
    }

    fn backup_path(path: &Path) -> PathBuf {
        let mut backup = path.to_path_buf();
        backup.set_extension("backup");
        backup
    }

    /// Path of the mirror file
    pub fn path(&self) -> &Path {
        &self.path
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

impl MirrorStore for FileMirrorStore {
    fn upsert(&self, scope: &str, record: MirroredRecord) -> MirroredRecord {
        let stored = {
            let mut table = self.write();
            let stored = upsert_into(&mut table, scope, record);
            self.persist_or_warn(&table);
            stored
        };
        self.notifier.notify(scope);
        stored
    }

    fn put_many(&self, scope: &str, records: Vec<MirroredRecord>) -> usize {
        let changed = {
            let mut table = self.write();
            let changed = put_into(&mut table, scope, records);
            if changed > 0 {
                self.persist_or_warn(&table);
            }
            changed
        };
        if changed > 0 {
            self.notifier.notify(scope);
        }
        changed
    }

    fn get(&self, scope: &str, id: &str) -> Option<MirroredRecord> {
        self.read().get(scope).and_then(|records| records.get(id)).cloned()
    }

    fn remove(&self, scope: &str, id: &str) -> bool {
        let removed = {
            let mut table = self.write();
            let removed = table
                .get_mut(scope)
                .and_then(|records| records.remove(id))
                .is_some();
            if removed {
                self.persist_or_warn(&table);
            }
            removed
        };
        if removed {
            self.notifier.notify(scope);
        }
        removed
    }

    fn mark_confirmed(&self, scope: &str, id: &str) -> bool {
        let changed = {
            let mut table = self.write();
            let changed = match table.get_mut(scope).and_then(|records| records.get_mut(id)) {
                Some(record) if record.pending_write => {
                    record.pending_write = false;
                    true
                }
                _ => false,
            };
            if changed {
                self.persist_or_warn(&table);
            }
            changed
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
        let table = self.read();
        self.persist(&table)
    }
}

/// Factory for [`FileMirrorStore`]
#[derive(Debug, Default)]
pub struct FileMirrorStoreFactory;

impl MirrorStoreFactory for FileMirrorStoreFactory {
    fn create(&self, config: &MirrorStoreConfig) -> crate::Result<Arc<dyn MirrorStore>> {
        match config {
            MirrorStoreConfig::File { path } => Ok(Arc::new(FileMirrorStore::open(path)?)),
            _ => Err(Error::config("Invalid config for file mirror store")),
        }
    }
}
