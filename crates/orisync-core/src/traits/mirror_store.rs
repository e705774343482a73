// # Mirror Store Trait
//
// Defines the interface for the local, on-device copy of remote collections.
//
// ## Purpose
//
// The mirror is both the read-after-write source for optimistic writes and
// the offline fallback for live subscriptions. It tracks, per collection
// scope:
// - The latest known payload of each record
// - When the record was last changed
// - Whether a local write is still waiting for remote confirmation
//
// ## Implementations
//
// - In-memory: `MemoryMirrorStore`
// - File-based: `FileMirrorStore` (single JSON document, atomic rename)
//
// ## Usage
//
// ```rust,ignore
// use orisync_core::{MirrorStore, MirroredRecord};
// use orisync_core::traits::mirror_store::ListQuery;
//
// let mirror = /* MirrorStore implementation */;
//
// mirror.upsert("events/e1/entries", MirroredRecord::pending("runner-7", json!({"class": "H21"})));
// let entries = mirror.list("events/e1/entries", &ListQuery::default());
// ```

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;

/// A record as held by the local mirror
///
/// `T` defaults to a plain JSON value; the mirror itself is type-erased and
/// resource modules use [`MirroredRecord::decode`] for typed views.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MirroredRecord<T = Value> {
    /// Record id, unique within its collection scope
    pub id: String,
    /// Record payload
    pub payload: T,
    /// Timestamp of the last change (local write or remote snapshot)
    pub updated_at: DateTime<Utc>,
    /// True while a local write has not been confirmed by the remote
    #[serde(default)]
    pub pending_write: bool,
}

impl MirroredRecord<Value> {
    /// Create a record produced by a local write that is not yet confirmed
    pub fn pending(id: impl Into<String>, payload: Value) -> Self {
        Self {
            id: id.into(),
            payload,
            updated_at: Utc::now(),
            pending_write: true,
        }
    }

    /// Stamp the record with an explicit modification time
    pub fn with_updated_at(mut self, updated_at: DateTime<Utc>) -> Self {
        self.updated_at = updated_at;
        self
    }

    /// Create a record confirmed by the remote
    pub fn confirmed(id: impl Into<String>, payload: Value, updated_at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            payload,
            updated_at,
            pending_write: false,
        }
    }

    /// Decode the payload into a typed view
    pub fn decode<U: DeserializeOwned>(&self) -> crate::Result<MirroredRecord<U>> {
        Ok(MirroredRecord {
            id: self.id.clone(),
            payload: serde_json::from_value(self.payload.clone())?,
            updated_at: self.updated_at,
            pending_write: self.pending_write,
        })
    }

    /// Read a top-level string field from the payload
    pub fn field_str(&self, field: &str) -> Option<&str> {
        self.payload.get(field).and_then(Value::as_str)
    }

    /// Whether payload and pending flag match, ignoring the timestamp
    pub(crate) fn same_content(&self, other: &Self) -> bool {
        self.payload == other.payload && self.pending_write == other.pending_write
    }
}

/// Merge an incoming payload into an existing one
///
/// JSON objects merge key by key (incoming keys win); any other shape
/// replaces the existing payload.
pub fn merge_payload(existing: &Value, incoming: &Value) -> Value {
    match (existing, incoming) {
        (Value::Object(current), Value::Object(update)) => {
            let mut merged = current.clone();
            for (key, value) in update {
                merged.insert(key.clone(), value.clone());
            }
            Value::Object(merged)
        }
        _ => incoming.clone(),
    }
}

/// Sort order for [`MirrorStore::list`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    /// Most recently updated first
    #[default]
    Descending,
    /// Oldest first
    Ascending,
}

/// Filter and ordering options for listing a collection
#[derive(Debug, Clone, Default)]
pub struct ListQuery {
    /// Top-level payload fields that must equal the given values
    pub field_eq: Vec<(String, Value)>,
    /// Only return records with an unconfirmed local write
    pub pending_only: bool,
    /// Ordering by `updated_at`
    pub order: SortOrder,
    /// Maximum number of records to return
    pub limit: Option<usize>,
}

impl ListQuery {
    /// Require a payload field to equal a value
    pub fn where_eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.field_eq.push((field.into(), value.into()));
        self
    }

    /// Only return records with an unconfirmed local write
    pub fn pending_only(mut self) -> Self {
        self.pending_only = true;
        self
    }

    /// Change the ordering
    pub fn with_order(mut self, order: SortOrder) -> Self {
        self.order = order;
        self
    }

    /// Limit the number of results
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether a record passes the filters
    pub fn matches(&self, record: &MirroredRecord) -> bool {
        if self.pending_only && !record.pending_write {
            return false;
        }
        self.field_eq
            .iter()
            .all(|(field, value)| record.payload.get(field) == Some(value))
    }

    /// Filter, order and truncate a set of records
    pub fn apply<'a, I>(&self, records: I) -> Vec<MirroredRecord>
    where
        I: IntoIterator<Item = &'a MirroredRecord>,
    {
        let mut out: Vec<MirroredRecord> = records
            .into_iter()
            .filter(|record| self.matches(record))
            .cloned()
            .collect();

        match self.order {
            SortOrder::Descending => out.sort_by(|a, b| {
                b.updated_at.cmp(&a.updated_at).then_with(|| a.id.cmp(&b.id))
            }),
            SortOrder::Ascending => out.sort_by(|a, b| {
                a.updated_at.cmp(&b.updated_at).then_with(|| a.id.cmp(&b.id))
            }),
        }

        if let Some(limit) = self.limit {
            out.truncate(limit);
        }
        out
    }
}

/// Trait for local mirror implementations
///
/// All methods are synchronous: a write is visible to the next read on
/// return, and every mutation is applied under a lock so no reader observes
/// a half-written record.
///
/// # Failure Behavior
///
/// Mutations never fail outwardly. If durable storage is unavailable the
/// implementation logs the failure and keeps serving the in-memory state.
///
/// # Notifications
///
/// Every mutation that changes a scope bumps that scope's version in the
/// channel returned by [`MirrorStore::watch`]. The notification is
/// level-triggered: consumers re-read the full list instead of applying a
/// diff.
pub trait MirrorStore: Send + Sync {
    /// Merge a record into the scope, or insert it
    ///
    /// The payload is merged with [`merge_payload`]. `updated_at` and
    /// `pending_write` are taken from the incoming record, which the writer
    /// stamps with its own clock.
    /// Returns the stored record.
    fn upsert(&self, scope: &str, record: MirroredRecord) -> MirroredRecord;

    /// Store records verbatim, preserving their timestamps
    ///
    /// Returns the number of records whose content actually changed. No
    /// notification is raised when nothing changed.
    fn put_many(&self, scope: &str, records: Vec<MirroredRecord>) -> usize;

    /// Get a single record
    fn get(&self, scope: &str, id: &str) -> Option<MirroredRecord>;

    /// Remove a record, returning whether it existed
    fn remove(&self, scope: &str, id: &str) -> bool;

    /// Clear the pending flag of a record after remote confirmation
    fn mark_confirmed(&self, scope: &str, id: &str) -> bool;

    /// List records in a scope
    fn list(&self, scope: &str, query: &ListQuery) -> Vec<MirroredRecord>;

    /// List known collection scopes
    fn scopes(&self) -> Vec<String>;

    /// Subscribe to level-triggered change notifications for a scope
    fn watch(&self, scope: &str) -> watch::Receiver<u64>;

    /// Persist any buffered changes
    fn flush(&self) -> crate::Result<()>;
}

/// Helper trait for constructing mirror stores from configuration
pub trait MirrorStoreFactory: Send + Sync {
    /// Create a MirrorStore instance from configuration
    fn create(
        &self,
        config: &crate::config::MirrorStoreConfig,
    ) -> crate::Result<std::sync::Arc<dyn MirrorStore>>;
}
