// # Remote Adapter Trait
//
// Defines the boundary to the concrete remote backend.
//
// ## Implementations
//
// - HTTP document API: `orisync-remote-http` crate
// - `UnconfiguredRemote`: built in, used when no backend is configured
//
// ## Usage
//
// ```rust,ignore
// use orisync_core::traits::{RemoteAdapter, QueryDescriptor};
// use tokio_stream::StreamExt;
//
// let remote = /* RemoteAdapter implementation */;
//
// remote.write("events/e1/entries", "runner-7", &json!({"class": "H21"})).await?;
//
// let mut snapshots = remote.subscribe(&QueryDescriptor::new("owner", "events/e1/entries"));
// while let Some(snapshot) = snapshots.next().await {
//     println!("{} documents", snapshot?.len());
// }
// ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::pin::Pin;
use tokio_stream::Stream;

use crate::traits::mirror_store::MirroredRecord;

/// A field equality constraint on a live query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldFilter {
    /// Top-level document field
    pub field: String,
    /// Required value
    pub value: Value,
}

/// Description of one live remote query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryDescriptor {
    /// Source key, unique within one subscription (e.g. "owner", "club:123")
    pub key: String,
    /// Collection scope the query reads from
    pub scope: String,
    /// Field equality constraints
    #[serde(default)]
    pub filters: Vec<FieldFilter>,
}

impl QueryDescriptor {
    /// Create an unfiltered query over a scope
    pub fn new(key: impl Into<String>, scope: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            scope: scope.into(),
            filters: Vec::new(),
        }
    }

    /// Add a field equality constraint
    pub fn where_eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push(FieldFilter {
            field: field.into(),
            value: value.into(),
        });
        self
    }
}

/// A document as delivered by the remote backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteDocument {
    /// Document id
    pub id: String,
    /// Document body
    pub data: Value,
    /// Server-side modification time, when the backend provides one
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl RemoteDocument {
    /// Decode into a plain, confirmed mirror record
    ///
    /// The timestamp falls back to an `updatedAt` RFC 3339 field in the body,
    /// then to `fallback`.
    pub fn into_record(self, fallback: DateTime<Utc>) -> MirroredRecord {
        let updated_at = self
            .updated_at
            .or_else(|| {
                self.data
                    .get("updatedAt")
                    .and_then(Value::as_str)
                    .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                    .map(|dt| dt.with_timezone(&Utc))
            })
            .unwrap_or(fallback);

        MirroredRecord::confirmed(self.id, self.data, updated_at)
    }
}

/// A live stream of full snapshots (never diffs)
pub type SnapshotStream =
    Pin<Box<dyn Stream<Item = crate::Result<Vec<RemoteDocument>>> + Send + 'static>>;

/// Trait for remote backend implementations
///
/// # Rules for Implementations
///
/// - Single-shot writes: no retry or backoff (the offline queue owns retry)
/// - Writes must be upserts keyed by `(scope, id)` so replays are idempotent
/// - `subscribe` yields full snapshots; the stream ending means the source
///   stopped, not that it is empty
/// - Dropping the stream must release the underlying listener
#[async_trait]
pub trait RemoteAdapter: Send + Sync {
    /// Upsert a document
    async fn write(&self, scope: &str, id: &str, data: &Value) -> crate::Result<()>;

    /// Open a live query
    fn subscribe(&self, query: &QueryDescriptor) -> SnapshotStream;

    /// Delete a document
    ///
    /// Only explicit removal paths use this. Backends without deletes keep
    /// the default, which makes the removal queue like any failed write.
    async fn delete(&self, scope: &str, id: &str) -> crate::Result<()> {
        let _ = (scope, id);
        Err(crate::Error::adapter_unavailable(format!(
            "{} does not support deletes",
            self.adapter_name()
        )))
    }

    /// Adapter name (for logging)
    fn adapter_name(&self) -> &'static str;

    /// Whether a real backend is behind this adapter
    fn is_configured(&self) -> bool {
        true
    }
}

/// Adapter used when no remote backend is configured
///
/// Writes fail immediately with [`crate::Error::AdapterUnavailable`], which
/// routes every write into the offline queue. Subscriptions end immediately,
/// leaving the local mirror as the only source.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnconfiguredRemote;

#[async_trait]
impl RemoteAdapter for UnconfiguredRemote {
    async fn write(&self, _scope: &str, _id: &str, _data: &Value) -> crate::Result<()> {
        Err(crate::Error::adapter_unavailable("no remote backend configured"))
    }

    fn subscribe(&self, _query: &QueryDescriptor) -> SnapshotStream {
        Box::pin(tokio_stream::empty())
    }

    fn adapter_name(&self) -> &'static str {
        "unconfigured"
    }

    fn is_configured(&self) -> bool {
        false
    }
}

/// Helper trait for constructing remote adapters from configuration
pub trait RemoteAdapterFactory: Send + Sync {
    /// Create a RemoteAdapter instance from configuration
    fn create(
        &self,
        config: &crate::config::RemoteConfig,
    ) -> crate::Result<std::sync::Arc<dyn RemoteAdapter>>;
}

/// Factory for [`UnconfiguredRemote`]
#[derive(Debug, Default)]
pub struct UnconfiguredRemoteFactory;

impl RemoteAdapterFactory for UnconfiguredRemoteFactory {
    fn create(
        &self,
        config: &crate::config::RemoteConfig,
    ) -> crate::Result<std::sync::Arc<dyn RemoteAdapter>> {
        match config {
            crate::config::RemoteConfig::Unconfigured => Ok(std::sync::Arc::new(UnconfiguredRemote)),
            _ => Err(crate::Error::config("Invalid config for unconfigured remote")),
        }
    }
}
