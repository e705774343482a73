//! Test doubles and common utilities for sync contract tests
//!
//! This module provides minimal test doubles that record what the engine
//! asks of its collaborators, without real I/O.

#![allow(dead_code)]

use orisync_core::error::{Error, Result};
use orisync_core::mirror::MemoryMirrorStore;
use orisync_core::traits::{
    ListQuery, MirrorStore, MirroredRecord, QueryDescriptor, RemoteAdapter, RemoteDocument,
    SnapshotStream,
};
use orisync_core::{MemoryActionLog, SyncConfig, SyncEngine, SyncEvent};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

type Feed = mpsc::UnboundedSender<Result<Vec<RemoteDocument>>>;

/// A remote backend held in memory, with a switch to simulate outages
pub struct MockRemote {
    /// Stored documents by (scope, id)
    documents: Arc<Mutex<HashMap<(String, String), Value>>>,
    /// Every successful write, in call order
    writes: Arc<Mutex<Vec<(String, String, Value)>>>,
    /// Call counter for write()
    write_call_count: Arc<AtomicUsize>,
    /// Call counter for delete()
    delete_call_count: Arc<AtomicUsize>,
    /// When set, writes and deletes fail
    offline: Arc<AtomicBool>,
    /// Live query feeds by source key
    feeds: Arc<Mutex<HashMap<String, Feed>>>,
}

impl MockRemote {
    pub fn new() -> Self {
        Self {
            documents: Arc::new(Mutex::new(HashMap::new())),
            writes: Arc::new(Mutex::new(Vec::new())),
            write_call_count: Arc::new(AtomicUsize::new(0)),
            delete_call_count: Arc::new(AtomicUsize::new(0)),
            offline: Arc::new(AtomicBool::new(false)),
            feeds: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Start in the offline state
    pub fn offline() -> Self {
        let remote = Self::new();
        remote.set_offline(true);
        remote
    }

    /// Create a new MockRemote that shares state and counters with an existing one
    pub fn sharing_counters_with(other: &Self) -> Self {
        Self {
            documents: Arc::clone(&other.documents),
            writes: Arc::clone(&other.writes),
            write_call_count: Arc::clone(&other.write_call_count),
            delete_call_count: Arc::clone(&other.delete_call_count),
            offline: Arc::clone(&other.offline),
            feeds: Arc::clone(&other.feeds),
        }
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Get the number of times write() was called
    pub fn write_call_count(&self) -> usize {
        self.write_call_count.load(Ordering::SeqCst)
    }

    /// Get the number of times delete() was called
    pub fn delete_call_count(&self) -> usize {
        self.delete_call_count.load(Ordering::SeqCst)
    }

    /// Current remote value of a document
    pub fn document(&self, scope: &str, id: &str) -> Option<Value> {
        self.documents
            .lock()
            .unwrap()
            .get(&(scope.to_string(), id.to_string()))
            .cloned()
    }

    /// Successful writes in call order
    pub fn writes(&self) -> Vec<(String, String, Value)> {
        self.writes.lock().unwrap().clone()
    }

    /// Deliver a full snapshot on a live query; false if nobody subscribed
    pub fn push(&self, key: &str, documents: Vec<RemoteDocument>) -> bool {
        self.feed(key, Ok(documents))
    }

    /// Make a live query fail
    pub fn fail_source(&self, key: &str, message: &str) -> bool {
        self.feed(key, Err(Error::transport(message)))
    }

    fn feed(&self, key: &str, item: Result<Vec<RemoteDocument>>) -> bool {
        match self.feeds.lock().unwrap().get(key) {
            Some(tx) => tx.send(item).is_ok(),
            None => false,
        }
    }
}

#[async_trait::async_trait]
impl RemoteAdapter for MockRemote {
    async fn write(&self, scope: &str, id: &str, data: &Value) -> Result<()> {
        self.write_call_count.fetch_add(1, Ordering::SeqCst);
        if self.offline.load(Ordering::SeqCst) {
            return Err(Error::write_failed(scope, id, "connection refused"));
        }
        self.documents
            .lock()
            .unwrap()
            .insert((scope.to_string(), id.to_string()), data.clone());
        self.writes
            .lock()
            .unwrap()
            .push((scope.to_string(), id.to_string(), data.clone()));
        Ok(())
    }

    fn subscribe(&self, query: &QueryDescriptor) -> SnapshotStream {
        let (tx, rx) = mpsc::unbounded_channel();
        self.feeds.lock().unwrap().insert(query.key.clone(), tx);
        Box::pin(tokio_stream::wrappers::UnboundedReceiverStream::new(rx))
    }

    async fn delete(&self, scope: &str, id: &str) -> Result<()> {
        self.delete_call_count.fetch_add(1, Ordering::SeqCst);
        if self.offline.load(Ordering::SeqCst) {
            return Err(Error::write_failed(scope, id, "connection refused"));
        }
        self.documents
            .lock()
            .unwrap()
            .remove(&(scope.to_string(), id.to_string()));
        Ok(())
    }

    fn adapter_name(&self) -> &'static str {
        "mock"
    }
}

/// A mirror that counts flush() calls
pub struct CountingMirror {
    inner: MemoryMirrorStore,
    flush_call_count: Arc<AtomicUsize>,
}

impl CountingMirror {
    pub fn new() -> Self {
        Self {
            inner: MemoryMirrorStore::new(),
            flush_call_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Get the number of times flush() was called
    pub fn flush_call_count(&self) -> usize {
        self.flush_call_count.load(Ordering::SeqCst)
    }

    /// Create a new CountingMirror that shares storage and counters with an existing one
    pub fn sharing_counters_with(other: &Self) -> Self {
        Self {
            inner: other.inner.clone(),
            flush_call_count: Arc::clone(&other.flush_call_count),
        }
    }
}

impl MirrorStore for CountingMirror {
    fn upsert(&self, scope: &str, record: MirroredRecord) -> MirroredRecord {
        self.inner.upsert(scope, record)
    }

    fn put_many(&self, scope: &str, records: Vec<MirroredRecord>) -> usize {
        self.inner.put_many(scope, records)
    }

    fn get(&self, scope: &str, id: &str) -> Option<MirroredRecord> {
        self.inner.get(scope, id)
    }

    fn remove(&self, scope: &str, id: &str) -> bool {
        self.inner.remove(scope, id)
    }

    fn mark_confirmed(&self, scope: &str, id: &str) -> bool {
        self.inner.mark_confirmed(scope, id)
    }

    fn list(&self, scope: &str, query: &ListQuery) -> Vec<MirroredRecord> {
        self.inner.list(scope, query)
    }

    fn scopes(&self) -> Vec<String> {
        self.inner.scopes()
    }

    fn watch(&self, scope: &str) -> tokio::sync::watch::Receiver<u64> {
        self.inner.watch(scope)
    }

    fn flush(&self) -> Result<()> {
        self.flush_call_count.fetch_add(1, Ordering::SeqCst);
        self.inner.flush()
    }
}

/// Helper to create a SyncConfig for testing
pub fn test_config() -> SyncConfig {
    let mut config = SyncConfig::default();
    config.engine.event_channel_capacity = 100;
    config
}

/// Build an engine over a mock remote, a memory mirror and a memory log
pub async fn engine_with(
    remote: &MockRemote,
    mirror: &MemoryMirrorStore,
    log: &MemoryActionLog,
) -> (SyncEngine, mpsc::Receiver<SyncEvent>) {
    SyncEngine::new(
        Arc::new(MockRemote::sharing_counters_with(remote)),
        Arc::new(mirror.clone()),
        Box::new(log.clone()),
        test_config(),
    )
    .await
    .expect("engine construction succeeds")
}

/// A remote document without a server timestamp
pub fn doc(id: &str, data: Value) -> RemoteDocument {
    RemoteDocument {
        id: id.to_string(),
        data,
        updated_at: None,
    }
}

/// Collects merged views delivered to a subscription callback
pub fn view_channel() -> (
    impl FnMut(Vec<MirroredRecord>) + Send + 'static,
    mpsc::UnboundedReceiver<Vec<MirroredRecord>>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        move |view| {
            let _ = tx.send(view);
        },
        rx,
    )
}

/// Wait for a delivered view matching the predicate
pub async fn next_view<P>(
    rx: &mut mpsc::UnboundedReceiver<Vec<MirroredRecord>>,
    mut predicate: P,
) -> Vec<MirroredRecord>
where
    P: FnMut(&[MirroredRecord]) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let view = rx.recv().await.expect("subscription still delivering");
            if predicate(&view) {
                return view;
            }
        }
    })
    .await
    .expect("matching view delivered within 5 seconds")
}
