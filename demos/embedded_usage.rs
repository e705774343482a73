//! Minimal embedding example for orisync-core
//!
//! This example demonstrates using orisync-core as a library in a custom
//! application. The remote backend is an in-process stand-in that can be
//! switched offline, so the whole offline-first cycle is visible:
//! local write, queueing, replay on reconnect, and the merged live view.

use orisync_core::connectivity::ManualNotifier;
use orisync_core::traits::{QueryDescriptor, RemoteAdapter, RemoteDocument, SnapshotStream};
use orisync_core::{
    Decision, Error, MemoryActionLog, MemoryMirrorStore, RequestOutcome, Result,
    SubscribeRequest, SyncConfig, SyncEngine,
};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// In-process remote that can lose its connection
#[derive(Clone, Default)]
struct EmbeddedRemote {
    documents: Arc<Mutex<HashMap<(String, String), Value>>>,
    offline: Arc<AtomicBool>,
}

impl EmbeddedRemote {
    fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn document_count(&self) -> usize {
        self.documents.lock().map(|docs| docs.len()).unwrap_or(0)
    }
}

#[async_trait::async_trait]
impl RemoteAdapter for EmbeddedRemote {
    async fn write(&self, scope: &str, id: &str, data: &Value) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(Error::transport("embedded remote is offline"));
        }
        println!("[Remote] write {}/{}", scope, id);
        self.documents
            .lock()
            .map_err(|_| Error::transport("remote state poisoned"))?
            .insert((scope.to_string(), id.to_string()), data.clone());
        Ok(())
    }

    fn subscribe(&self, query: &QueryDescriptor) -> SnapshotStream {
        // One snapshot of whatever the scope holds right now
        let snapshot: Vec<RemoteDocument> = self
            .documents
            .lock()
            .map(|docs| {
                docs.iter()
                    .filter(|((scope, _), _)| *scope == query.scope)
                    .map(|((_, id), data)| RemoteDocument {
                        id: id.clone(),
                        data: data.clone(),
                        updated_at: None,
                    })
                    .collect()
            })
            .unwrap_or_default();
        Box::pin(tokio_stream::iter(vec![Ok(snapshot)]))
    }

    fn adapter_name(&self) -> &'static str {
        "embedded"
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_max_level(tracing::Level::INFO).init();

    println!("=== Embedded orisync-core Example ===\n");

    let remote = EmbeddedRemote::default();
    remote.set_offline(true);

    println!("1. Creating engine (remote starts offline)...");
    let (engine, mut event_rx) = SyncEngine::new(
        Arc::new(remote.clone()),
        Arc::new(MemoryMirrorStore::new()),
        Box::new(MemoryActionLog::new()),
        SyncConfig::new(),
    )
    .await?;

    let event_listener = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            println!("[Event] {:?}", event);
        }
    });

    let scope = "events/e1/entries";
    let _subscription = engine.subscribe(
        SubscribeRequest::new(scope).with_scope_source("all"),
        |view| println!("[View] {} entr(y/ies)", view.len()),
    )?;

    println!("\n2. Writing while offline...");
    engine
        .upsert(scope, "runner-7", &json!({"name": "A. Runner", "class": "H21"}))
        .await?;
    engine
        .upsert(scope, "runner-9", &json!({"name": "B. Runner", "class": "D21"}))
        .await?;
    println!(
        "   {} action(s) pending, remote holds {} document(s)",
        engine.pending_actions(None).await.len(),
        remote.document_count()
    );

    println!("\n3. Coming back online...");
    let (notifier, signal) = ManualNotifier::new();
    engine.start_auto_flush(Box::new(notifier));
    remote.set_offline(false);
    signal.online();

    for _ in 0..50 {
        if engine.pending_actions(None).await.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    println!(
        "   {} action(s) pending, remote holds {} document(s)",
        engine.pending_actions(None).await.len(),
        remote.document_count()
    );

    println!("\n4. Membership workflow...");
    let membership = engine.membership();
    if let RequestOutcome::Created { request } = membership
        .request("club-1", "runner-7", json!({"message": "Hello"}))
        .await?
    {
        println!("   request created ({} so far)", request.request_count);
    }
    membership
        .process("club-1", "runner-7", Decision::Approve, "admin-1", None)
        .await?;
    match membership.request("club-1", "runner-7", json!({})).await? {
        RequestOutcome::RateLimited { next_allowed_at } => {
            println!("   next request allowed at {}", next_allowed_at)
        }
        other => println!("   unexpected outcome: {:?}", other),
    }

    println!("\n5. Shutting down...");
    engine.shutdown().await?;
    drop(engine);
    let _ = tokio::time::timeout(Duration::from_millis(100), event_listener).await;

    println!("\n=== Embedding Successful ===");
    println!("Key Points:");
    println!("- Writes never block on the network");
    println!("- The queue replays on reconnect, in order");
    println!("- Engine lifecycle is fully controlled by the application");

    Ok(())
}
