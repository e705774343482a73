//! Architectural Contract Test: Subscription Merge
//!
//! This test verifies that several live remote queries and the local mirror
//! are merged into one de-duplicated view.
//!
//! Constraints verified:
//! - One entry per id, the copy most recently reported as changed wins
//! - A stale copy re-delivered by another source never replaces a newer one
//! - Remote snapshots are written back into the mirror
//! - A failing source counts as empty and is reported, not propagated
//! - Cached data is delivered immediately, even with no remote at all
//! - No callback fires after unsubscribe
//!
//! If this test fails, lists can show duplicates, flip between versions, or
//! go blank while offline.

mod common;
use common::*;

use chrono::{DateTime, Utc};
use orisync_core::traits::{MirrorStore, MirroredRecord, RemoteDocument};
use orisync_core::{
    AccessPolicy, MemoryActionLog, MemoryMirrorStore, QueryDescriptor, SubscribeRequest, SyncEvent,
};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const SCOPE: &str = "events/e1/entries";

fn two_source_request() -> SubscribeRequest {
    SubscribeRequest::new(SCOPE)
        .with_source(QueryDescriptor::new("owner", SCOPE).where_eq("ownerId", "u1"))
        .with_source(QueryDescriptor::new("club:A", SCOPE).where_eq("clubId", "A"))
}

fn version_of(view: &[MirroredRecord], id: &str) -> Option<i64> {
    view.iter()
        .find(|record| record.id == id)
        .and_then(|record| record.payload["v"].as_i64())
}

/// Test: Two sources reporting the same id merge into the newer copy
#[tokio::test]
async fn test_same_id_from_two_sources_merges() {
    let remote = MockRemote::new();
    let mirror = MemoryMirrorStore::new();
    let (engine, _events) = engine_with(&remote, &mirror, &MemoryActionLog::new()).await;

    let (callback, mut views) = view_channel();
    let _subscription = engine.subscribe(two_source_request(), callback).unwrap();

    assert!(remote.push("owner", vec![doc("x", json!({"v": 1, "ownerId": "u1"}))]));
    next_view(&mut views, |view| version_of(view, "x") == Some(1)).await;

    tokio::time::sleep(Duration::from_millis(5)).await;
    assert!(remote.push("club:A", vec![doc("x", json!({"v": 2, "ownerId": "u1", "clubId": "A"}))]));
    let view = next_view(&mut views, |view| version_of(view, "x") == Some(2)).await;

    assert_eq!(
        view.iter().filter(|record| record.id == "x").count(),
        1,
        "Merged view must hold exactly one entry per id"
    );
    let mirrored = mirror.get(SCOPE, "x").expect("written back to mirror");
    assert_eq!(mirrored.payload["v"], 2);
    assert!(!mirrored.pending_write);
}

/// Test: An unchanged stale copy never wins again
#[tokio::test]
async fn test_stale_copy_never_reappears() {
    let remote = MockRemote::new();
    let mirror = MemoryMirrorStore::new();
    let (engine, _events) = engine_with(&remote, &mirror, &MemoryActionLog::new()).await;

    let (callback, mut views) = view_channel();
    let _subscription = engine.subscribe(two_source_request(), callback).unwrap();

    remote.push("owner", vec![doc("x", json!({"v": 1}))]);
    next_view(&mut views, |view| version_of(view, "x") == Some(1)).await;
    tokio::time::sleep(Duration::from_millis(5)).await;
    remote.push("club:A", vec![doc("x", json!({"v": 2}))]);
    next_view(&mut views, |view| version_of(view, "x") == Some(2)).await;

    // The owner source re-reports its old copy together with a new record
    remote.push("owner", vec![doc("x", json!({"v": 1})), doc("y", json!({"v": 1}))]);
    let view = next_view(&mut views, |view| version_of(view, "y").is_some()).await;

    assert_eq!(version_of(&view, "x"), Some(2), "Stale copy must not replace the newer one");
    assert_eq!(mirror.get(SCOPE, "x").unwrap().payload["v"], 2);
}

/// Test: The latest report wins, server timestamps only order the view
#[tokio::test]
async fn test_latest_report_wins_timestamps_order() {
    let remote = MockRemote::new();
    let mirror = MemoryMirrorStore::new();
    let (engine, _events) = engine_with(&remote, &mirror, &MemoryActionLog::new()).await;

    let (callback, mut views) = view_channel();
    let _subscription = engine.subscribe(two_source_request(), callback).unwrap();

    let at = |s: &str| DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc);
    remote.push(
        "owner",
        vec![RemoteDocument {
            id: "x".into(),
            data: json!({"v": 2}),
            updated_at: Some(at("2025-06-01T12:00:00Z")),
        }],
    );
    next_view(&mut views, |view| version_of(view, "x") == Some(2)).await;

    // Reported later with an older server time: still the newest report
    remote.push(
        "club:A",
        vec![
            RemoteDocument {
                id: "x".into(),
                data: json!({"v": 1}),
                updated_at: Some(at("2025-06-01T11:00:00Z")),
            },
            RemoteDocument {
                id: "z".into(),
                data: json!({"v": 1}),
                updated_at: Some(at("2025-06-01T13:00:00Z")),
            },
        ],
    );
    let view = next_view(&mut views, |view| version_of(view, "z").is_some()).await;
    assert_eq!(version_of(&view, "x"), Some(1));
    assert_eq!(mirror.get(SCOPE, "x").unwrap().payload["v"], 1);

    let ids: Vec<&str> = view.iter().map(|record| record.id.as_str()).collect();
    assert_eq!(ids, vec!["z", "x"], "View must be ordered newest first");
}

/// Test: A failing source counts as empty and emits an event
#[tokio::test]
async fn test_source_error_counts_as_empty() {
    let remote = MockRemote::new();
    let (engine, mut events) =
        engine_with(&remote, &MemoryMirrorStore::new(), &MemoryActionLog::new()).await;

    let (callback, mut views) = view_channel();
    let _subscription = engine.subscribe(two_source_request(), callback).unwrap();

    remote.push("owner", vec![doc("a", json!({"v": 1}))]);
    remote.push("club:A", vec![doc("b", json!({"v": 1}))]);
    next_view(&mut views, |view| view.len() == 2).await;

    remote.fail_source("club:A", "permission denied");
    let view = next_view(&mut views, |view| view.len() == 1).await;
    assert_eq!(view[0].id, "a");

    let event = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(SyncEvent::SourceError { source_key, error }) = events.recv().await {
                return (source_key, error);
            }
        }
    })
    .await
    .expect("SourceError event emitted");
    assert_eq!(event.0, "club:A");
    assert!(event.1.contains("permission denied"));

    // The source recovers on its next delivery
    remote.push("club:A", vec![doc("b", json!({"v": 2}))]);
    next_view(&mut views, |view| version_of(view, "b") == Some(2)).await;
}

/// Test: Cached records are delivered at once when the remote is silent
#[tokio::test]
async fn test_offline_launch_serves_mirror() {
    let mirror = MemoryMirrorStore::new();
    mirror.put_many(
        SCOPE,
        vec![
            MirroredRecord::confirmed("a", json!({"v": 1}), Utc::now()),
            MirroredRecord::confirmed("b", json!({"v": 1}), Utc::now()),
        ],
    );
    let remote = MockRemote::offline();
    let (engine, _events) = engine_with(&remote, &mirror, &MemoryActionLog::new()).await;

    let (callback, mut views) = view_channel();
    let _subscription = engine.subscribe(two_source_request(), callback).unwrap();

    let first = views.try_recv().expect("initial view delivered during subscribe");
    assert_eq!(first.len(), 2, "Cached records must show before any source delivers");
}

/// Test: A local pending write shows next to live remote data
#[tokio::test]
async fn test_pending_local_write_is_visible() {
    let remote = MockRemote::offline();
    let (engine, _events) =
        engine_with(&remote, &MemoryMirrorStore::new(), &MemoryActionLog::new()).await;

    let (callback, mut views) = view_channel();
    let _subscription = engine
        .subscribe(SubscribeRequest::new(SCOPE).with_scope_source("all"), callback)
        .unwrap();

    remote.push("all", vec![doc("a", json!({"v": 1}))]);
    next_view(&mut views, |view| view.len() == 1).await;

    engine.upsert(SCOPE, "local", &json!({"v": 1})).await.unwrap();
    let view = next_view(&mut views, |view| view.len() == 2).await;
    let local = view.iter().find(|record| record.id == "local").unwrap();
    assert!(local.pending_write);
}

/// Test: The access policy filters the merged view
#[tokio::test]
async fn test_access_policy_filters_view() {
    let remote = MockRemote::new();
    let (engine, _events) =
        engine_with(&remote, &MemoryMirrorStore::new(), &MemoryActionLog::new()).await;

    let request = SubscribeRequest::new(SCOPE)
        .with_scope_source("all")
        .with_access(AccessPolicy::owner("u1").with_groups(["A"]));
    let (callback, mut views) = view_channel();
    let _subscription = engine.subscribe(request, callback).unwrap();

    remote.push(
        "all",
        vec![
            doc("mine", json!({"ownerId": "u1"})),
            doc("club", json!({"ownerId": "u2", "clubId": "A"})),
            doc("other", json!({"ownerId": "u2", "clubId": "B"})),
        ],
    );
    let view = next_view(&mut views, |view| !view.is_empty()).await;
    let mut ids: Vec<&str> = view.iter().map(|record| record.id.as_str()).collect();
    ids.sort();
    assert_eq!(ids, vec!["club", "mine"]);
}

/// Test: No callback fires after unsubscribe
#[tokio::test]
async fn test_no_callback_after_unsubscribe() {
    let remote = MockRemote::new();
    let (engine, mut events) =
        engine_with(&remote, &MemoryMirrorStore::new(), &MemoryActionLog::new()).await;

    let deliveries = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&deliveries);
    let mut subscription = engine
        .subscribe(
            SubscribeRequest::new(SCOPE).with_scope_source("all"),
            move |_view| {
                counter.fetch_add(1, Ordering::SeqCst);
            },
        )
        .unwrap();
    assert_eq!(deliveries.load(Ordering::SeqCst), 1, "Initial view delivered");

    subscription.unsubscribe();
    assert!(!subscription.is_active());

    remote.push("all", vec![doc("a", json!({"v": 1}))]);
    engine.upsert(SCOPE, "b", &json!({"v": 1})).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(
        deliveries.load(Ordering::SeqCst),
        1,
        "Callback must not fire after unsubscribe"
    );

    let unsubscribed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(SyncEvent::Unsubscribed { scope }) = events.recv().await {
                return scope;
            }
        }
    })
    .await
    .expect("Unsubscribed event emitted");
    assert_eq!(unsubscribed, SCOPE);
}

/// Test: Duplicate source keys are rejected
#[tokio::test]
async fn test_duplicate_source_keys_rejected() {
    let (engine, _events) =
        engine_with(&MockRemote::new(), &MemoryMirrorStore::new(), &MemoryActionLog::new()).await;
    let request = SubscribeRequest::new(SCOPE)
        .with_scope_source("owner")
        .with_scope_source("owner");
    assert!(engine.subscribe(request, |_| {}).is_err());
}
