//! Architectural Contract Test: Membership Workflow
//!
//! This test verifies the membership request rules: one request per user and
//! club, a cooldown after each decision, and blocks that override everything
//! until explicitly lifted.
//!
//! Constraints verified:
//! - A second request while one is pending is refused, not duplicated
//! - After approval or rejection, a new request waits for the cooldown
//!   measured from the later of the last request and the decision
//! - A block refuses every request until unblock
//! - Membership writes are local-first: they work with the remote down
//!
//! If this test fails, users can flood clubs with requests or get around
//! blocks.

mod common;
use common::*;

use chrono::{DateTime, Duration, Utc};
use orisync_core::membership::{MembershipStatus, requests_scope};
use orisync_core::{
    Decision, ManualClock, MemoryActionLog, MemoryMirrorStore, RequestOutcome, SyncEngine,
};
use serde_json::json;
use std::sync::Arc;

const CLUB: &str = "club-1";
const USER: &str = "user-7";

fn t0() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2025-03-01T09:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

async fn engine_at(clock: &ManualClock, remote: &MockRemote) -> SyncEngine {
    let (engine, _events) = SyncEngine::with_clock(
        Arc::new(MockRemote::sharing_counters_with(remote)),
        Arc::new(MemoryMirrorStore::new()),
        Box::new(MemoryActionLog::new()),
        test_config(),
        Arc::new(clock.clone()),
    )
    .await
    .unwrap();
    engine
}

/// Test: A repeated request while pending is refused
#[tokio::test]
async fn test_second_request_is_already_pending() {
    let clock = ManualClock::new(t0());
    let remote = MockRemote::new();
    let engine = engine_at(&clock, &remote).await;
    let membership = engine.membership();

    let first = membership.request(CLUB, USER, json!({"name": "Ada"})).await.unwrap();
    match first {
        RequestOutcome::Created { request } => {
            assert_eq!(request.status, MembershipStatus::Pending);
            assert_eq!(request.request_count, 1);
            assert_eq!(request.requested_at, t0());
        }
        other => panic!("first request should be created, got {:?}", other),
    }

    let second = membership.request(CLUB, USER, json!({"name": "Ada"})).await.unwrap();
    assert_eq!(second, RequestOutcome::AlreadyPending);

    assert_eq!(
        membership.list_requests(CLUB, None).unwrap().len(),
        1,
        "A user must never hold two requests in one club"
    );
    assert_eq!(
        remote.document(&requests_scope(CLUB), USER).unwrap()["status"],
        "pending",
        "Request should reach the remote when it is available"
    );
}

/// Test: Rejection starts a cooldown anchored at the decision
#[tokio::test]
async fn test_cooldown_after_rejection() {
    let clock = ManualClock::new(t0());
    let remote = MockRemote::new();
    let engine = engine_at(&clock, &remote).await;
    let membership = engine.membership();

    membership.request(CLUB, USER, json!({})).await.unwrap();

    clock.advance(Duration::minutes(1));
    let rejected = membership
        .process(CLUB, USER, Decision::Reject, "admin-1", Some("club full".into()))
        .await
        .unwrap();
    assert_eq!(rejected.status, MembershipStatus::Rejected);
    assert_eq!(rejected.rejection_reason.as_deref(), Some("club full"));
    assert_eq!(rejected.processed_at, Some(t0() + Duration::minutes(1)));

    clock.advance(Duration::minutes(1));
    let limited = membership.request(CLUB, USER, json!({})).await.unwrap();
    assert_eq!(
        limited,
        RequestOutcome::RateLimited {
            next_allowed_at: t0() + Duration::minutes(1) + Duration::hours(12)
        },
        "Cooldown must be measured from the rejection"
    );

    clock.set(t0() + Duration::minutes(1) + Duration::hours(12) + Duration::seconds(1));
    match membership.request(CLUB, USER, json!({})).await.unwrap() {
        RequestOutcome::Created { request } => {
            assert_eq!(request.request_count, 2);
            assert_eq!(request.status, MembershipStatus::Pending);
            assert_eq!(request.processed_by, None);
            assert_eq!(request.requested_at, t0(), "First request time is kept");
        }
        other => panic!("request after cooldown should be created, got {:?}", other),
    }
}

/// Test: Approval also rate-limits renewed requests
#[tokio::test]
async fn test_cooldown_after_approval() {
    let clock = ManualClock::new(t0());
    let engine = engine_at(&clock, &MockRemote::new()).await;
    let membership = engine.membership();

    membership.request(CLUB, USER, json!({})).await.unwrap();
    membership
        .process(CLUB, USER, Decision::Approve, "admin-1", None)
        .await
        .unwrap();

    clock.advance(Duration::hours(11));
    assert!(matches!(
        membership.request(CLUB, USER, json!({})).await.unwrap(),
        RequestOutcome::RateLimited { .. }
    ));

    let approved = membership.list_requests(CLUB, Some(MembershipStatus::Approved)).unwrap();
    assert_eq!(approved.len(), 1);
    assert!(membership.list_requests(CLUB, Some(MembershipStatus::Pending)).unwrap().is_empty());
}

/// Test: A block refuses requests until lifted
#[tokio::test]
async fn test_block_until_unblocked() {
    let clock = ManualClock::new(t0());
    let engine = engine_at(&clock, &MockRemote::new()).await;
    let membership = engine.membership();

    membership.request(CLUB, USER, json!({})).await.unwrap();
    let blocked = membership
        .process(CLUB, USER, Decision::Block, "admin-1", Some("spam".into()))
        .await
        .unwrap();
    assert_eq!(blocked.status, MembershipStatus::Blocked);
    assert!(membership.is_blocked(CLUB, USER).unwrap());
    assert_eq!(
        membership.get_block(CLUB, USER).unwrap().unwrap().blocked_by,
        "admin-1"
    );

    clock.advance(Duration::days(365));
    assert_eq!(
        membership.request(CLUB, USER, json!({})).await.unwrap(),
        RequestOutcome::Blocked,
        "A block must hold regardless of elapsed time"
    );

    assert!(membership.unblock(CLUB, USER).await.unwrap());
    assert!(!membership.unblock(CLUB, USER).await.unwrap(), "Second unblock is a no-op");

    match membership.request(CLUB, USER, json!({})).await.unwrap() {
        RequestOutcome::Created { request } => assert_eq!(request.request_count, 2),
        other => panic!("request after unblock should be created, got {:?}", other),
    }
}

/// Test: The workflow keeps working with the remote down
#[tokio::test]
async fn test_membership_offline_is_queued() {
    let clock = ManualClock::new(t0());
    let remote = MockRemote::offline();
    let engine = engine_at(&clock, &remote).await;
    let membership = engine.membership();

    assert!(matches!(
        membership.request(CLUB, USER, json!({})).await.unwrap(),
        RequestOutcome::Created { .. }
    ));
    assert_eq!(
        membership.request(CLUB, USER, json!({})).await.unwrap(),
        RequestOutcome::AlreadyPending,
        "Rules must be enforced against the local mirror while offline"
    );
    assert_eq!(engine.pending_actions(None).await.len(), 1);

    remote.set_offline(false);
    let report = engine.flush_offline_actions(None).await.unwrap();
    assert_eq!(report.replayed, 1);
    assert_eq!(
        remote.document(&requests_scope(CLUB), USER).unwrap()["requestCount"],
        1
    );
}

/// Test: Empty identifiers are rejected
#[tokio::test]
async fn test_membership_rejects_empty_ids() {
    let clock = ManualClock::new(t0());
    let engine = engine_at(&clock, &MockRemote::new()).await;
    let membership = engine.membership();

    tokio_test::assert_err!(membership.request("", USER, json!({})).await);
    tokio_test::assert_err!(membership.request(CLUB, "", json!({})).await);
    assert!(
        membership
            .process(CLUB, USER, Decision::Approve, "", None)
            .await
            .is_err()
    );
}
