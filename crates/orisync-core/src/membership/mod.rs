//! Club membership request workflow
//!
//! ## States
//!
//! ```text
//!            request                 process
//! (absent) ──────────► pending ──────────────► approved ─┐
//!                         │  ├───────────────► rejected ─┤ request after cooldown
//!                         │  └───────────────► blocked    │
//!                         ▲                               │
//!                         └───────────────────────────────┘
//! ```
//!
//! A request is keyed by user id inside its club, so "create" is an
//! idempotent upsert and a user never has two requests in one club. A block
//! record supersedes any request until it is explicitly removed.
//!
//! Writes go through the engine's local-first path: they are visible locally
//! at once and reach the remote when it is available.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::MembershipConfig;
use crate::engine::SyncEngine;
use crate::error::{require_non_empty, Result};
use crate::traits::action_log::ActionContext;
use crate::traits::mirror_store::ListQuery;

/// Mirror scope holding a club's requests
pub fn requests_scope(club_id: &str) -> String {
    format!("clubs/{}/membershipRequests", club_id)
}

/// Mirror scope holding a club's blocks
pub fn blocks_scope(club_id: &str) -> String {
    format!("clubs/{}/membershipBlocks", club_id)
}

/// Request status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MembershipStatus {
    /// Waiting for a decision
    Pending,
    /// Accepted
    Approved,
    /// Declined; may be renewed after the cooldown
    Rejected,
    /// Declined with a block record
    Blocked,
}

impl MembershipStatus {
    /// Lowercase name as stored
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Blocked => "blocked",
        }
    }

    fn is_rate_limited(self) -> bool {
        matches!(self, Self::Approved | Self::Rejected)
    }
}

/// A user's request to join a club
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MembershipRequest {
    /// User id
    pub id: String,
    /// Club id
    pub club_id: String,
    /// Current status
    pub status: MembershipStatus,
    /// How many times the user has requested
    pub request_count: u32,
    /// First request ever
    pub requested_at: DateTime<Utc>,
    /// Most recent request
    pub last_request_at: DateTime<Utc>,
    /// Last modification
    pub updated_at: DateTime<Utc>,
    /// Administrator who made the last decision
    pub processed_by: Option<String>,
    /// When the last decision was made
    pub processed_at: Option<DateTime<Utc>>,
    /// Reason given with a rejection or block
    pub rejection_reason: Option<String>,
    /// Applicant-supplied fields
    #[serde(default)]
    pub details: Value,
}

impl MembershipRequest {
    /// Point in time the cooldown is measured from
    pub fn cooldown_anchor(&self) -> DateTime<Utc> {
        match self.processed_at {
            Some(processed_at) => processed_at.max(self.last_request_at),
            None => self.last_request_at,
        }
    }
}

/// Administrative record preventing further requests
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MembershipBlock {
    /// User id
    pub id: String,
    /// Club id
    pub club_id: String,
    /// Why the user was blocked
    pub reason: Option<String>,
    /// Administrator who blocked the user
    pub blocked_by: String,
    /// When the block was created
    pub blocked_at: DateTime<Utc>,
}

/// Administrative decision on a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    /// Accept the request
    Approve,
    /// Decline the request
    Reject,
    /// Decline and block further requests
    Block,
}

impl Decision {
    fn status(self) -> MembershipStatus {
        match self {
            Self::Approve => MembershipStatus::Approved,
            Self::Reject => MembershipStatus::Rejected,
            Self::Block => MembershipStatus::Blocked,
        }
    }
}

/// Result of a membership request
#[derive(Debug, Clone, PartialEq)]
pub enum RequestOutcome {
    /// A new or renewed request is pending
    Created {
        /// The stored request
        request: MembershipRequest,
    },
    /// A request is already waiting for a decision
    AlreadyPending,
    /// The cooldown since the last request or decision has not elapsed
    RateLimited {
        /// Earliest time a new request is accepted
        next_allowed_at: DateTime<Utc>,
    },
    /// The user is blocked from this club
    Blocked,
}

/// Membership workflow bound to an engine
///
/// Obtain one with [`SyncEngine::membership`]. Mutations are serialized
/// per engine, so concurrent requests for the same user cannot both pass
/// the pending check.
#[derive(Clone)]
pub struct MembershipWorkflow {
    engine: SyncEngine,
    config: MembershipConfig,
    lock: Arc<Mutex<()>>,
}

impl MembershipWorkflow {
    pub(crate) fn new(engine: SyncEngine, config: MembershipConfig, lock: Arc<Mutex<()>>) -> Self {
        Self {
            engine,
            config,
            lock,
        }
    }

    /// Ask to join a club
    pub async fn request(
        &self,
        club_id: &str,
        user_id: &str,
        details: Value,
    ) -> Result<RequestOutcome> {
        require_non_empty("club id", club_id)?;
        require_non_empty("user id", user_id)?;

        let _guard = self.lock.lock().await;
        let now = self.engine.clock().now();

        if self.get_block(club_id, user_id)?.is_some() {
            debug!("Membership request from {} to club {} refused: blocked", user_id, club_id);
            return Ok(RequestOutcome::Blocked);
        }

        let existing = self.get_request(club_id, user_id)?;
        if let Some(existing) = &existing {
            if existing.status == MembershipStatus::Pending {
                return Ok(RequestOutcome::AlreadyPending);
            }
            if existing.status.is_rate_limited() {
                let next_allowed_at = existing
                    .cooldown_anchor()
                    .checked_add_signed(self.config.cooldown())
                    .unwrap_or(DateTime::<Utc>::MAX_UTC);
                if now < next_allowed_at {
                    debug!(
                        "Membership request from {} to club {} rate limited until {}",
                        user_id, club_id, next_allowed_at
                    );
                    return Ok(RequestOutcome::RateLimited { next_allowed_at });
                }
            }
        }

        let request = match existing {
            Some(previous) => MembershipRequest {
                status: MembershipStatus::Pending,
                request_count: previous.request_count.saturating_add(1),
                last_request_at: previous.last_request_at.max(now),
                updated_at: now,
                processed_by: None,
                processed_at: None,
                rejection_reason: None,
                details,
                ..previous
            },
            None => MembershipRequest {
                id: user_id.to_string(),
                club_id: club_id.to_string(),
                status: MembershipStatus::Pending,
                request_count: 1,
                requested_at: now,
                last_request_at: now,
                updated_at: now,
                processed_by: None,
                processed_at: None,
                rejection_reason: None,
                details,
            },
        };

        self.write_request(&request).await?;
        info!(
            "Membership request #{} from {} to club {} is pending",
            request.request_count, user_id, club_id
        );
        Ok(RequestOutcome::Created { request })
    }

    /// Record an administrative decision
    ///
    /// Always permitted, whatever the current status. A `Block` decision
    /// also creates the block record.
    pub async fn process(
        &self,
        club_id: &str,
        user_id: &str,
        decision: Decision,
        processed_by: &str,
        reason: Option<String>,
    ) -> Result<MembershipRequest> {
        require_non_empty("club id", club_id)?;
        require_non_empty("user id", user_id)?;
        require_non_empty("processed by", processed_by)?;

        let _guard = self.lock.lock().await;
        let now = self.engine.clock().now();

        let base = match self.get_request(club_id, user_id)? {
            Some(existing) => existing,
            None => MembershipRequest {
                id: user_id.to_string(),
                club_id: club_id.to_string(),
                status: MembershipStatus::Pending,
                request_count: 0,
                requested_at: now,
                last_request_at: now,
                updated_at: now,
                processed_by: None,
                processed_at: None,
                rejection_reason: None,
                details: Value::Null,
            },
        };

        let request = MembershipRequest {
            status: decision.status(),
            updated_at: now,
            processed_by: Some(processed_by.to_string()),
            processed_at: Some(now),
            rejection_reason: match decision {
                Decision::Approve => None,
                Decision::Reject | Decision::Block => reason.clone(),
            },
            ..base
        };
        self.write_request(&request).await?;

        if decision == Decision::Block {
            let block = MembershipBlock {
                id: user_id.to_string(),
                club_id: club_id.to_string(),
                reason,
                blocked_by: processed_by.to_string(),
                blocked_at: now,
            };
            self.engine
                .upsert_with_context(
                    &blocks_scope(club_id),
                    user_id,
                    &block,
                    member_context(club_id, user_id, "block"),
                )
                .await?;
        }

        info!(
            "Membership request from {} to club {} {} by {}",
            user_id,
            club_id,
            request.status.as_str(),
            processed_by
        );
        Ok(request)
    }

    /// Remove a block
    ///
    /// The request record is left as it is. Returns `false` if the user was
    /// not blocked.
    pub async fn unblock(&self, club_id: &str, user_id: &str) -> Result<bool> {
        require_non_empty("club id", club_id)?;
        require_non_empty("user id", user_id)?;

        let _guard = self.lock.lock().await;
        let removed = self
            .engine
            .remove_with_context(
                &blocks_scope(club_id),
                user_id,
                member_context(club_id, user_id, "unblock"),
            )
            .await?;
        if removed {
            info!("Unblocked {} in club {}", user_id, club_id);
        }
        Ok(removed)
    }

    /// Current request of a user
    pub fn get_request(&self, club_id: &str, user_id: &str) -> Result<Option<MembershipRequest>> {
        Ok(self
            .engine
            .get_as::<MembershipRequest>(&requests_scope(club_id), user_id)?
            .map(|record| record.payload))
    }

    /// Current block of a user
    pub fn get_block(&self, club_id: &str, user_id: &str) -> Result<Option<MembershipBlock>> {
        Ok(self
            .engine
            .get_as::<MembershipBlock>(&blocks_scope(club_id), user_id)?
            .map(|record| record.payload))
    }

    /// Check if a user is blocked
    pub fn is_blocked(&self, club_id: &str, user_id: &str) -> Result<bool> {
        Ok(self.get_block(club_id, user_id)?.is_some())
    }

    /// Requests of a club, most recently updated first
    pub fn list_requests(
        &self,
        club_id: &str,
        status: Option<MembershipStatus>,
    ) -> Result<Vec<MembershipRequest>> {
        let mut query = ListQuery::default();
        if let Some(status) = status {
            query = query.where_eq("status", status.as_str());
        }
        self.engine
            .list(&requests_scope(club_id), &query)
            .iter()
            .map(|record| {
                record
                    .decode::<MembershipRequest>()
                    .map(|decoded| decoded.payload)
            })
            .collect()
    }

    async fn write_request(&self, request: &MembershipRequest) -> Result<()> {
        self.engine
            .upsert_with_context(
                &requests_scope(&request.club_id),
                &request.id,
                request,
                member_context(&request.club_id, &request.id, "request"),
            )
            .await?;
        Ok(())
    }
}

impl std::fmt::Debug for MembershipWorkflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MembershipWorkflow")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

// Requests and blocks of one member share a scope key so they replay in order
fn member_context(club_id: &str, user_id: &str, label: &str) -> ActionContext {
    ActionContext::new(format!("clubs/{}/members/{}", club_id, user_id))
        .with_label(format!("membership {} {}", label, user_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn request_at(status: MembershipStatus, last: DateTime<Utc>, processed: Option<DateTime<Utc>>) -> MembershipRequest {
        MembershipRequest {
            id: "u1".into(),
            club_id: "c1".into(),
            status,
            request_count: 1,
            requested_at: last,
            last_request_at: last,
            updated_at: last,
            processed_by: processed.map(|_| "admin".to_string()),
            processed_at: processed,
            rejection_reason: None,
            details: json!({}),
        }
    }

    #[test]
    fn test_cooldown_anchor_is_latest_of_request_and_decision() {
        let t0 = Utc::now();
        let pending = request_at(MembershipStatus::Pending, t0, None);
        assert_eq!(pending.cooldown_anchor(), t0);

        let rejected = request_at(MembershipStatus::Rejected, t0, Some(t0 + Duration::minutes(1)));
        assert_eq!(rejected.cooldown_anchor(), t0 + Duration::minutes(1));
    }

    #[test]
    fn test_request_serializes_camel_case_with_nulls() {
        let request = request_at(MembershipStatus::Pending, Utc::now(), None);
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["status"], "pending");
        assert_eq!(value["requestCount"], 1);
        // Null processing fields clear old values when merged into the mirror
        assert!(value.get("processedBy").is_some_and(Value::is_null));
    }

    #[test]
    fn test_scopes() {
        assert_eq!(requests_scope("c1"), "clubs/c1/membershipRequests");
        assert_eq!(blocks_scope("c1"), "clubs/c1/membershipBlocks");
        assert!(MembershipStatus::Rejected.is_rate_limited());
        assert!(!MembershipStatus::Blocked.is_rate_limited());
    }
}
