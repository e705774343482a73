// # Action Log Trait
//
// Defines the durable storage behind the offline action queue.
//
// ## Purpose
//
// Every remote write that could not be confirmed is described by an
// `OfflineAction` and appended to the log before the enqueue call returns.
// The log is replayed into memory on startup so pending writes survive a
// process restart.
//
// ## Implementations
//
// - In-memory: `MemoryActionLog` (tests, ephemeral runtimes)
// - File-based: `FileActionLog` (JSONL, fsync per append)

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Grouping information attached to an action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionContext {
    /// Caller-supplied grouping label; actions sharing it replay in order
    pub scope_key: String,
    /// Human-readable description for logs
    #[serde(default)]
    pub label: String,
}

impl ActionContext {
    /// Create a context for a scope key
    pub fn new(scope_key: impl Into<String>) -> Self {
        Self {
            scope_key: scope_key.into(),
            label: String::new(),
        }
    }

    /// Attach a label
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }
}

/// A durably queued description of a not-yet-confirmed remote write
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfflineAction {
    /// Unique action id
    pub id: String,
    /// Tag selecting the replay handler
    #[serde(rename = "type")]
    pub action_type: String,
    /// Opaque, serializable payload handed to the handler
    pub payload: Value,
    /// Grouping context
    pub context: ActionContext,
    /// When the action was enqueued
    pub enqueued_at: DateTime<Utc>,
    /// Number of failed replay attempts so far
    #[serde(default)]
    pub attempts: u32,
    /// Error from the most recent failed attempt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl OfflineAction {
    /// Create a fresh action with zero attempts
    pub(crate) fn new(action_type: impl Into<String>, payload: Value, context: ActionContext) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            action_type: action_type.into(),
            payload,
            context,
            enqueued_at: Utc::now(),
            attempts: 0,
            last_error: None,
        }
    }

    /// Scope key shortcut
    pub fn scope_key(&self) -> &str {
        &self.context.scope_key
    }

    /// Check if the action has been queued longer than the given duration
    pub fn is_older_than(&self, max_age: chrono::Duration, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.enqueued_at) > max_age
    }
}

/// Trait for durable action log implementations
///
/// The log preserves insertion order; [`ActionLog::load`] returns actions in
/// the order they were appended.
///
/// # Guidelines
///
/// - `append` must not return before the action is durable
/// - `update` rewrites an action in place without changing its position
/// - `remove` of an unknown id is not an error
#[async_trait]
pub trait ActionLog: Send + Sync {
    /// Durably append an action
    async fn append(&self, action: &OfflineAction) -> crate::Result<()>;

    /// Load all actions in append order
    async fn load(&self) -> crate::Result<Vec<OfflineAction>>;

    /// Replace an existing action (matched by id)
    async fn update(&self, action: &OfflineAction) -> crate::Result<()>;

    /// Remove an action by id
    async fn remove(&self, id: &str) -> crate::Result<()>;
}

/// Helper trait for constructing action logs from configuration
pub trait ActionLogFactory: Send + Sync {
    /// Create an ActionLog instance from configuration
    fn create(&self, config: &crate::config::ActionLogConfig) -> crate::Result<Box<dyn ActionLog>>;
}
