//! Offline action queue
//!
//! The queue makes sure a write the caller believes succeeded locally
//! eventually reaches the remote, even across restarts.
//!
//! ## Action Lifecycle
//!
//! ```text
//! enqueue ──► [queued, attempts = 0] ──► flush ──► handler Ok  ──► removed
//!                     ▲                              │
//!                     └──── attempts + 1, last_error ◄┘ handler Err
//! ```
//!
//! ## Guarantees
//!
//! - `enqueue` returns only after the action is durable in the [`ActionLog`]
//! - Actions sharing a scope key reach their handlers in enqueue order
//! - Different scopes replay concurrently
//! - A failing or unhandled action stays queued; nothing is dropped unless
//!   an [`EvictionPolicy`] is configured, and every eviction is reported
//! - At most one flush pass runs at a time

mod handlers;

pub use handlers::ActionHandler;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};

use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::{JoinHandle, JoinSet};
use tokio_stream::StreamExt;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::config::{EvictionPolicy, QueueConfig};
use crate::error::{require_non_empty, Result};
use crate::events::{EventSink, SyncEvent};
use crate::traits::action_log::{ActionContext, ActionLog, OfflineAction};
use crate::traits::connectivity::ConnectivityNotifier;
use handlers::HandlerRegistry;

/// Restricts a flush or an inspection to part of the queue
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushFilter {
    /// Only actions with this scope key
    pub scope_key: Option<String>,
    /// Only actions of this type
    pub action_type: Option<String>,
}

impl FlushFilter {
    /// Filter by scope key
    pub fn scope(scope_key: impl Into<String>) -> Self {
        Self {
            scope_key: Some(scope_key.into()),
            action_type: None,
        }
    }

    /// Filter by action type
    pub fn action_type(action_type: impl Into<String>) -> Self {
        Self {
            scope_key: None,
            action_type: Some(action_type.into()),
        }
    }

    /// Check if an action passes the filter
    pub fn matches(&self, action: &OfflineAction) -> bool {
        self.scope_key
            .as_deref()
            .is_none_or(|scope| action.scope_key() == scope)
            && self
                .action_type
                .as_deref()
                .is_none_or(|kind| action.action_type == kind)
    }
}

/// Outcome of one flush pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Another pass was already running; nothing was done
    pub skipped: bool,
    /// Actions handed to a handler
    pub attempted: usize,
    /// Actions replayed and removed
    pub replayed: usize,
    /// Actions whose handler failed
    pub failed: usize,
    /// Actions left queued because no handler is registered
    pub missing_handler: usize,
    /// Actions held back after an earlier failure in their scope
    pub deferred: usize,
    /// Actions removed by the eviction policy
    pub evicted: usize,
    /// Actions still queued after the pass
    pub remaining: usize,
}

impl FlushReport {
    fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }

    /// Check if every attempted action was replayed
    pub fn is_clean(&self) -> bool {
        !self.skipped && self.failed == 0 && self.missing_handler == 0 && self.deferred == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReplayOutcome {
    Replayed,
    Failed,
    Missing,
}

#[derive(Debug, Default)]
struct GroupOutcome {
    attempted: usize,
    replayed: usize,
    failed: usize,
    missing: usize,
    deferred: usize,
}

/// Durable queue of not-yet-confirmed remote writes
///
/// Cloning is cheap and shares the queue.
#[derive(Clone)]
pub struct OfflineQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    log: Box<dyn ActionLog>,
    // In-memory view of the log, in enqueue order
    pending: Mutex<Vec<OfflineAction>>,
    handlers: HandlerRegistry,
    flushing: AtomicBool,
    auto_flush: StdMutex<Option<JoinHandle<()>>>,
    eviction: EvictionPolicy,
    hold_scope_on_failure: bool,
    events: EventSink,
    clock: Arc<dyn Clock>,
}

/// Clears the flush flag even if the pass is cancelled
struct FlushGuard<'a>(&'a AtomicBool);

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl OfflineQueue {
    /// Open a queue over a durable log, restoring pending actions
    ///
    /// # Parameters
    ///
    /// - `log`: durable storage; its contents are loaded in append order
    /// - `config`: eviction and ordering policy
    /// - `events`: sink for replay events
    /// - `clock`: time source for eviction ages
    pub async fn open(
        log: Box<dyn ActionLog>,
        config: &QueueConfig,
        events: EventSink,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;

        let restored = log.load().await?;
        if !restored.is_empty() {
            info!("Restored {} pending offline action(s)", restored.len());
        }

        Ok(Self {
            inner: Arc::new(QueueInner {
                log,
                pending: Mutex::new(restored),
                handlers: HandlerRegistry::default(),
                flushing: AtomicBool::new(false),
                auto_flush: StdMutex::new(None),
                eviction: config.eviction,
                hold_scope_on_failure: config.hold_scope_on_failure,
                events,
                clock,
            }),
        })
    }

    /// Durably queue an action
    ///
    /// Returns the stored action. Empty `action_type` or scope keys are
    /// rejected before anything is written.
    pub async fn enqueue(
        &self,
        action_type: &str,
        payload: Value,
        context: ActionContext,
    ) -> Result<OfflineAction> {
        require_non_empty("action type", action_type)?;
        require_non_empty("scope key", &context.scope_key)?;

        let mut action = OfflineAction::new(action_type, payload, context);
        action.enqueued_at = self.inner.clock.now();

        // Holding the lock across the append keeps log order and memory
        // order identical
        let mut pending = self.inner.pending.lock().await;
        self.inner.log.append(&action).await?;
        pending.push(action.clone());

        debug!(
            "Queued {} action {} for scope '{}' ({} pending)",
            action.action_type,
            action.id,
            action.scope_key(),
            pending.len()
        );
        Ok(action)
    }

    /// Register the replay handler for an action type
    ///
    /// Registering a type that already has a handler is a no-op and returns
    /// `false`, so call sites can register on every use.
    pub fn register_handler<H>(&self, action_type: &str, handler: H) -> bool
    where
        H: ActionHandler + 'static,
    {
        let registered = self.inner.handlers.register(action_type, Arc::new(handler));
        if registered {
            debug!("Registered offline action handler for '{}'", action_type);
        }
        registered
    }

    /// Register the replay handler for an action type, replacing any existing one
    pub fn replace_handler<H>(&self, action_type: &str, handler: H)
    where
        H: ActionHandler + 'static,
    {
        if self
            .inner
            .handlers
            .replace(action_type, Arc::new(handler))
            .is_some()
        {
            debug!("Replaced offline action handler for '{}'", action_type);
        }
    }

    /// Check if a handler is registered for an action type
    pub fn has_handler(&self, action_type: &str) -> bool {
        self.inner.handlers.contains(action_type)
    }

    /// Pending actions in enqueue order
    pub async fn pending(&self, filter: Option<&FlushFilter>) -> Vec<OfflineAction> {
        self.inner
            .pending
            .lock()
            .await
            .iter()
            .filter(|action| filter.is_none_or(|f| f.matches(action)))
            .cloned()
            .collect()
    }

    /// Number of pending actions
    pub async fn len(&self) -> usize {
        self.inner.pending.lock().await.len()
    }

    /// Check if nothing is pending
    pub async fn is_empty(&self) -> bool {
        self.inner.pending.lock().await.is_empty()
    }

    /// Replay pending actions
    ///
    /// Applies the eviction policy first, then hands every matching action
    /// to its handler. Scopes replay concurrently; within a scope, actions
    /// replay one at a time in enqueue order.
    ///
    /// If a pass is already running, returns immediately with
    /// [`FlushReport::skipped`] set.
    pub async fn flush(&self, filter: Option<&FlushFilter>) -> Result<FlushReport> {
        self.inner.flush(filter).await
    }

    /// Flush whenever the notifier signals connectivity
    ///
    /// Returns `false` (and drops `notifier`) if auto-flush is already armed.
    pub fn start_auto_flush(&self, notifier: Box<dyn ConnectivityNotifier>) -> bool {
        let mut slot = match self.inner.auto_flush.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if slot.as_ref().is_some_and(|handle| !handle.is_finished()) {
            debug!("Auto-flush already armed, ignoring {}", notifier.notifier_name());
            return false;
        }

        info!("Arming auto-flush on {} notifier", notifier.notifier_name());

        // The task only holds a weak reference so it never keeps the queue alive
        let queue: Weak<QueueInner> = Arc::downgrade(&self.inner);
        let mut signals = notifier.watch();
        *slot = Some(tokio::spawn(async move {
            while let Some(event) = signals.next().await {
                if !event.triggers_flush() {
                    debug!("Connectivity event {:?}, not flushing", event);
                    continue;
                }
                let Some(queue) = queue.upgrade() else {
                    break;
                };
                match queue.flush(None).await {
                    Ok(report) if report.skipped => debug!("Auto-flush skipped, pass in progress"),
                    Ok(report) => debug!("Auto-flush: {:?}", report),
                    Err(e) => warn!("Auto-flush failed: {}", e),
                }
            }
            debug!("Connectivity stream ended, auto-flush stopped");
        }));
        true
    }

    /// Disarm auto-flush
    ///
    /// Returns `false` if it was not armed.
    pub fn stop_auto_flush(&self) -> bool {
        let handle = match self.inner.auto_flush.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        match handle {
            Some(handle) => {
                handle.abort();
                info!("Auto-flush disarmed");
                true
            }
            None => false,
        }
    }

    /// Check if auto-flush is armed
    pub fn is_auto_flush_armed(&self) -> bool {
        match self.inner.auto_flush.lock() {
            Ok(guard) => guard.as_ref().is_some_and(|handle| !handle.is_finished()),
            Err(poisoned) => poisoned
                .into_inner()
                .as_ref()
                .is_some_and(|handle| !handle.is_finished()),
        }
    }
}

impl std::fmt::Debug for OfflineQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OfflineQueue")
            .field("handlers", &self.inner.handlers)
            .field("eviction", &self.inner.eviction)
            .field("hold_scope_on_failure", &self.inner.hold_scope_on_failure)
            .finish_non_exhaustive()
    }
}

impl QueueInner {
    async fn flush(self: &Arc<Self>, filter: Option<&FlushFilter>) -> Result<FlushReport> {
        if self
            .flushing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Flush already in progress, skipping");
            return Ok(FlushReport::skipped());
        }
        let _guard = FlushGuard(&self.flushing);

        let evicted = self.evict().await?;

        let groups = {
            let pending = self.pending.lock().await;
            group_by_scope(
                pending
                    .iter()
                    .filter(|action| filter.is_none_or(|f| f.matches(action)))
                    .cloned(),
            )
        };

        let mut report = FlushReport {
            evicted,
            ..FlushReport::default()
        };

        if !groups.is_empty() {
            debug!("Flushing {} scope(s)", groups.len());

            let mut tasks = JoinSet::new();
            for group in groups {
                let queue = Arc::clone(self);
                tasks.spawn(async move { queue.replay_group(group).await });
            }

            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok(outcome) => {
                        report.attempted += outcome.attempted;
                        report.replayed += outcome.replayed;
                        report.failed += outcome.failed;
                        report.missing_handler += outcome.missing;
                        report.deferred += outcome.deferred;
                    }
                    Err(e) => error!("Replay task failed: {}", e),
                }
            }
        }

        report.remaining = self.pending.lock().await.len();

        if report.attempted > 0 || report.evicted > 0 {
            info!(
                "Flush complete: {} replayed, {} failed, {} without handler, {} remaining",
                report.replayed, report.failed, report.missing_handler, report.remaining
            );
        }
        self.events.emit(SyncEvent::FlushCompleted {
            replayed: report.replayed,
            failed: report.failed,
            remaining: report.remaining,
        });

        Ok(report)
    }

    async fn replay_group(&self, group: Vec<OfflineAction>) -> GroupOutcome {
        let mut outcome = GroupOutcome::default();
        let mut held = false;

        for action in group {
            if held {
                outcome.deferred += 1;
                continue;
            }
            outcome.attempted += 1;
            match self.replay_one(action).await {
                ReplayOutcome::Replayed => outcome.replayed += 1,
                ReplayOutcome::Failed => {
                    outcome.failed += 1;
                    held = self.hold_scope_on_failure;
                }
                ReplayOutcome::Missing => {
                    outcome.missing += 1;
                    held = self.hold_scope_on_failure;
                }
            }
        }
        outcome
    }

    async fn replay_one(&self, mut action: OfflineAction) -> ReplayOutcome {
        let Some(handler) = self.handlers.get(&action.action_type) else {
            warn!(
                "No handler registered for action type '{}', leaving action {} queued",
                action.action_type, action.id
            );
            self.events.emit(SyncEvent::HandlerMissing {
                action_id: action.id.clone(),
                action_type: action.action_type.clone(),
            });
            return ReplayOutcome::Missing;
        };

        match handler.handle(&action).await {
            Ok(()) => {
                if let Err(e) = self.log.remove(&action.id).await {
                    // The action may replay again after a restart; handlers are idempotent
                    warn!("Failed to remove replayed action {} from log: {}", action.id, e);
                }
                self.pending.lock().await.retain(|stored| stored.id != action.id);

                debug!("Replayed {} action {}", action.action_type, action.id);
                self.events.emit(SyncEvent::ActionReplayed {
                    action_id: action.id,
                    action_type: action.action_type,
                });
                ReplayOutcome::Replayed
            }
            Err(e) => {
                action.attempts = action.attempts.saturating_add(1);
                action.last_error = Some(e.to_string());

                warn!(
                    "Replay of {} action {} failed (attempt {}): {}",
                    action.action_type, action.id, action.attempts, e
                );

                {
                    let mut pending = self.pending.lock().await;
                    if let Some(stored) = pending.iter_mut().find(|stored| stored.id == action.id) {
                        stored.attempts = action.attempts;
                        stored.last_error = action.last_error.clone();
                    }
                }
                if let Err(e) = self.log.update(&action).await {
                    warn!("Failed to record attempt for action {}: {}", action.id, e);
                }

                self.events.emit(SyncEvent::ActionFailed {
                    action_id: action.id,
                    action_type: action.action_type,
                    attempts: action.attempts,
                    error: e.to_string(),
                });
                ReplayOutcome::Failed
            }
        }
    }

    /// Apply the eviction policy, returning how many actions were dropped
    async fn evict(&self) -> Result<usize> {
        if self.eviction.is_unbounded() {
            return Ok(0);
        }

        let now = self.clock.now();
        let victims: Vec<(OfflineAction, String)> = {
            let mut pending = self.pending.lock().await;
            let mut victims = Vec::new();

            if let Some(max_age) = self.eviction.max_age() {
                let (stale, fresh): (Vec<_>, Vec<_>) = pending
                    .drain(..)
                    .partition(|action| action.is_older_than(max_age, now));
                *pending = fresh;
                victims.extend(stale.into_iter().map(|action| {
                    let reason = format!("older than {}s", max_age.num_seconds());
                    (action, reason)
                }));
            }

            if let Some(max_actions) = self.eviction.max_actions
                && pending.len() > max_actions
            {
                let excess = pending.len() - max_actions;
                victims.extend(pending.drain(..excess).map(|action| {
                    let reason = format!("queue exceeds {} actions", max_actions);
                    (action, reason)
                }));
            }
            victims
        };

        for (action, reason) in &victims {
            warn!(
                "Evicting {} action {} (scope '{}', {} attempts): {}",
                action.action_type,
                action.id,
                action.scope_key(),
                action.attempts,
                reason
            );
            self.log.remove(&action.id).await?;
            self.events.emit(SyncEvent::ActionEvicted {
                action_id: action.id.clone(),
                action_type: action.action_type.clone(),
                reason: reason.clone(),
            });
        }

        Ok(victims.len())
    }
}

/// Split actions into per-scope groups, keeping enqueue order in both
fn group_by_scope<I>(actions: I) -> Vec<Vec<OfflineAction>>
where
    I: IntoIterator<Item = OfflineAction>,
{
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut groups: Vec<Vec<OfflineAction>> = Vec::new();
    for action in actions {
        let slot = *index.entry(action.scope_key().to_string()).or_insert_with(|| {
            groups.push(Vec::new());
            groups.len() - 1
        });
        groups[slot].push(action);
    }
    groups
}
