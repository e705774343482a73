//! Sync engine
//!
//! The SyncEngine is the entry point resource modules talk to. It owns:
//! - The local mirror (read-after-write and offline fallback)
//! - The offline action queue and its handler registry
//! - The subscription merger
//! - The remote adapter
//!
//! ## Architecture
//!
//! ```text
//!                      ┌──────────────┐
//!    upsert/remove ───►│  SyncEngine  │◄─── subscribe
//!                      └──────────────┘
//!                              │
//!       ┌──────────────────────┼──────────────────────┐
//!       │                      │                      │
//!       ▼                      ▼                      ▼
//! ┌─────────────┐      ┌──────────────┐      ┌────────────────┐
//! │ MirrorStore │      │RemoteAdapter │      │  OfflineQueue  │
//! │ (sync, now) │      │ (best effort)│─err─►│ (durable, FIFO │
//! └─────────────┘      └──────────────┘      │  per scope)    │
//!                                            └────────────────┘
//! ```
//!
//! ## Write Flow
//!
//! 1. Apply the write to the mirror (visible to the next read)
//! 2. If earlier actions for the same scope key are queued, queue behind them
//! 3. Otherwise attempt the remote write once
//! 4. On failure, durably queue a `remote.upsert` / `remote.delete` action
//!
//! Remote failures never reach the caller.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::{MembershipConfig, SyncConfig};
use crate::error::{require_non_empty, Result};
use crate::events::{EventSink, SyncEvent};
use crate::membership::MembershipWorkflow;
use crate::merger::{SubscribeRequest, Subscription, SubscriptionMerger};
use crate::queue::{ActionHandler, FlushFilter, FlushReport, OfflineQueue};
use crate::traits::action_log::{ActionContext, ActionLog, OfflineAction};
use crate::traits::connectivity::ConnectivityNotifier;
use crate::traits::mirror_store::{ListQuery, MirrorStore, MirroredRecord};
use crate::traits::remote::RemoteAdapter;

/// Action type replaying a queued upsert
pub const REMOTE_UPSERT: &str = "remote.upsert";

/// Action type replaying a queued delete
pub const REMOTE_DELETE: &str = "remote.delete";

/// Payload of the built-in actions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteWritePayload {
    /// Collection scope
    pub scope: String,
    /// Record id
    pub id: String,
    /// Full record payload (upserts only)
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

impl RemoteWritePayload {
    fn decode(action: &OfflineAction) -> Result<Self> {
        Ok(serde_json::from_value(action.payload.clone())?)
    }
}

/// Clear the pending flag if the mirror still holds what was written
fn confirm_if_current(mirror: &dyn MirrorStore, scope: &str, id: &str, written: &Value) {
    if let Some(current) = mirror.get(scope, id)
        && current.payload == *written
    {
        mirror.mark_confirmed(scope, id);
    }
}

struct RemoteUpsertHandler {
    remote: Arc<dyn RemoteAdapter>,
    mirror: Arc<dyn MirrorStore>,
}

#[async_trait]
impl ActionHandler for RemoteUpsertHandler {
    async fn handle(&self, action: &OfflineAction) -> Result<()> {
        let payload = RemoteWritePayload::decode(action)?;
        self.remote.write(&payload.scope, &payload.id, &payload.data).await?;
        confirm_if_current(self.mirror.as_ref(), &payload.scope, &payload.id, &payload.data);
        Ok(())
    }
}

struct RemoteDeleteHandler {
    remote: Arc<dyn RemoteAdapter>,
}

#[async_trait]
impl ActionHandler for RemoteDeleteHandler {
    async fn handle(&self, action: &OfflineAction) -> Result<()> {
        let payload = RemoteWritePayload::decode(action)?;
        self.remote.delete(&payload.scope, &payload.id).await
    }
}

/// Local-first sync engine
///
/// Cloning is cheap; clones share all state. There is no process-wide
/// instance: each engine owns its own mirror, queue and handlers.
///
/// ## Lifecycle
///
/// 1. Create with [`SyncEngine::new()`] (or [`SyncEngine::with_clock()`])
/// 2. Optionally arm replay with [`SyncEngine::start_auto_flush()`]
/// 3. Read and write through the engine
/// 4. Call [`SyncEngine::shutdown()`] to disarm replay and flush the mirror
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    remote: Arc<dyn RemoteAdapter>,
    mirror: Arc<dyn MirrorStore>,
    queue: OfflineQueue,
    merger: SubscriptionMerger,
    events: EventSink,
    clock: Arc<dyn Clock>,
    membership: MembershipConfig,
    membership_lock: Arc<tokio::sync::Mutex<()>>,
    // Held from the pending check until the write is sent or queued
    write_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl SyncEngine {
    /// Create a new engine
    ///
    /// # Parameters
    ///
    /// - `remote`: Remote backend (use `UnconfiguredRemote` for none)
    /// - `mirror`: Local mirror store
    /// - `action_log`: Durable storage for the offline queue; pending actions
    ///   in it are restored
    /// - `config`: Sync configuration
    ///
    /// # Returns
    ///
    /// A tuple of (engine, event_receiver) where event_receiver yields sync events
    pub async fn new(
        remote: Arc<dyn RemoteAdapter>,
        mirror: Arc<dyn MirrorStore>,
        action_log: Box<dyn ActionLog>,
        config: SyncConfig,
    ) -> Result<(Self, mpsc::Receiver<SyncEvent>)> {
        Self::with_clock(remote, mirror, action_log, config, Arc::new(SystemClock)).await
    }

    /// Create a new engine with an explicit time source
    pub async fn with_clock(
        remote: Arc<dyn RemoteAdapter>,
        mirror: Arc<dyn MirrorStore>,
        action_log: Box<dyn ActionLog>,
        config: SyncConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<(Self, mpsc::Receiver<SyncEvent>)> {
        config.validate()?;

        let (events, rx) = EventSink::channel(config.engine.event_channel_capacity);
        let queue = OfflineQueue::open(action_log, &config.queue, events.clone(), Arc::clone(&clock)).await?;

        queue.register_handler(
            REMOTE_UPSERT,
            RemoteUpsertHandler {
                remote: Arc::clone(&remote),
                mirror: Arc::clone(&mirror),
            },
        );
        queue.register_handler(
            REMOTE_DELETE,
            RemoteDeleteHandler {
                remote: Arc::clone(&remote),
            },
        );

        let merger = SubscriptionMerger::new(
            Arc::clone(&mirror),
            Arc::clone(&remote),
            events.clone(),
            Arc::clone(&clock),
        );

        info!(
            "Sync engine ready (remote: {}, {} pending action(s))",
            remote.adapter_name(),
            queue.len().await
        );

        let engine = Self {
            inner: Arc::new(EngineInner {
                remote,
                mirror,
                queue,
                merger,
                events,
                clock,
                membership: config.membership,
                membership_lock: Arc::new(tokio::sync::Mutex::new(())),
                write_locks: Mutex::new(HashMap::new()),
            }),
        };
        Ok((engine, rx))
    }

    /// Write a record
    ///
    /// The record is shallow-merged into the mirror and visible immediately.
    /// The remote write is attempted once; on failure it is queued under a
    /// scope key equal to `scope`.
    pub async fn upsert<T>(&self, scope: &str, id: &str, record: &T) -> Result<MirroredRecord>
    where
        T: Serialize + ?Sized,
    {
        let context = ActionContext::new(scope).with_label(format!("upsert {}/{}", scope, id));
        self.upsert_with_context(scope, id, record, context).await
    }

    /// Write a record with an explicit queue context
    pub async fn upsert_with_context<T>(
        &self,
        scope: &str,
        id: &str,
        record: &T,
        context: ActionContext,
    ) -> Result<MirroredRecord>
    where
        T: Serialize + ?Sized,
    {
        require_non_empty("scope", scope)?;
        require_non_empty("id", id)?;
        require_non_empty("scope key", &context.scope_key)?;
        let payload = serde_json::to_value(record)?;

        let inner = &self.inner;
        let stored = inner.mirror.upsert(
            scope,
            MirroredRecord::pending(id, payload).with_updated_at(inner.clock.now()),
        );
        inner.events.emit(SyncEvent::LocalWrite {
            scope: scope.to_string(),
            id: id.to_string(),
        });

        let _write_guard = self.scope_write_lock(&context.scope_key).await;
        // A concurrent write may have merged more fields in the meantime
        let data = inner
            .mirror
            .get(scope, id)
            .map(|current| current.payload)
            .unwrap_or_else(|| stored.payload.clone());

        let queued_before = inner
            .queue
            .pending(Some(&FlushFilter::scope(context.scope_key.clone())))
            .await
            .len();
        let outcome = if queued_before > 0 {
            debug!(
                "{} action(s) pending for '{}', queueing {}/{} behind them",
                queued_before, context.scope_key, scope, id
            );
            Err(None)
        } else {
            inner.remote.write(scope, id, &data).await.map_err(Some)
        };

        match outcome {
            Ok(()) => {
                confirm_if_current(inner.mirror.as_ref(), scope, id, &data);
                inner.events.emit(SyncEvent::RemoteWriteSucceeded {
                    scope: scope.to_string(),
                    id: id.to_string(),
                });
                Ok(inner.mirror.get(scope, id).unwrap_or(stored))
            }
            Err(cause) => {
                let payload = RemoteWritePayload {
                    scope: scope.to_string(),
                    id: id.to_string(),
                    data,
                };
                self.queue_remote(REMOTE_UPSERT, payload, context, cause).await?;
                Ok(stored)
            }
        }
    }

    /// Remove a record
    ///
    /// Returns whether the record existed locally. The remote delete follows
    /// the same attempt-then-queue path as writes.
    pub async fn remove(&self, scope: &str, id: &str) -> Result<bool> {
        let context = ActionContext::new(scope).with_label(format!("delete {}/{}", scope, id));
        self.remove_with_context(scope, id, context).await
    }

    /// Remove a record with an explicit queue context
    pub async fn remove_with_context(
        &self,
        scope: &str,
        id: &str,
        context: ActionContext,
    ) -> Result<bool> {
        require_non_empty("scope", scope)?;
        require_non_empty("id", id)?;
        require_non_empty("scope key", &context.scope_key)?;

        let inner = &self.inner;
        let existed = inner.mirror.remove(scope, id);
        if !existed {
            debug!("Remove of unknown record {}/{}", scope, id);
            return Ok(false);
        }
        inner.events.emit(SyncEvent::LocalWrite {
            scope: scope.to_string(),
            id: id.to_string(),
        });

        let _write_guard = self.scope_write_lock(&context.scope_key).await;
        let queued_before = inner
            .queue
            .pending(Some(&FlushFilter::scope(context.scope_key.clone())))
            .await
            .len();
        let outcome = if queued_before > 0 {
            Err(None)
        } else {
            inner.remote.delete(scope, id).await.map_err(Some)
        };

        match outcome {
            Ok(()) => {
                inner.events.emit(SyncEvent::RemoteWriteSucceeded {
                    scope: scope.to_string(),
                    id: id.to_string(),
                });
            }
            Err(cause) => {
                let payload = RemoteWritePayload {
                    scope: scope.to_string(),
                    id: id.to_string(),
                    data: Value::Null,
                };
                self.queue_remote(REMOTE_DELETE, payload, context, cause).await?;
            }
        }
        Ok(true)
    }

    /// Serialize the attempt-or-queue step per scope key
    ///
    /// Without it two writes could both see an empty queue, and a failed
    /// earlier write would be queued after a newer one already succeeded.
    async fn scope_write_lock(&self, scope_key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = match self.inner.write_locks.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            Arc::clone(locks.entry(scope_key.to_string()).or_default())
        };
        lock.lock_owned().await
    }

    async fn queue_remote(
        &self,
        action_type: &str,
        payload: RemoteWritePayload,
        context: ActionContext,
        cause: Option<crate::Error>,
    ) -> Result<()> {
        let error = match &cause {
            Some(e) if e.is_unavailable() => {
                debug!("Remote unavailable for {}/{}: {}", payload.scope, payload.id, e);
                e.to_string()
            }
            Some(e) => {
                warn!("Remote write for {}/{} failed, queueing: {}", payload.scope, payload.id, e);
                e.to_string()
            }
            None => "queued behind pending actions".to_string(),
        };

        let (scope, id) = (payload.scope.clone(), payload.id.clone());
        let action = self
            .inner
            .queue
            .enqueue(action_type, serde_json::to_value(&payload)?, context)
            .await?;

        self.inner.events.emit(SyncEvent::RemoteWriteQueued {
            scope,
            id,
            action_id: action.id,
            error,
        });
        Ok(())
    }

    /// Read a record from the mirror
    pub fn get(&self, scope: &str, id: &str) -> Option<MirroredRecord> {
        self.inner.mirror.get(scope, id)
    }

    /// Read a record from the mirror as a typed view
    pub fn get_as<T: DeserializeOwned>(&self, scope: &str, id: &str) -> Result<Option<MirroredRecord<T>>> {
        self.inner
            .mirror
            .get(scope, id)
            .map(|record| record.decode::<T>())
            .transpose()
    }

    /// List a collection from the mirror
    pub fn list(&self, scope: &str, query: &ListQuery) -> Vec<MirroredRecord> {
        self.inner.mirror.list(scope, query)
    }

    /// Subscribe to a merged live view
    ///
    /// See [`SubscriptionMerger::subscribe`].
    pub fn subscribe<F>(&self, request: SubscribeRequest, on_change: F) -> Result<Subscription>
    where
        F: FnMut(Vec<MirroredRecord>) + Send + 'static,
    {
        self.inner.merger.subscribe(request, on_change)
    }

    /// Queue a caller-defined action for replay
    pub async fn enqueue_offline_action(
        &self,
        action_type: &str,
        payload: Value,
        context: ActionContext,
    ) -> Result<OfflineAction> {
        self.inner.queue.enqueue(action_type, payload, context).await
    }

    /// Replay pending actions
    pub async fn flush_offline_actions(&self, filter: Option<&FlushFilter>) -> Result<FlushReport> {
        self.inner.queue.flush(filter).await
    }

    /// Register a replay handler; a no-op returning `false` if the type has one
    pub fn register_offline_action_handler<H>(&self, action_type: &str, handler: H) -> bool
    where
        H: ActionHandler + 'static,
    {
        self.inner.queue.register_handler(action_type, handler)
    }

    /// Register a replay handler, replacing any existing one
    pub fn replace_offline_action_handler<H>(&self, action_type: &str, handler: H)
    where
        H: ActionHandler + 'static,
    {
        self.inner.queue.replace_handler(action_type, handler)
    }

    /// Replay the queue whenever the notifier signals connectivity
    ///
    /// Returns `false` if auto-flush is already armed.
    pub fn start_auto_flush(&self, notifier: Box<dyn ConnectivityNotifier>) -> bool {
        self.inner.queue.start_auto_flush(notifier)
    }

    /// Disarm auto-flush
    pub fn stop_auto_flush(&self) -> bool {
        self.inner.queue.stop_auto_flush()
    }

    /// Pending actions in enqueue order
    pub async fn pending_actions(&self, filter: Option<&FlushFilter>) -> Vec<OfflineAction> {
        self.inner.queue.pending(filter).await
    }

    /// Membership workflow over this engine
    pub fn membership(&self) -> MembershipWorkflow {
        MembershipWorkflow::new(
            self.clone(),
            self.inner.membership,
            Arc::clone(&self.inner.membership_lock),
        )
    }

    /// The engine's time source
    pub fn clock(&self) -> &dyn Clock {
        self.inner.clock.as_ref()
    }

    /// The local mirror
    pub fn mirror(&self) -> &Arc<dyn MirrorStore> {
        &self.inner.mirror
    }

    /// The remote adapter
    pub fn remote(&self) -> &Arc<dyn RemoteAdapter> {
        &self.inner.remote
    }

    /// Disarm auto-flush and persist the mirror
    ///
    /// Pending actions stay in the durable log for the next start.
    pub async fn shutdown(&self) -> Result<()> {
        self.stop_auto_flush();
        self.inner.mirror.flush()?;
        let pending = self.inner.queue.len().await;
        if pending > 0 {
            info!("Shutting down with {} pending action(s)", pending);
        } else {
            info!("Shutting down, queue empty");
        }
        Ok(())
    }
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("remote", &self.inner.remote.adapter_name())
            .field("queue", &self.inner.queue)
            .finish_non_exhaustive()
    }
}
