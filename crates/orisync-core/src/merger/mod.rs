//! Subscription merger
//!
//! Combines any number of live remote queries with the local mirror into a
//! single de-duplicated, freshness-ordered view.
//!
//! ## Recompute
//!
//! Every source delivery (and every change to the mirror scope) triggers a
//! full recompute under the subscription lock:
//!
//! 1. Union the latest snapshot of every remote source by id. When several
//!    sources hold the same id, the copy most recently reported as new or
//!    changed wins. Server timestamps only order the view; a source
//!    re-delivering an unchanged copy does not make it fresh again.
//! 2. Write the union back into the mirror (`put_many`, which is silent when
//!    nothing changed).
//! 3. Add local records no remote source confirms: records with a pending
//!    write, or the whole mirror scope while no source is live.
//! 4. Apply the access policy, sort newest first, deliver unless identical
//!    to the previous delivery.
//!
//! A failing source is logged, reported as [`SyncEvent::SourceError`] and
//! dropped from the union until it delivers again.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tracing::{debug, error, trace, warn};

use crate::clock::Clock;
use crate::error::{require_non_empty, Error, Result};
use crate::events::{EventSink, SyncEvent};
use crate::traits::mirror_store::{ListQuery, MirrorStore, MirroredRecord};
use crate::traits::remote::{QueryDescriptor, RemoteAdapter, RemoteDocument};

/// Visibility rule applied to the merged view
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessPolicy {
    /// Id of the caller
    pub caller_id: String,
    /// Payload field holding the owner id
    pub owner_field: String,
    /// Payload field holding the group id
    pub group_field: String,
    /// Groups the caller may read
    pub accessible_groups: Vec<String>,
    /// Whether group membership grants access at all
    pub include_groups: bool,
}

impl AccessPolicy {
    /// Only records owned by the caller
    pub fn owner(caller_id: impl Into<String>) -> Self {
        Self {
            caller_id: caller_id.into(),
            owner_field: "ownerId".to_string(),
            group_field: "clubId".to_string(),
            accessible_groups: Vec::new(),
            include_groups: false,
        }
    }

    /// Also records shared with any of the given groups
    pub fn with_groups<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.accessible_groups = groups.into_iter().map(Into::into).collect();
        self.include_groups = true;
        self
    }

    /// Use a different owner field
    pub fn with_owner_field(mut self, field: impl Into<String>) -> Self {
        self.owner_field = field.into();
        self
    }

    /// Use a different group field
    pub fn with_group_field(mut self, field: impl Into<String>) -> Self {
        self.group_field = field.into();
        self
    }

    /// Check if the caller may see a record
    pub fn allows(&self, record: &MirroredRecord) -> bool {
        if record.field_str(&self.owner_field) == Some(self.caller_id.as_str()) {
            return true;
        }
        self.include_groups
            && record
                .field_str(&self.group_field)
                .is_some_and(|group| self.accessible_groups.iter().any(|g| g == group))
    }
}

/// What to subscribe to
#[derive(Debug, Clone, PartialEq)]
pub struct SubscribeRequest {
    /// Mirror scope the merged view is kept under
    pub scope: String,
    /// Live remote queries; keys must be unique
    pub sources: Vec<QueryDescriptor>,
    /// Optional visibility rule
    pub access: Option<AccessPolicy>,
}

impl SubscribeRequest {
    /// Subscribe to a scope with no remote sources (mirror only)
    pub fn new(scope: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            sources: Vec::new(),
            access: None,
        }
    }

    /// Add an unfiltered live query over the subscription scope
    pub fn with_scope_source(self, key: impl Into<String>) -> Self {
        let query = QueryDescriptor::new(key, self.scope.clone());
        self.with_source(query)
    }

    /// Add a live query
    pub fn with_source(mut self, query: QueryDescriptor) -> Self {
        self.sources.push(query);
        self
    }

    /// Restrict the view
    pub fn with_access(mut self, access: AccessPolicy) -> Self {
        self.access = Some(access);
        self
    }

    /// Validate scope and source keys
    pub fn validate(&self) -> Result<()> {
        require_non_empty("scope", &self.scope)?;
        let mut seen = std::collections::HashSet::new();
        for source in &self.sources {
            require_non_empty("source key", &source.key)?;
            require_non_empty("source scope", &source.scope)?;
            if !seen.insert(source.key.as_str()) {
                return Err(Error::invalid_input(format!(
                    "duplicate source key '{}'",
                    source.key
                )));
            }
        }
        Ok(())
    }
}

/// Callback receiving every merged view
pub type SnapshotCallback = Box<dyn FnMut(Vec<MirroredRecord>) + Send + 'static>;

#[derive(Debug, Clone)]
struct SourceEntry {
    record: MirroredRecord,
    // Bumped only when this source reports the record as new or changed
    seq: u64,
}

struct MergeState {
    active: bool,
    seq: u64,
    sources: HashMap<String, HashMap<String, SourceEntry>>,
    last_delivered: Option<Vec<MirroredRecord>>,
    callback: SnapshotCallback,
}

struct Shared {
    scope: String,
    access: Option<AccessPolicy>,
    mirror: Arc<dyn MirrorStore>,
    events: EventSink,
    clock: Arc<dyn Clock>,
    state: Mutex<MergeState>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, MergeState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn on_source(&self, key: &str, delivery: Result<Vec<RemoteDocument>>) {
        let mut state = self.lock();
        if !state.active {
            return;
        }

        match delivery {
            Ok(documents) => {
                trace!("Source '{}' delivered {} document(s)", key, documents.len());
                apply_snapshot(&mut state, key, documents, self.clock.now());
            }
            Err(e) => {
                let err = Error::merge_source(key, e.to_string());
                error!("{}", err);
                self.events.emit(SyncEvent::SourceError {
                    source_key: key.to_string(),
                    error: e.to_string(),
                });
                state.sources.remove(key);
            }
        }
        self.recompute(&mut state);
    }

    fn on_mirror_change(&self) {
        let mut state = self.lock();
        if state.active {
            self.recompute(&mut state);
        }
    }

    fn recompute(&self, state: &mut MergeState) {
        // 1. union of remote snapshots, freshest copy per id
        let mut union: HashMap<&str, &SourceEntry> = HashMap::new();
        for entries in state.sources.values() {
            for (id, entry) in entries {
                match union.get(id.as_str()) {
                    Some(current) if !is_fresher(entry, current) => {}
                    _ => {
                        union.insert(id.as_str(), entry);
                    }
                }
            }
        }
        let remote: Vec<MirroredRecord> = union.values().map(|entry| entry.record.clone()).collect();
        let any_live = !state.sources.is_empty();

        // 2. write-back
        if !remote.is_empty() {
            let changed = self.mirror.put_many(&self.scope, remote.clone());
            if changed > 0 {
                debug!("Mirrored {} remote change(s) into '{}'", changed, self.scope);
            }
        }

        // 3. local records not confirmed by any source
        let mut view = remote;
        let local_query = if any_live {
            ListQuery::default().pending_only()
        } else {
            ListQuery::default()
        };
        view.extend(
            self.mirror
                .list(&self.scope, &local_query)
                .into_iter()
                .filter(|record| !union.contains_key(record.id.as_str())),
        );

        // 4. access, order, dedupe deliveries
        if let Some(access) = &self.access {
            view.retain(|record| access.allows(record));
        }
        view.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| a.id.cmp(&b.id)));

        if state.last_delivered.as_ref() == Some(&view) {
            trace!("Merged view of '{}' unchanged, not delivering", self.scope);
            return;
        }
        state.last_delivered = Some(view.clone());
        (state.callback)(view);
    }
}

fn is_fresher(candidate: &SourceEntry, current: &SourceEntry) -> bool {
    candidate.seq > current.seq
}

/// Replace one source's snapshot, assigning change sequence numbers
fn apply_snapshot(
    state: &mut MergeState,
    key: &str,
    documents: Vec<RemoteDocument>,
    now: DateTime<Utc>,
) {
    let previous = state.sources.remove(key).unwrap_or_default();
    let mut next = HashMap::with_capacity(documents.len());

    for document in documents {
        let before = previous.get(&document.id);
        // Untimestamped documents keep their previous time while unchanged
        let fallback = before
            .filter(|entry| entry.record.payload == document.data)
            .map(|entry| entry.record.updated_at)
            .unwrap_or(now);
        let record = document.into_record(fallback);

        let seq = match before {
            Some(entry)
                if entry.record.same_content(&record)
                    && entry.record.updated_at == record.updated_at =>
            {
                entry.seq
            }
            _ => {
                state.seq += 1;
                state.seq
            }
        };
        next.insert(record.id.clone(), SourceEntry { record, seq });
    }

    state.sources.insert(key.to_string(), next);
}

/// Live subscription handle
///
/// Dropping the handle unsubscribes.
pub struct Subscription {
    shared: Arc<Shared>,
    tasks: Vec<JoinHandle<()>>,
}

impl Subscription {
    /// Scope of the merged view
    pub fn scope(&self) -> &str {
        &self.shared.scope
    }

    /// Check if the subscription still delivers
    pub fn is_active(&self) -> bool {
        self.shared.lock().active
    }

    /// Detach every listener
    ///
    /// After this returns the callback never fires again. Must not be called
    /// from inside the callback.
    pub fn unsubscribe(&mut self) {
        {
            let mut state = self.shared.lock();
            if !state.active {
                return;
            }
            state.active = false;
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }
        debug!("Unsubscribed from '{}'", self.shared.scope);
        self.shared.events.emit(SyncEvent::Unsubscribed {
            scope: self.shared.scope.clone(),
        });
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("scope", &self.shared.scope)
            .field("listeners", &self.tasks.len())
            .finish()
    }
}

/// Builds merged subscriptions over one mirror and one remote
#[derive(Clone)]
pub struct SubscriptionMerger {
    mirror: Arc<dyn MirrorStore>,
    remote: Arc<dyn RemoteAdapter>,
    events: EventSink,
    clock: Arc<dyn Clock>,
}

impl SubscriptionMerger {
    /// Create a merger
    ///
    /// `clock` stamps remote documents that carry no timestamp of their own.
    pub fn new(
        mirror: Arc<dyn MirrorStore>,
        remote: Arc<dyn RemoteAdapter>,
        events: EventSink,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            mirror,
            remote,
            events,
            clock,
        }
    }

    /// Start a merged subscription
    ///
    /// The current mirror contents are delivered before this returns, so
    /// callers see cached data immediately even when offline. Must be called
    /// from within a tokio runtime.
    pub fn subscribe<F>(&self, request: SubscribeRequest, on_change: F) -> Result<Subscription>
    where
        F: FnMut(Vec<MirroredRecord>) + Send + 'static,
    {
        request.validate()?;

        let shared = Arc::new(Shared {
            scope: request.scope.clone(),
            access: request.access.clone(),
            mirror: Arc::clone(&self.mirror),
            events: self.events.clone(),
            clock: Arc::clone(&self.clock),
            state: Mutex::new(MergeState {
                active: true,
                seq: 0,
                sources: HashMap::new(),
                last_delivered: None,
                callback: Box::new(on_change),
            }),
        });

        // Watch before the first read so no change slips in between
        let mut mirror_rx = self.mirror.watch(&request.scope);
        {
            let mut state = shared.lock();
            shared.recompute(&mut state);
        }

        let mut tasks = Vec::with_capacity(request.sources.len() + 1);

        let listener = Arc::clone(&shared);
        tasks.push(tokio::spawn(async move {
            while mirror_rx.changed().await.is_ok() {
                listener.on_mirror_change();
            }
        }));

        for query in &request.sources {
            let listener = Arc::clone(&shared);
            let key = query.key.clone();
            let mut stream = self.remote.subscribe(query);
            tasks.push(tokio::spawn(async move {
                while let Some(delivery) = stream.next().await {
                    listener.on_source(&key, delivery);
                }
                debug!("Source '{}' ended", key);
            }));
        }

        debug!(
            "Subscribed to '{}' with {} remote source(s) via {}",
            request.scope,
            request.sources.len(),
            self.remote.adapter_name()
        );
        if !self.remote.is_configured() && !request.sources.is_empty() {
            warn!(
                "No remote backend configured, '{}' is served from the local mirror only",
                request.scope
            );
        }

        Ok(Subscription { shared, tasks })
    }
}

impl std::fmt::Debug for SubscriptionMerger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionMerger")
            .field("remote", &self.remote.adapter_name())
            .finish_non_exhaustive()
    }
}
