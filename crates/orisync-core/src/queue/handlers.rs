//! Replay handlers for queued actions

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use crate::traits::action_log::OfflineAction;

/// Replays one kind of queued action against the remote
///
/// Handlers must be idempotent: an action may be replayed more than once
/// (after a crash between the remote write and the log removal), so every
/// handler performs an upsert or merge, never an append.
///
/// Any `Fn(OfflineAction) -> impl Future<Output = Result<()>>` closure is a
/// handler:
///
/// ```rust,ignore
/// engine.register_offline_action_handler("results.publish", |action: OfflineAction| async move {
///     publish(&action.payload).await
/// });
/// ```
#[async_trait]
pub trait ActionHandler: Send + Sync {
    /// Replay the action; an error leaves it queued
    async fn handle(&self, action: &OfflineAction) -> crate::Result<()>;
}

#[async_trait]
impl<F, Fut> ActionHandler for F
where
    F: Fn(OfflineAction) -> Fut + Send + Sync,
    Fut: Future<Output = crate::Result<()>> + Send + 'static,
{
    async fn handle(&self, action: &OfflineAction) -> crate::Result<()> {
        (self)(action.clone()).await
    }
}

/// Action type to handler map
#[derive(Default)]
pub(crate) struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn ActionHandler>>>,
}

impl HandlerRegistry {
    /// Register unless the type already has a handler
    pub(crate) fn register(&self, action_type: &str, handler: Arc<dyn ActionHandler>) -> bool {
        let mut handlers = match self.handlers.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if handlers.contains_key(action_type) {
            return false;
        }
        handlers.insert(action_type.to_string(), handler);
        true
    }

    /// Register, overriding any existing handler
    pub(crate) fn replace(
        &self,
        action_type: &str,
        handler: Arc<dyn ActionHandler>,
    ) -> Option<Arc<dyn ActionHandler>> {
        let mut handlers = match self.handlers.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        handlers.insert(action_type.to_string(), handler)
    }

    pub(crate) fn get(&self, action_type: &str) -> Option<Arc<dyn ActionHandler>> {
        let handlers = match self.handlers.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        handlers.get(action_type).cloned()
    }

    pub(crate) fn contains(&self, action_type: &str) -> bool {
        let handlers = match self.handlers.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        handlers.contains_key(action_type)
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let types: Vec<String> = match self.handlers.read() {
            Ok(guard) => guard.keys().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().keys().cloned().collect(),
        };
        f.debug_struct("HandlerRegistry").field("types", &types).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_handler(counter: Arc<AtomicUsize>) -> Arc<dyn ActionHandler> {
        Arc::new(move |_action: OfflineAction| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<(), crate::Error>(())
            }
        })
    }

    #[test]
    fn test_register_is_noop_on_repeat() {
        let registry = HandlerRegistry::default();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        assert!(registry.register("publish", counting_handler(first)));
        assert!(!registry.register("publish", counting_handler(second)));
        assert!(registry.contains("publish"));
        assert!(registry.get("unknown").is_none());
    }

    #[tokio::test]
    async fn test_replace_overrides() {
        let registry = HandlerRegistry::default();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        registry.register("publish", counting_handler(first.clone()));
        assert!(registry.replace("publish", counting_handler(second.clone())).is_some());

        let action = OfflineAction::new(
            "publish",
            serde_json::json!({}),
            crate::traits::ActionContext::new("s"),
        );
        registry.get("publish").unwrap().handle(&action).await.unwrap();

        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }
}
