// # Memory Action Log
//
// In-memory implementation of ActionLog. Pending actions do not survive a
// restart; use it for tests and hosts that accept losing the queue on exit.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::config::ActionLogConfig;
use crate::traits::action_log::{ActionLog, ActionLogFactory, OfflineAction};
use crate::Error;

/// In-memory action log
///
/// Cloning shares the underlying storage, which lets tests hand one clone to
/// an engine and inspect the other.
#[derive(Debug, Clone, Default)]
pub struct MemoryActionLog {
    inner: Arc<RwLock<Vec<OfflineAction>>>,
}

impl MemoryActionLog {
    /// Create an empty log
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored actions
    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    /// Check if the log is empty
    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}

#[async_trait]
impl ActionLog for MemoryActionLog {
    async fn append(&self, action: &OfflineAction) -> crate::Result<()> {
        self.inner.write().await.push(action.clone());
        Ok(())
    }

    async fn load(&self) -> crate::Result<Vec<OfflineAction>> {
        Ok(self.inner.read().await.clone())
    }

    async fn update(&self, action: &OfflineAction) -> crate::Result<()> {
        let mut guard = self.inner.write().await;
        match guard.iter_mut().find(|stored| stored.id == action.id) {
            Some(stored) => {
                *stored = action.clone();
                Ok(())
            }
            None => Err(Error::action_log(format!("Unknown action id: {}", action.id))),
        }
    }

    async fn remove(&self, id: &str) -> crate::Result<()> {
        self.inner.write().await.retain(|stored| stored.id != id);
        Ok(())
    }
}

/// Factory for [`MemoryActionLog`]
#[derive(Debug, Default)]
pub struct MemoryActionLogFactory;

impl ActionLogFactory for MemoryActionLogFactory {
    fn create(&self, config: &ActionLogConfig) -> crate::Result<Box<dyn ActionLog>> {
        match config {
            ActionLogConfig::Memory => Ok(Box::new(MemoryActionLog::new())),
            _ => Err(Error::config("Invalid config for memory action log")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::ActionContext;
    use serde_json::json;

    #[tokio::test]
    async fn test_memory_log_roundtrip() {
        let log = MemoryActionLog::new();
        let first = OfflineAction::new("remote.upsert", json!({"n": 1}), ActionContext::new("e1"));
        let second = OfflineAction::new("remote.upsert", json!({"n": 2}), ActionContext::new("e1"));

        log.append(&first).await.unwrap();
        log.append(&second).await.unwrap();
        assert_eq!(log.len().await, 2);

        let mut failed = first.clone();
        failed.attempts = 1;
        failed.last_error = Some("timeout".into());
        log.update(&failed).await.unwrap();

        let loaded = log.load().await.unwrap();
        assert_eq!(loaded[0].attempts, 1);
        assert_eq!(loaded[1].id, second.id);

        log.remove(&first.id).await.unwrap();
        assert_eq!(log.load().await.unwrap(), vec![second]);
    }

    #[tokio::test]
    async fn test_memory_log_update_unknown() {
        let log = MemoryActionLog::new();
        let action = OfflineAction::new("t", json!(null), ActionContext::new("s"));
        assert!(log.update(&action).await.is_err());
    }
}
