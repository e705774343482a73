//! Events emitted by the sync layer for external monitoring
//!
//! Events complement the `tracing` output: they are structured, bounded, and
//! meant for a host that wants to show sync status (pending badges, error
//! toasts) without parsing logs.

use tokio::sync::mpsc;
use tracing::warn;

/// Observable sync events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// A write was applied to the local mirror
    LocalWrite { scope: String, id: String },

    /// The remote confirmed a write on the first attempt
    RemoteWriteSucceeded { scope: String, id: String },

    /// A remote write failed and was queued for replay
    RemoteWriteQueued {
        scope: String,
        id: String,
        action_id: String,
        error: String,
    },

    /// A queued action was replayed successfully and removed
    ActionReplayed { action_id: String, action_type: String },

    /// A queued action failed again and stays queued
    ActionFailed {
        action_id: String,
        action_type: String,
        attempts: u32,
        error: String,
    },

    /// A queued action has no registered handler and stays queued
    HandlerMissing { action_id: String, action_type: String },

    /// An action was removed by the configured eviction policy
    ActionEvicted {
        action_id: String,
        action_type: String,
        reason: String,
    },

    /// A flush pass finished
    FlushCompleted {
        replayed: usize,
        failed: usize,
        remaining: usize,
    },

    /// A live-query source failed and now counts as empty
    SourceError { source_key: String, error: String },

    /// A subscription was torn down
    Unsubscribed { scope: String },
}

/// Bounded, non-blocking event sender
///
/// A full channel drops the event with a warning instead of applying
/// backpressure to the write path.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: Option<mpsc::Sender<SyncEvent>>,
}

impl EventSink {
    /// Create a sink and its receiver
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<SyncEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx: Some(tx) }, rx)
    }

    /// A sink that discards everything
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Emit an event
    pub fn emit(&self, event: SyncEvent) {
        let Some(tx) = &self.tx else {
            return;
        };
        match tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Event channel full, dropping event. Consider increasing event_channel_capacity.");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                // Nobody is listening
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_event_sink_drops_when_full() {
        let (sink, mut rx) = EventSink::channel(1);
        sink.emit(SyncEvent::Unsubscribed { scope: "a".into() });
        sink.emit(SyncEvent::Unsubscribed { scope: "b".into() });

        assert_eq!(
            rx.recv().await,
            Some(SyncEvent::Unsubscribed { scope: "a".into() })
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_disabled_sink_is_silent() {
        EventSink::disabled().emit(SyncEvent::Unsubscribed { scope: "a".into() });
    }
}
