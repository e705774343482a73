// # Connectivity Notifier Trait
//
// Defines the signal that drives automatic replay of the offline queue.
//
// ## Implementations
//
// - `IntervalNotifier`: fixed polling timer (runtimes without an online signal)
// - `ManualNotifier`: explicit signals from the host application or tests
// - HTTP reachability probe: `orisync-remote-http` crate
//
// ## Usage
//
// ```rust,ignore
// use orisync_core::connectivity::IntervalNotifier;
//
// let notifier = IntervalNotifier::new(std::time::Duration::from_secs(30));
// engine.start_auto_flush(Box::new(notifier));
// ```

use std::pin::Pin;
use tokio_stream::Stream;

/// A connectivity signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityEvent {
    /// Connectivity was (re)gained
    Online,
    /// Connectivity was lost
    Offline,
    /// Periodic trigger with no connectivity information
    Tick,
}

impl ConnectivityEvent {
    /// Whether this event should trigger a queue flush
    pub fn triggers_flush(self) -> bool {
        matches!(self, Self::Online | Self::Tick)
    }
}

/// Trait for connectivity notifier implementations
///
/// # Rules for Implementations
///
/// - Observers only: never flush the queue or touch the mirror themselves
/// - The stream must be cancellation-safe; dropping it releases resources
/// - Polling implementations own their own timer; the queue does not sleep
pub trait ConnectivityNotifier: Send + Sync {
    /// Stream of connectivity events
    fn watch(&self) -> Pin<Box<dyn Stream<Item = ConnectivityEvent> + Send + 'static>>;

    /// Notifier name (for logging)
    fn notifier_name(&self) -> &'static str;
}
