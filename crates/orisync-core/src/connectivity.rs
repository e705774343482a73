//! Built-in connectivity notifiers

use std::pin::Pin;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_stream::wrappers::{IntervalStream, UnboundedReceiverStream};
use tokio_stream::{Stream, StreamExt};

use crate::traits::{ConnectivityEvent, ConnectivityNotifier};

/// Emits [`ConnectivityEvent::Tick`] at a fixed period
///
/// The first tick fires one full period after the stream is first polled.
#[derive(Debug, Clone)]
pub struct IntervalNotifier {
    period: Duration,
}

impl IntervalNotifier {
    /// Create a notifier with the given period (clamped to at least 1ms)
    pub fn new(period: Duration) -> Self {
        Self {
            period: period.max(Duration::from_millis(1)),
        }
    }
}

impl ConnectivityNotifier for IntervalNotifier {
    fn watch(&self) -> Pin<Box<dyn Stream<Item = ConnectivityEvent> + Send + 'static>> {
        let start = tokio::time::Instant::now() + self.period;
        let mut interval = tokio::time::interval_at(start, self.period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        Box::pin(IntervalStream::new(interval).map(|_| ConnectivityEvent::Tick))
    }

    fn notifier_name(&self) -> &'static str {
        "interval"
    }
}

/// Notifier driven by explicit calls
///
/// Hosts with a native online/offline signal forward it through
/// [`ManualNotifier::signal`]. The event stream can be taken once; later
/// calls to `watch` get a stream that never yields.
#[derive(Debug)]
pub struct ManualNotifier {
    tx: mpsc::UnboundedSender<ConnectivityEvent>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<ConnectivityEvent>>>,
}

impl ManualNotifier {
    /// Create a notifier and a handle for sending signals
    pub fn new() -> (Self, ManualSignal) {
        let (tx, rx) = mpsc::unbounded_channel();
        let notifier = Self {
            tx: tx.clone(),
            rx: Mutex::new(Some(rx)),
        };
        (notifier, ManualSignal { tx })
    }

    /// Send a signal
    pub fn signal(&self, event: ConnectivityEvent) {
        let _ = self.tx.send(event);
    }
}

impl ConnectivityNotifier for ManualNotifier {
    fn watch(&self) -> Pin<Box<dyn Stream<Item = ConnectivityEvent> + Send + 'static>> {
        let taken = match self.rx.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };

        match taken {
            Some(rx) => Box::pin(UnboundedReceiverStream::new(rx)),
            None => {
                tracing::warn!("ManualNotifier watched more than once; returning idle stream");
                Box::pin(tokio_stream::pending())
            }
        }
    }

    fn notifier_name(&self) -> &'static str {
        "manual"
    }
}

/// Cloneable sending half of a [`ManualNotifier`]
#[derive(Debug, Clone)]
pub struct ManualSignal {
    tx: mpsc::UnboundedSender<ConnectivityEvent>,
}

impl ManualSignal {
    /// Report that connectivity was regained
    pub fn online(&self) {
        let _ = self.tx.send(ConnectivityEvent::Online);
    }

    /// Report that connectivity was lost
    pub fn offline(&self) {
        let _ = self.tx.send(ConnectivityEvent::Offline);
    }

    /// Send an arbitrary event
    pub fn send(&self, event: ConnectivityEvent) {
        let _ = self.tx.send(event);
    }
}
