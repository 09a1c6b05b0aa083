//! Status and sample events with explicit subscription

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// How prominently a status message should be shown
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Success,
    Warning,
    Error,
}

/// What a status event reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusKind {
    Connected,
    Disconnected,
    ConnectFailed,
    AcquisitionStarted,
    AcquisitionStopped,
    ConnectionLost,
    Reconnecting { attempt: u32, max_attempts: u32 },
    Reconnected,
    /// Terminal: reconnection attempts are exhausted
    ReconnectFailed,
    Backpressure { depth: usize },
    Info,
}

/// A user-visible status message
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusEvent {
    pub kind: StatusKind,
    pub message: String,
    pub severity: Severity,
    /// Hide the message after this long; `None` keeps it
    pub clear_after: Option<Duration>,
}

impl StatusEvent {
    pub fn new(kind: StatusKind, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            severity,
            clear_after: None,
        }
    }

    pub fn clear_after(mut self, after: Duration) -> Self {
        self.clear_after = Some(after);
        self
    }
}

/// Index and value of a decoded sample
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SampleEvent {
    pub index: u64,
    pub value: f64,
}

/// Fan-out of events to any number of subscribers
///
/// Each subscriber gets its own unbounded channel. Publishing never blocks
/// and subscribers whose receiver was dropped are pruned.
pub struct EventHub<T> {
    subscribers: Arc<Mutex<Vec<Sender<T>>>>,
}

impl<T> Clone for EventHub<T> {
    fn clone(&self) -> Self {
        Self {
            subscribers: Arc::clone(&self.subscribers),
        }
    }
}

impl<T> Default for EventHub<T> {
    fn default() -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl<T: Clone> EventHub<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new subscriber
    pub fn subscribe(&self) -> Receiver<T> {
        let (tx, rx) = unbounded();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Deliver an event to every live subscriber
    pub fn publish(&self, event: T) {
        let mut subscribers = self.subscribers.lock();
        match subscribers.len() {
            0 => {}
            1 => {
                if subscribers[0].send(event).is_err() {
                    subscribers.clear();
                }
            }
            _ => subscribers.retain(|tx| tx.send(event.clone()).is_ok()),
        }
    }

    /// Whether anyone is listening
    pub fn has_subscribers(&self) -> bool {
        !self.subscribers.lock().is_empty()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_reaches_all_subscribers() {
        let hub = EventHub::new();
        let a = hub.subscribe();
        let b = hub.subscribe();

        hub.publish(SampleEvent {
            index: 1,
            value: 2.0,
        });

        assert_eq!(a.try_recv().unwrap().index, 1);
        assert_eq!(b.try_recv().unwrap().value, 2.0);
    }

    #[test]
    fn test_dropped_subscribers_are_pruned() {
        let hub: EventHub<u32> = EventHub::new();
        let keep = hub.subscribe();
        drop(hub.subscribe());
        assert_eq!(hub.subscriber_count(), 2);

        hub.publish(7);
        assert_eq!(hub.subscriber_count(), 1);
        assert_eq!(keep.try_recv().unwrap(), 7);
    }

    #[test]
    fn test_status_event_builder() {
        let event = StatusEvent::new(StatusKind::Connected, Severity::Success, "Connected")
            .clear_after(Duration::from_secs(5));
        assert_eq!(event.clear_after, Some(Duration::from_secs(5)));
        assert_eq!(event.severity, Severity::Success);
    }
}
