//! Event log for observing connection and transaction lifecycles.
//!
//! Every callback the session reacts to is recorded here, in the order the
//! engine fired it, before any other component sees its effect. The log
//! enables:
//! - Diagnostics of open/upgrade/blocked/versionchange sequences
//! - Reactive presentation layers (via [`EventLog::subscribe`])
//! - Catch-up polling (via [`EventLog::since`])
//!
//! # Usage
//!
//! ```rust
//! use idbscope_core::{EventKind, EventLog, EventOrigin, LifecycleEvent};
//!
//! let log = EventLog::new();
//! let receiver = log.subscribe();
//!
//! log.record(LifecycleEvent::new(
//!     EventKind::Success,
//!     EventOrigin::Engine,
//!     "Event",
//!     "IDBOpenDBRequest",
//! ));
//!
//! assert_eq!(receiver.recv().unwrap().kind, EventKind::Success);
//! assert_eq!(log.len(), 1);
//! ```

use crate::error::ErrorClass;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::mpsc::{self, Receiver, Sender};

/// Kind of a lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    /// A request succeeded.
    Success,
    /// A request or connection reported a failure.
    Error,
    /// An open request is upgrading the schema.
    UpgradeNeeded,
    /// An open or delete request is waiting for other connections.
    Blocked,
    /// Another party wants to change the version of the held database.
    VersionChange,
    /// The held connection closed.
    Close,
    /// A transaction on the held connection aborted.
    Abort,
}

impl EventKind {
    /// Returns the event type name as the engine fires it.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
            Self::UpgradeNeeded => "upgradeneeded",
            Self::Blocked => "blocked",
            Self::VersionChange => "versionchange",
            Self::Close => "close",
            Self::Abort => "abort",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventOrigin {
    /// Fired by the engine.
    Engine,
    /// Fabricated by the controller for something the engine does not
    /// report, such as closing a connection locally.
    Controller,
}

/// A single entry of the event log.
///
/// Events are immutable once recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    /// Position in the log; assigned when recorded.
    pub sequence: u64,
    /// Event type.
    pub kind: EventKind,
    /// Who produced the event.
    pub origin: EventOrigin,
    /// Event class, e.g. `IDBVersionChangeEvent`.
    pub source: String,
    /// What the event fired at, e.g. `IDBOpenDBRequest orders v1`.
    pub target: String,
    /// Free-form detail: versions, failure reason, store name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Failure classification, for failure events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub class: Option<ErrorClass>,
}

impl LifecycleEvent {
    /// Creates an event.
    pub fn new(
        kind: EventKind,
        origin: EventOrigin,
        source: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        Self {
            sequence: 0,
            kind,
            origin,
            source: source.into(),
            target: target.into(),
            detail: None,
            class: None,
        }
    }

    /// Creates the `close` event recorded when the controller closes a
    /// connection itself.
    pub fn synthetic_close(target: impl Into<String>) -> Self {
        Self::new(
            EventKind::Close,
            EventOrigin::Controller,
            "SyntheticCloseEvent",
            target,
        )
    }

    /// Attaches detail text.
    #[must_use]
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Attaches a failure class.
    #[must_use]
    pub fn with_class(mut self, class: ErrorClass) -> Self {
        self.class = Some(class);
        self
    }

    /// Returns true for failure events.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        matches!(self.kind, EventKind::Error | EventKind::Abort)
    }
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{} [{}] {} {}",
            self.sequence, self.target, self.source, self.kind
        )?;
        if let Some(detail) = &self.detail {
            write!(f, ": {detail}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct LogState {
    events: Vec<LifecycleEvent>,
    next_sequence: u64,
}

/// An append-only, observable record of lifecycle events.
///
/// The log:
/// - Preserves arrival order; events are never mutated or reordered
/// - Can be cleared in bulk; sequence numbers keep increasing afterwards
/// - Keeps at most `max_events` entries, dropping the oldest
/// - Notifies subscribers of every recorded event
pub struct EventLog {
    /// Subscribers (senders).
    subscribers: RwLock<Vec<Sender<LifecycleEvent>>>,
    /// Recorded events.
    state: RwLock<LogState>,
    /// Maximum history size.
    max_events: usize,
}

impl EventLog {
    /// Creates an event log with the default history bound.
    pub fn new() -> Self {
        Self::with_max_events(10_000)
    }

    /// Creates an event log keeping at most `max_events` entries.
    pub fn with_max_events(max_events: usize) -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
            state: RwLock::new(LogState::default()),
            max_events: max_events.max(1),
        }
    }

    /// Appends an event and returns its sequence number.
    pub fn record(&self, mut event: LifecycleEvent) -> u64 {
        {
            let mut state = self.state.write();
            state.next_sequence += 1;
            event.sequence = state.next_sequence;
            state.events.push(event.clone());
            if state.events.len() > self.max_events {
                let to_remove = state.events.len() - self.max_events;
                state.events.drain(0..to_remove);
            }
        }
        tracing::debug!(event = %event, "event recorded");

        let sequence = event.sequence;
        let mut subscribers = self.subscribers.write();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        sequence
    }

    /// Subscribes to the log.
    ///
    /// The receiver gets every event recorded from now on.
    pub fn subscribe(&self) -> Receiver<LifecycleEvent> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.write().push(tx);
        rx
    }

    /// Returns a copy of every event currently held.
    pub fn events(&self) -> Vec<LifecycleEvent> {
        self.state.read().events.clone()
    }

    /// Returns the kinds of every event currently held, in order.
    pub fn kinds(&self) -> Vec<EventKind> {
        self.state.read().events.iter().map(|e| e.kind).collect()
    }

    /// Returns events with a sequence number greater than `cursor`.
    pub fn since(&self, cursor: u64) -> Vec<LifecycleEvent> {
        self.state
            .read()
            .events
            .iter()
            .filter(|e| e.sequence > cursor)
            .cloned()
            .collect()
    }

    /// Returns the most recent event.
    pub fn last(&self) -> Option<LifecycleEvent> {
        self.state.read().events.last().cloned()
    }

    /// Returns the sequence number of the most recent event ever recorded.
    pub fn latest_sequence(&self) -> u64 {
        self.state.read().next_sequence
    }

    /// Returns the number of events held.
    pub fn len(&self) -> usize {
        self.state.read().events.len()
    }

    /// Returns true if no events are held.
    pub fn is_empty(&self) -> bool {
        self.state.read().events.is_empty()
    }

    /// Removes every event.
    pub fn clear(&self) {
        self.state.write().events.clear();
    }

    /// Returns the number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLog")
            .field("len", &self.len())
            .field("max_events", &self.max_events)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn success() -> LifecycleEvent {
        LifecycleEvent::new(
            EventKind::Success,
            EventOrigin::Engine,
            "Event",
            "IDBOpenDBRequest",
        )
    }

    #[test]
    fn record_assigns_increasing_sequences() {
        let log = EventLog::new();
        assert_eq!(log.record(success()), 1);
        assert_eq!(log.record(LifecycleEvent::synthetic_close("IDBDatabase orders v1")), 2);
        assert_eq!(log.kinds(), vec![EventKind::Success, EventKind::Close]);
        assert_eq!(log.last().unwrap().origin, EventOrigin::Controller);
    }

    #[test]
    fn subscribers_receive_events() {
        let log = EventLog::new();
        let rx1 = log.subscribe();
        let rx2 = log.subscribe();

        log.record(success());

        let received = rx1.recv_timeout(Duration::from_millis(100)).unwrap();
        assert_eq!(received.sequence, 1);
        assert_eq!(rx2.recv().unwrap().kind, EventKind::Success);
    }

    #[test]
    fn dropped_subscribers_are_removed() {
        let log = EventLog::new();
        let rx = log.subscribe();
        assert_eq!(log.subscriber_count(), 1);

        drop(rx);
        log.record(success());
        assert_eq!(log.subscriber_count(), 0);
    }

    #[test]
    fn clear_keeps_sequence_running() {
        let log = EventLog::new();
        log.record(success());
        log.record(success());
        log.clear();
        assert!(log.is_empty());

        assert_eq!(log.record(success()), 3);
        assert_eq!(log.since(0).len(), 1);
    }

    #[test]
    fn history_is_bounded() {
        let log = EventLog::with_max_events(3);
        for _ in 0..5 {
            log.record(success());
        }
        assert_eq!(log.len(), 3);
        assert_eq!(log.events()[0].sequence, 3);
        assert_eq!(log.latest_sequence(), 5);
    }

    #[test]
    fn since_filters_by_cursor() {
        let log = EventLog::new();
        for _ in 0..4 {
            log.record(success());
        }
        let events = log.since(2);
        assert_eq!(events.iter().map(|e| e.sequence).collect::<Vec<_>>(), vec![3, 4]);
    }

    #[test]
    fn display_includes_detail() {
        let mut event = success().with_detail("orders v1");
        event.sequence = 4;
        assert_eq!(
            event.to_string(),
            "#4 [IDBOpenDBRequest] Event success: orders v1"
        );
    }
}
