//! Observable value cells
//!
//! [`ObservableValue`] is the thread-safe container behind every process
//! variable: last known value, source timestamp, connection flag and alarm
//! severity, plus an observer list.
//!
//! # Features
//!
//! - Value and timestamp replaced together under one lock, so readers never see
//!   a new value paired with a stale timestamp
//! - Change notification through [`Signal`], delivered on the dispatch thread and
//!   never on the hardware thread that called [`ObservableValue::set`]
//! - Typed event kinds ([`PvEvent`]) instead of string-named signals
//!
//! # Example
//!
//! ```rust,ignore
//! let cell = ObservableValue::new("BL:shutter:state", dispatcher.clone());
//! let id = cell.subscribe_changes(|value| println!("now {value}"));
//!
//! // From a channel thread:
//! cell.set(PvValue::Int(1), 1.5, true, Severity::NoAlarm);
//!
//! let (value, timestamp, connected) = cell.get();
//! cell.unsubscribe(id);
//! ```

use crate::dispatch::Dispatcher;
use crate::signal::{Signal, SubscriptionId};
use crate::value::{PvValue, Reading, Severity};
use parking_lot::RwLock;

/// Events published by an [`ObservableValue`].
#[derive(Debug, Clone, PartialEq)]
pub enum PvEvent {
    /// New value (emitted on every update)
    Changed(PvValue),
    /// Source timestamp of the new value
    Time(f64),
    /// Connection came up (`true`) or was lost (`false`)
    Active(bool),
    /// Alarm severity changed
    Alarm(Severity),
}

/// Consistent copy of an observable's state.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    /// Last known value, `None` before the first update
    pub value: Option<PvValue>,
    /// Display-formatted form of `value`, when the channel provides one
    pub display: Option<String>,
    /// Source timestamp of `value` (0.0 before the first update)
    pub timestamp: f64,
    /// Whether the underlying channel is connected
    pub connected: bool,
    /// Alarm severity reported with the last update
    pub severity: Severity,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            value: None,
            display: None,
            timestamp: 0.0,
            connected: false,
            severity: Severity::NoAlarm,
        }
    }
}

/// A thread-safe value cell with dispatched change notification.
pub struct ObservableValue {
    name: String,
    state: RwLock<Snapshot>,
    signal: Signal<PvEvent>,
}

impl std::fmt::Debug for ObservableValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObservableValue")
            .field("name", &self.name)
            .field("state", &*self.state.read())
            .finish_non_exhaustive()
    }
}

impl ObservableValue {
    /// Create an empty cell delivering notifications on `dispatcher`.
    pub fn new(name: impl Into<String>, dispatcher: Dispatcher) -> Self {
        Self {
            name: name.into(),
            state: RwLock::new(Snapshot::default()),
            signal: Signal::new(dispatcher),
        }
    }

    /// Name of the channel this cell mirrors.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Atomically replace value, timestamp, connection flag and severity.
    pub fn set(&self, value: PvValue, timestamp: f64, connected: bool, severity: Severity) {
        self.apply(value, None, timestamp, connected, severity);
    }

    /// Apply a monitor update, keeping its display form.
    pub fn set_reading(&self, reading: Reading) {
        self.apply(
            reading.value,
            reading.display,
            reading.timestamp,
            true,
            reading.severity,
        );
    }

    fn apply(
        &self,
        value: PvValue,
        display: Option<String>,
        timestamp: f64,
        connected: bool,
        severity: Severity,
    ) {
        let mut state = self.state.write();
        let mut events = Vec::with_capacity(4);
        if state.connected != connected {
            events.push(PvEvent::Active(connected));
        }
        if state.severity != severity {
            events.push(PvEvent::Alarm(severity));
        }
        events.push(PvEvent::Time(timestamp));
        events.push(PvEvent::Changed(value.clone()));

        *state = Snapshot {
            value: Some(value),
            display,
            timestamp,
            connected,
            severity,
        };
        // Enqueue while still holding the lock so delivery order matches write order.
        self.signal.emit_all(events);
    }

    /// Update only the connection flag; emits [`PvEvent::Active`] when it changes.
    pub fn set_connected(&self, connected: bool) {
        let mut state = self.state.write();
        if state.connected != connected {
            state.connected = connected;
            self.signal.emit(PvEvent::Active(connected));
        }
    }

    /// `(value, timestamp, connected)`; `(None, 0.0, false)` before the first update.
    pub fn get(&self) -> (Option<PvValue>, f64, bool) {
        let state = self.state.read();
        (state.value.clone(), state.timestamp, state.connected)
    }

    /// Full consistent copy of the cell.
    pub fn snapshot(&self) -> Snapshot {
        self.state.read().clone()
    }

    /// Last known value.
    pub fn value(&self) -> Option<PvValue> {
        self.state.read().value.clone()
    }

    /// Whether the channel is currently connected.
    pub fn is_connected(&self) -> bool {
        self.state.read().connected
    }

    /// Alarm severity of the last update.
    pub fn severity(&self) -> Severity {
        self.state.read().severity
    }

    /// Subscribe to every event kind.
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&PvEvent) + Send + Sync + 'static,
    {
        self.signal.subscribe(callback)
    }

    /// Subscribe to value changes only.
    pub fn subscribe_changes<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&PvValue) + Send + Sync + 'static,
    {
        self.signal.subscribe(move |event| {
            if let PvEvent::Changed(value) = event {
                callback(value);
            }
        })
    }

    /// Remove a subscription; a no-op for unknown or already removed handles.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.signal.unsubscribe(id);
    }

    /// Remove every subscription.
    pub fn clear_subscribers(&self) {
        self.signal.clear();
    }

    /// Number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.signal.subscriber_count()
    }
}
