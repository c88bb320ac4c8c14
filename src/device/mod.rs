//! Device drivers
//!
//! Drivers compose several [`ProcessVariable`]s and a
//! [`StateMachine`](crate::state::StateMachine) into a device with blocking
//! "wait until" operations. This module holds what every driver shares:
//!
//! - [`DeviceCore`]: active/busy/health/message housekeeping, with the device
//!   considered active only while every registered component is connected
//! - [`poll_until`] and [`wait_for_activity`]: sleep-polling waits with
//!   best-effort wall-clock deadlines
//! - [`WaitOutcome`]: how a wait ended, since an expired deadline is not an error
//!
//! # Blocking rules
//!
//! Waits sleep on the calling thread. They must not run on the dispatch thread,
//! where they would stall every notification; drivers log a warning when they
//! detect that. Async callers go through [`Beamline`](crate::beamline::Beamline),
//! which moves waits onto blocking worker threads.

pub mod detector;
pub mod goniometer;
pub mod health;
pub mod shutter;

pub use detector::{Detector, DetectorEvent, DetectorPhase, DetectorState};
pub use goniometer::{GonioEvent, GonioMode, GonioPhase, Goniometer};
pub use health::{Health, HealthManager, HealthReport};
pub use shutter::{EpicsShutter, Shutter, ShutterEvent, SimShutter};

use crate::dispatch::Dispatcher;
use crate::observable::PvEvent;
use crate::pv::ProcessVariable;
use crate::signal::{Signal, SubscriptionId};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// Upper bound on how long a wait looks for a device to start moving.
pub const START_DEADLINE: Duration = Duration::from_secs(2);

/// How a blocking wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The awaited condition was observed
    Reached,
    /// The deadline passed first; callers re-check device state
    TimedOut,
    /// The wait was cancelled by a stop request
    Aborted,
}

impl WaitOutcome {
    /// Whether the condition was observed.
    pub fn is_reached(self) -> bool {
        self == WaitOutcome::Reached
    }
}

/// Sleep-poll `condition` every `poll` until it holds or `timeout` elapses.
pub fn poll_until<F>(poll: Duration, timeout: Duration, condition: F) -> WaitOutcome
where
    F: FnMut() -> bool,
{
    poll_until_abortable(poll, timeout, None, condition)
}

/// Like [`poll_until`], returning [`WaitOutcome::Aborted`] once `abort` is set.
pub fn poll_until_abortable<F>(
    poll: Duration,
    timeout: Duration,
    abort: Option<&AtomicBool>,
    mut condition: F,
) -> WaitOutcome
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        if abort.is_some_and(|flag| flag.load(Ordering::SeqCst)) {
            return WaitOutcome::Aborted;
        }
        if condition() {
            return WaitOutcome::Reached;
        }
        let now = Instant::now();
        if now >= deadline {
            return WaitOutcome::TimedOut;
        }
        std::thread::sleep(poll.min(deadline - now));
    }
}

/// Wait for a device to start and/or finish an operation.
///
/// With `start`, polls until `active()` is true, bounded by the shorter of
/// [`START_DEADLINE`] and `timeout`. Devices that finish before the first poll
/// never look active, so an expired start phase is not reported; the wait simply
/// proceeds. With `stop`, polls until `active()` is false, bounded by `timeout`,
/// and reports [`WaitOutcome::TimedOut`] if the device is still active then.
pub fn wait_for_activity<F>(
    name: &str,
    active: F,
    start: bool,
    stop: bool,
    poll: Duration,
    timeout: Duration,
    abort: Option<&AtomicBool>,
) -> WaitOutcome
where
    F: Fn() -> bool,
{
    if start {
        tracing::debug!(device = name, "Waiting to start");
        match poll_until_abortable(poll, START_DEADLINE.min(timeout), abort, &active) {
            WaitOutcome::Aborted => return WaitOutcome::Aborted,
            WaitOutcome::TimedOut => {
                tracing::debug!(device = name, "Did not see start; proceeding")
            }
            WaitOutcome::Reached => {}
        }
    }
    if stop {
        tracing::debug!(device = name, "Waiting to stop");
        let outcome = poll_until_abortable(poll, timeout, abort, || !active());
        if outcome == WaitOutcome::TimedOut {
            tracing::warn!(
                device = name,
                timeout_ms = timeout.as_millis() as u64,
                "Timed out waiting to stop"
            );
        }
        return outcome;
    }
    WaitOutcome::Reached
}

pub(crate) fn warn_if_dispatch_thread(dispatcher: &Dispatcher, device: &str, operation: &str) {
    if dispatcher.is_dispatch_thread() {
        tracing::warn!(
            device,
            operation,
            "Blocking wait on the dispatch thread stalls notification delivery"
        );
    }
}

// =============================================================================
// Device housekeeping
// =============================================================================

/// Housekeeping events shared by every device.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    /// All components connected (`true`) or at least one lost (`false`)
    Active(bool),
    /// Device started or finished an operation
    Busy(bool),
    /// Combined health changed
    Health(HealthReport),
    /// Informational message from the device
    Message(String),
}

/// Snapshot of device housekeeping state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceState {
    /// Whether every component is connected
    pub active: bool,
    /// Whether an operation is in progress
    pub busy: bool,
    /// Combined health
    pub health: HealthReport,
    /// Last message
    pub message: String,
}

#[derive(Debug, Default)]
struct CoreInner {
    state: DeviceState,
    health: HealthManager,
    pending: BTreeSet<String>,
    components: usize,
}

/// Shared housekeeping for a device emitting events of type `E`.
///
/// `E` is the device's own tagged event enum; housekeeping changes reach
/// subscribers through its `From<DeviceEvent>` conversion. Events are emitted
/// only when the corresponding state actually changes.
pub struct DeviceCore<E> {
    name: String,
    inner: Mutex<CoreInner>,
    signal: Signal<E>,
}

impl<E> std::fmt::Debug for DeviceCore<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceCore")
            .field("name", &self.name)
            .field("state", &self.inner.lock().state)
            .finish_non_exhaustive()
    }
}

impl<E> DeviceCore<E>
where
    E: From<DeviceEvent> + Send + Sync + 'static,
{
    /// New inactive device named `name`.
    pub fn new(name: impl Into<String>, dispatcher: Dispatcher) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            inner: Mutex::new(CoreInner::default()),
            signal: Signal::new(dispatcher),
        })
    }

    /// Device name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Dispatch context events are delivered on.
    pub fn dispatcher(&self) -> &Dispatcher {
        self.signal.dispatcher()
    }

    /// Copy of the housekeeping state.
    pub fn state(&self) -> DeviceState {
        self.inner.lock().state.clone()
    }

    /// Whether every component is connected.
    pub fn is_active(&self) -> bool {
        self.inner.lock().state.active
    }

    /// Whether an operation is in progress.
    pub fn is_busy(&self) -> bool {
        self.inner.lock().state.busy
    }

    /// Combined health.
    pub fn health(&self) -> HealthReport {
        self.inner.lock().state.health.clone()
    }

    /// Names of components that are not connected.
    pub fn pending_components(&self) -> Vec<String> {
        self.inner.lock().pending.iter().cloned().collect()
    }

    /// Register `pv` as a component: the device is inactive while it is disconnected.
    pub fn add_component(self: &Arc<Self>, pv: &ProcessVariable) -> SubscriptionId {
        let name = pv.name().to_string();
        {
            let mut inner = self.inner.lock();
            inner.components += 1;
            inner.pending.insert(name.clone());
        }
        let core: Weak<Self> = Arc::downgrade(self);
        let id = pv.subscribe(move |event| {
            if let (PvEvent::Active(connected), Some(core)) = (event, core.upgrade()) {
                core.component_changed(&name, *connected);
            }
        });
        if pv.is_connected() {
            self.component_changed(pv.name(), true);
        } else {
            self.refresh_activity(&mut self.inner.lock());
        }
        id
    }

    fn component_changed(&self, name: &str, connected: bool) {
        let mut inner = self.inner.lock();
        let changed = if connected {
            inner.pending.remove(name)
        } else {
            inner.pending.insert(name.to_string())
        };
        if changed {
            self.refresh_activity(&mut inner);
        }
    }

    fn refresh_activity(&self, inner: &mut CoreInner) {
        let active = inner.pending.is_empty();
        if active {
            inner.health.remove("active");
        } else {
            let message = format!("[{}] inactive components.", inner.pending.len());
            inner.health.remove("active");
            inner.health.add(Health::SERIOUS, "active", Some(&message));
        }
        self.apply_health(inner, None);

        if inner.state.active != active {
            inner.state.active = active;
            if active {
                tracing::info!(device = %self.name, "Device is now active");
            } else {
                tracing::info!(device = %self.name, "Device is now inactive");
                tracing::warn!(
                    device = %self.name,
                    inactive = inner.pending.len(),
                    components = inner.components,
                    "Inactive components"
                );
            }
            self.signal.emit(E::from(DeviceEvent::Active(active)));
        }
    }

    /// Recompute activity from the registered components.
    ///
    /// A device without components becomes active.
    pub fn refresh(&self) {
        self.refresh_activity(&mut self.inner.lock());
    }

    /// Set the busy flag, emitting [`DeviceEvent::Busy`] on change.
    pub fn set_busy(&self, busy: bool) {
        let mut inner = self.inner.lock();
        if inner.state.busy != busy {
            inner.state.busy = busy;
            self.signal.emit(E::from(DeviceEvent::Busy(busy)));
        }
    }

    /// Publish a message, emitting [`DeviceEvent::Message`] on change.
    pub fn set_message(&self, message: impl Into<String>) {
        let message = message.into();
        let mut inner = self.inner.lock();
        if inner.state.message != message {
            inner.state.message = message.clone();
            self.signal.emit(E::from(DeviceEvent::Message(message)));
        }
    }

    /// Record (`severity != GOOD`) or clear (`severity == GOOD`) a health problem.
    ///
    /// When the combined health is good, `message` passes through as the health
    /// message.
    pub fn set_health(&self, severity: Health, context: &str, message: Option<&str>) {
        let mut inner = self.inner.lock();
        if severity.is_good() {
            inner.health.remove(context);
        } else {
            inner.health.add(severity, context, message);
        }
        self.apply_health(&mut inner, message);
    }

    fn apply_health(&self, inner: &mut CoreInner, message: Option<&str>) {
        let mut report = inner.health.health();
        if let (true, Some(message)) = (report.severity.is_good(), message) {
            report.message = message.to_string();
        }
        if inner.state.health != report {
            inner.state.health = report.clone();
            self.signal.emit(E::from(DeviceEvent::Health(report)));
        }
    }

    /// Emit a device-specific event.
    pub fn emit(&self, event: E) {
        self.signal.emit(event);
    }

    /// Subscribe to this device's events.
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.signal.subscribe(callback)
    }

    /// Remove a subscription. Idempotent.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.signal.unsubscribe(id);
    }

    /// Poll until active or `timeout` elapses.
    pub fn wait_active(&self, timeout: Duration) -> WaitOutcome {
        poll_until(Duration::from_millis(20), timeout, || self.is_active())
    }
}
