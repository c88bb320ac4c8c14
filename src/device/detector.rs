//! Area detector
//!
//! The detector state comes from the AreaDetector state read-back, which reports
//! either an index or its display label depending on how the channel is read.
//! Both forms decode to the same [`DetectorState`]; the armed read-back, when set,
//! overrides the decoded state with [`DetectorState::Armed`].

use super::{poll_until, warn_if_dispatch_thread, DeviceCore, DeviceEvent, DeviceState, WaitOutcome};
use crate::channel::SimBackend;
use crate::config::ChannelMap;
use crate::context::PvContext;
use crate::error::AppResult;
use crate::pv::ProcessVariable;
use crate::signal::SubscriptionId;
use crate::state::StateMachine;
use crate::value::PvValue;
use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Role → channel suffix table.
pub const DEFAULT_ROLES: &[(&str, &str)] = &[
    ("acquire_cmd", "Acquire"),
    ("acquire_status", "Acquire_RBV"),
    ("state_value", "DetectorState_RBV"),
    ("armed_status", "Armed"),
];

/// States in which the detector counts as busy.
pub const BUSY_STATES: &[DetectorState] = &[DetectorState::Acquiring, DetectorState::Standby];

/// Default timeout of detector waits.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(20);

const POLL: Duration = Duration::from_millis(50);

/// Display labels of the AreaDetector state record, by index.
pub const STATE_LABELS: &[&str] = &[
    "Idle",
    "Acquire",
    "Readout",
    "Correct",
    "Saving",
    "Aborting",
    "Error",
    "Waiting",
    "Initializing",
    "Disconnected",
    "Aborted",
];

/// Detector state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DetectorState {
    /// Initializing
    Initializing,
    /// Idle and ready to acquire
    Idle,
    /// Armed and waiting for triggers
    Armed,
    /// Triggered and acquiring
    Acquiring,
    /// Readout, corrections or saving in progress
    Standby,
    /// Detector error
    Error,
}

impl DetectorState {
    /// Decode a state record index.
    pub fn from_index(index: i64) -> Self {
        match index {
            1 | 2 => DetectorState::Acquiring,
            3..=5 | 7 => DetectorState::Standby,
            6 | 9 => DetectorState::Error,
            8 => DetectorState::Initializing,
            _ => DetectorState::Idle,
        }
    }

    /// Decode a state record display label.
    pub fn from_label(label: &str) -> Self {
        STATE_LABELS
            .iter()
            .position(|l| l.eq_ignore_ascii_case(label.trim()))
            .map(|index| Self::from_index(index as i64))
            .unwrap_or(DetectorState::Idle)
    }

    /// Decode either representation.
    pub fn decode(value: &PvValue) -> Self {
        match value {
            PvValue::String(label) => Self::from_label(label),
            other => other.as_i64().map(Self::from_index).unwrap_or(DetectorState::Idle),
        }
    }

    /// Whether the state is one of [`BUSY_STATES`].
    pub fn is_busy(self) -> bool {
        BUSY_STATES.contains(&self)
    }
}

impl fmt::Display for DetectorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Acquisition phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorPhase {
    /// Not acquiring
    Idle,
    /// Armed
    Armed,
    /// Acquiring
    Acquiring,
}

/// Read-back samples that drive the phase machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorSignal {
    /// Armed read-back changed
    Armed(bool),
    /// Acquire read-back changed
    Acquiring(bool),
}

/// Events emitted by the detector.
#[derive(Debug, Clone, PartialEq)]
pub enum DetectorEvent {
    /// Housekeeping change
    Device(DeviceEvent),
    /// Decoded state changed
    State(DetectorState),
    /// Acquisition phase advanced
    Phase(DetectorPhase),
}

impl From<DeviceEvent> for DetectorEvent {
    fn from(event: DeviceEvent) -> Self {
        DetectorEvent::Device(event)
    }
}

struct DetectorInner {
    core: Arc<DeviceCore<DetectorEvent>>,
    phase: StateMachine<DetectorPhase, DetectorSignal>,
    last_state: Mutex<Option<DetectorState>>,
    acquire_cmd: ProcessVariable,
    acquire_status: ProcessVariable,
    state_value: ProcessVariable,
    armed_status: ProcessVariable,
}

impl DetectorInner {
    fn state(&self) -> DetectorState {
        if self.armed_status.get_i64() == Some(1) {
            return DetectorState::Armed;
        }
        self.state_value
            .get(false)
            .map(|value| DetectorState::decode(&value))
            .unwrap_or(DetectorState::Idle)
    }

    fn refresh_state(&self) {
        let state = self.state();
        let mut last = self.last_state.lock();
        if *last != Some(state) {
            *last = Some(state);
            tracing::debug!(device = %self.core.name(), %state, "Detector state");
            self.core.emit(DetectorEvent::State(state));
        }
        self.core.set_busy(state.is_busy());
    }

    fn sample(&self, signal: DetectorSignal) {
        if self.phase.update(&signal) {
            self.core.emit(DetectorEvent::Phase(self.phase.current()));
        } else if signal == DetectorSignal::Acquiring(false) && !self.phase.is(&DetectorPhase::Idle) {
            if self.phase.change_state(&DetectorPhase::Idle).is_ok() {
                self.core.emit(DetectorEvent::Phase(DetectorPhase::Idle));
            }
        }
    }
}

fn on_change<F>(pv: &ProcessVariable, inner: &Weak<DetectorInner>, handler: F)
where
    F: Fn(&DetectorInner, &PvValue) + Send + Sync + 'static,
{
    let inner = inner.clone();
    pv.subscribe_changes(move |value| {
        if let Some(inner) = inner.upgrade() {
            handler(&inner, value);
        }
    });
}

/// AreaDetector-style detector.
pub struct Detector {
    inner: Arc<DetectorInner>,
}

impl fmt::Debug for Detector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Detector")
            .field("core", &self.inner.core)
            .field("phase", &self.inner.phase.current())
            .finish_non_exhaustive()
    }
}

impl Detector {
    /// Connect the detector channels named by `channels`.
    pub fn new(ctx: &PvContext, name: impl Into<String>, channels: &ChannelMap) -> AppResult<Self> {
        let name = name.into();
        let phase = StateMachine::new(
            format!("{name} acquisition"),
            vec![DetectorPhase::Idle, DetectorPhase::Armed, DetectorPhase::Acquiring],
            vec![
                DetectorSignal::Acquiring(false),
                DetectorSignal::Armed(true),
                DetectorSignal::Acquiring(true),
            ],
            DetectorPhase::Idle,
        )?;
        let inner = Arc::new(DetectorInner {
            core: DeviceCore::new(name, ctx.dispatcher().clone()),
            phase,
            last_state: Mutex::new(None),
            acquire_cmd: ctx.pv(channels.get("acquire_cmd")?),
            acquire_status: ctx.pv(channels.get("acquire_status")?),
            state_value: ctx.pv(channels.get("state_value")?),
            armed_status: ctx.pv(channels.get("armed_status")?),
        });
        for pv in [
            &inner.acquire_cmd,
            &inner.acquire_status,
            &inner.state_value,
            &inner.armed_status,
        ] {
            inner.core.add_component(pv);
        }

        let weak = Arc::downgrade(&inner);
        on_change(&inner.state_value, &weak, |d, _| d.refresh_state());
        on_change(&inner.armed_status, &weak, |d, value| {
            d.sample(DetectorSignal::Armed(value.as_i64() == Some(1)));
            d.refresh_state();
        });
        on_change(&inner.acquire_status, &weak, |d, value| {
            d.sample(DetectorSignal::Acquiring(value.as_i64() == Some(1)));
        });

        Ok(Self { inner })
    }

    /// Descriptive name.
    pub fn name(&self) -> &str {
        self.inner.core.name()
    }

    /// Housekeeping state.
    pub fn device_state(&self) -> DeviceState {
        self.inner.core.state()
    }

    /// Current state, decoded from the read-backs.
    pub fn state(&self) -> DetectorState {
        self.inner.state()
    }

    /// Current acquisition phase.
    pub fn phase(&self) -> DetectorPhase {
        self.inner.phase.current()
    }

    /// Start acquiring.
    pub fn start(&self) {
        tracing::debug!(device = %self.name(), "Starting acquisition");
        self.inner.acquire_cmd.put(1, false);
    }

    /// Stop acquiring.
    pub fn stop(&self) {
        tracing::debug!(device = %self.name(), "Stopping acquisition");
        self.inner.acquire_cmd.put(0, false);
    }

    /// Poll every 50 ms until the state is one of `states` ([`BUSY_STATES`] when empty).
    pub fn wait_until(&self, states: &[DetectorState], timeout: Duration) -> WaitOutcome {
        let states = if states.is_empty() { BUSY_STATES } else { states };
        warn_if_dispatch_thread(self.inner.core.dispatcher(), self.name(), "wait_until");
        tracing::debug!(device = %self.name(), ?states, "Waiting for states");
        let outcome = poll_until(POLL, timeout, || states.contains(&self.state()));
        match outcome {
            WaitOutcome::Reached => {
                tracing::debug!(device = %self.name(), state = %self.state(), "State attained")
            }
            _ => tracing::warn!(device = %self.name(), ?states, "Timed out waiting for states"),
        }
        outcome
    }

    /// Poll every 50 ms while the state is one of `states` ([`BUSY_STATES`] when empty).
    pub fn wait_while(&self, states: &[DetectorState], timeout: Duration) -> WaitOutcome {
        let states = if states.is_empty() { BUSY_STATES } else { states };
        warn_if_dispatch_thread(self.inner.core.dispatcher(), self.name(), "wait_while");
        tracing::debug!(device = %self.name(), ?states, "Waiting while in states");
        let outcome = poll_until(POLL, timeout, || !states.contains(&self.state()));
        match outcome {
            WaitOutcome::Reached => {
                tracing::debug!(device = %self.name(), state = %self.state(), "State attained")
            }
            _ => tracing::warn!(device = %self.name(), ?states, "Timed out waiting in states"),
        }
        outcome
    }

    /// Wait while the detector is busy.
    pub fn wait(&self) -> WaitOutcome {
        self.wait_while(&[], DEFAULT_TIMEOUT)
    }

    /// Subscribe to detector events.
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&DetectorEvent) + Send + Sync + 'static,
    {
        self.inner.core.subscribe(callback)
    }

    /// Remove a subscription. Idempotent.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.inner.core.unsubscribe(id);
    }

    /// Poll until every channel is connected.
    pub fn wait_active(&self, timeout: Duration) -> WaitOutcome {
        self.inner.core.wait_active(timeout)
    }
}

/// Populate `ioc` with detector records and acquisition logic.
///
/// Writing `1` to the acquire command arms the detector, acquires for
/// `exposure`, passes through a correction step and returns to idle. Writing `0`
/// aborts.
pub fn simulate(ioc: &SimBackend, channels: &ChannelMap, exposure: Duration) -> AppResult<()> {
    let acquire_cmd = channels.get("acquire_cmd")?.to_string();
    let acquire_status = channels.get("acquire_status")?.to_string();
    let state_value = channels.get("state_value")?.to_string();
    let armed_status = channels.get("armed_status")?.to_string();

    ioc.add_record(&acquire_cmd, 0);
    ioc.add_record(&acquire_status, 0);
    ioc.add_enum_record(&state_value, 0, STATE_LABELS);
    ioc.add_record(&armed_status, 0);

    ioc.on_put(&acquire_cmd, move |ioc, value| {
        let (ioc, status, state, armed) = (
            ioc.clone(),
            acquire_status.clone(),
            state_value.clone(),
            armed_status.clone(),
        );
        if value.as_i64() != Some(1) {
            ioc.post(&status, 0);
            ioc.post(&armed, 0);
            ioc.post(&state, 10);
            return;
        }
        std::thread::spawn(move || {
            let acquiring = |ioc: &SimBackend| ioc.value(&status).and_then(|v| v.as_i64()) == Some(1);
            ioc.post(&armed, 1);
            std::thread::sleep(Duration::from_millis(10));
            ioc.post(&armed, 0);
            ioc.post(&status, 1);
            ioc.post(&state, 1);
            std::thread::sleep(exposure);
            if acquiring(&ioc) {
                ioc.post(&state, 3);
                std::thread::sleep(Duration::from_millis(20));
                ioc.post(&state, 0);
                ioc.post(&status, 0);
            }
        });
    });
    Ok(())
}
