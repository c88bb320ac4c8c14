//! Shutters
//!
//! [`EpicsShutter`] drives a shutter through three channels: an open command, a
//! close command and a state read-back. Commands are two-phase pulses: a
//! confirmed write of `1` followed by an unconfirmed write of `0`.
//! [`SimShutter`] has no hardware and changes state immediately.

use super::{poll_until, warn_if_dispatch_thread, DeviceCore, DeviceEvent, DeviceState, WaitOutcome};
use crate::channel::SimBackend;
use crate::config::ChannelMap;
use crate::context::PvContext;
use crate::error::AppResult;
use crate::pv::ProcessVariable;
use crate::signal::SubscriptionId;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Role → channel suffix table for [`EpicsShutter`].
pub const DEFAULT_ROLES: &[(&str, &str)] = &[
    ("open_cmd", "opr:open"),
    ("close_cmd", "opr:close"),
    ("state", "state"),
];

/// Default timeout of [`Shutter::wait`].
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

const POLL: Duration = Duration::from_millis(100);

/// Events emitted by shutters.
#[derive(Debug, Clone, PartialEq)]
pub enum ShutterEvent {
    /// Housekeeping change
    Device(DeviceEvent),
    /// Shutter opened (`true`) or closed (`false`)
    Changed(bool),
}

impl From<DeviceEvent> for ShutterEvent {
    fn from(event: DeviceEvent) -> Self {
        ShutterEvent::Device(event)
    }
}

/// Common shutter interface.
pub trait Shutter: Send + Sync {
    /// Descriptive name.
    fn name(&self) -> &str;

    /// Housekeeping state.
    fn device_state(&self) -> DeviceState;

    /// Whether the shutter is open.
    fn is_open(&self) -> bool;

    /// Open the shutter if closed; with `wait`, block until open.
    fn open(&self, wait: bool);

    /// Close the shutter if open; with `wait`, block until closed.
    fn close(&self, wait: bool);

    /// Subscribe to shutter events.
    fn subscribe(&self, callback: Box<dyn Fn(&ShutterEvent) + Send + Sync>) -> SubscriptionId;

    /// Remove a subscription. Idempotent.
    fn unsubscribe(&self, id: SubscriptionId);

    /// Poll every 100 ms until the shutter is open (`true`) or closed (`false`).
    fn wait(&self, open: bool, timeout: Duration) -> WaitOutcome {
        let action = if open { "open" } else { "close" };
        tracing::debug!(shutter = self.name(), action, "Waiting for shutter");
        let outcome = poll_until(POLL, timeout, || self.is_open() == open);
        match outcome {
            WaitOutcome::Reached => tracing::debug!(shutter = self.name(), action, "Shutter done"),
            _ => tracing::warn!(shutter = self.name(), action, "Timed out waiting for shutter"),
        }
        outcome
    }
}

/// Shutter with open/close command channels and a state read-back.
pub struct EpicsShutter {
    core: Arc<DeviceCore<ShutterEvent>>,
    open_cmd: ProcessVariable,
    close_cmd: ProcessVariable,
    state: ProcessVariable,
}

impl std::fmt::Debug for EpicsShutter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EpicsShutter")
            .field("core", &self.core)
            .field("state", &self.state.name())
            .finish_non_exhaustive()
    }
}

impl EpicsShutter {
    /// Connect the shutter channels named by `channels`.
    pub fn new(ctx: &PvContext, name: impl Into<String>, channels: &ChannelMap) -> AppResult<Self> {
        let core = DeviceCore::new(name, ctx.dispatcher().clone());
        let open_cmd = ctx.pv(channels.get("open_cmd")?);
        let close_cmd = ctx.pv(channels.get("close_cmd")?);
        let state = ctx.pv(channels.get("state")?);
        for pv in [&open_cmd, &close_cmd, &state] {
            core.add_component(pv);
        }

        let opened = AtomicBool::new(false);
        let weak = Arc::downgrade(&core);
        state.subscribe_changes(move |value| {
            let open = value.as_i64() == Some(1);
            if let Some(core) = weak.upgrade() {
                if opened.swap(open, Ordering::SeqCst) != open {
                    core.emit(ShutterEvent::Changed(open));
                }
            }
        });

        Ok(Self {
            core,
            open_cmd,
            close_cmd,
            state,
        })
    }
}

impl Shutter for EpicsShutter {
    fn name(&self) -> &str {
        self.core.name()
    }

    fn device_state(&self) -> DeviceState {
        self.core.state()
    }

    fn is_open(&self) -> bool {
        self.state.get_i64() == Some(1)
    }

    fn open(&self, wait: bool) {
        if self.is_open() {
            return;
        }
        tracing::debug!(shutter = self.name(), "Opening");
        self.open_cmd.toggle(1, 0);
        if wait {
            warn_if_dispatch_thread(self.core.dispatcher(), self.name(), "open");
            self.wait(true, DEFAULT_TIMEOUT);
        }
    }

    fn close(&self, wait: bool) {
        if !self.is_open() {
            return;
        }
        tracing::debug!(shutter = self.name(), "Closing");
        self.close_cmd.toggle(1, 0);
        if wait {
            warn_if_dispatch_thread(self.core.dispatcher(), self.name(), "close");
            self.wait(false, DEFAULT_TIMEOUT);
        }
    }

    fn subscribe(&self, callback: Box<dyn Fn(&ShutterEvent) + Send + Sync>) -> SubscriptionId {
        self.core.subscribe(callback)
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.core.unsubscribe(id);
    }
}

/// Shutter without hardware.
#[derive(Debug)]
pub struct SimShutter {
    core: Arc<DeviceCore<ShutterEvent>>,
    open: AtomicBool,
}

impl SimShutter {
    /// New closed, active shutter.
    pub fn new(ctx: &PvContext, name: impl Into<String>) -> Self {
        let core = DeviceCore::new(name, ctx.dispatcher().clone());
        core.refresh();
        Self {
            core,
            open: AtomicBool::new(false),
        }
    }

    fn set_open(&self, open: bool) {
        if self.open.swap(open, Ordering::SeqCst) != open {
            self.core.emit(ShutterEvent::Changed(open));
        }
    }
}

impl Shutter for SimShutter {
    fn name(&self) -> &str {
        self.core.name()
    }

    fn device_state(&self) -> DeviceState {
        self.core.state()
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn open(&self, _wait: bool) {
        self.set_open(true);
    }

    fn close(&self, _wait: bool) {
        self.set_open(false);
    }

    fn subscribe(&self, callback: Box<dyn Fn(&ShutterEvent) + Send + Sync>) -> SubscriptionId {
        self.core.subscribe(callback)
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.core.unsubscribe(id);
    }
}

/// Populate `ioc` with shutter records whose command pulses move the state
/// read-back after `travel`.
pub fn simulate(ioc: &SimBackend, channels: &ChannelMap, travel: Duration) -> AppResult<()> {
    let state = channels.get("state")?.to_string();
    ioc.add_record(channels.get("open_cmd")?, 0);
    ioc.add_record(channels.get("close_cmd")?, 0);
    ioc.add_record(&state, 0);

    for (role, target) in [("open_cmd", 1), ("close_cmd", 0)] {
        let state = state.clone();
        ioc.on_put(channels.get(role)?, move |ioc, value| {
            if value.as_i64() == Some(1) {
                ioc.post_after(&state, target, travel);
            }
        });
    }
    Ok(())
}
