//! Scanning goniometer
//!
//! The goniometer runs a frame scan when its scan command is processed. Two
//! feedback channels report progress: the scan status (`1` while a frame is
//! scanning) and the shutter output (`1` while the shutter is open). They drive
//! the scan phase machine
//!
//! ```text
//! Idle -> ShutterOpening -> Scanning -> ShutterClosing -> Idle
//! ```
//!
//! which is informational: [`Goniometer::wait`] polls the feedback channels
//! directly, because a short frame can complete between two polls.
//!
//! Mode feedback channels (mounting, centering, collect, beam) determine the
//! current [`GonioMode`].

use super::{
    poll_until, wait_for_activity, warn_if_dispatch_thread, DeviceCore, DeviceEvent, DeviceState,
    WaitOutcome,
};
use crate::channel::SimBackend;
use crate::config::ChannelMap;
use crate::context::PvContext;
use crate::error::{AppResult, BeamlineError};
use crate::pv::ProcessVariable;
use crate::signal::SubscriptionId;
use crate::state::StateMachine;
use crate::value::PvValue;
use parking_lot::Mutex;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Role → channel suffix table.
pub const DEFAULT_ROLES: &[(&str, &str)] = &[
    ("scan_cmd", "scanFrame.PROC"),
    ("stop_cmd", "stop"),
    ("scan_fbk", "scanFrame:status"),
    ("busy_fbk", "moving:fbk"),
    ("calibrated_fbk", "calibrated:fbk"),
    ("shutter_fbk", "outp1:fbk"),
    ("mounting_fbk", "mounting:fbk"),
    ("centering_fbk", "centering:fbk"),
    ("collect_fbk", "collect:fbk"),
    ("beam_fbk", "beam:out"),
    ("mounting_cmd", "mounting.PROC"),
    ("centering_cmd", "centering.PROC"),
    ("collect_cmd", "collect.PROC"),
    ("beam_cmd", "beam:opr:ctl"),
    ("exposure_time", "expTime"),
    ("delta_omega", "deltaOmega"),
    ("open_angle", "openSHPos"),
];

/// Timeout used by [`Goniometer::scan`] when none is given.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(180);

/// Default timeout of [`Goniometer::wait_for_modes`].
pub const MODE_TIMEOUT: Duration = Duration::from_secs(30);

/// Poll interval of goniometer waits.
pub const POLL: Duration = Duration::from_millis(50);

/// Operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GonioMode {
    /// Not yet determined
    Init,
    /// Sample mount position
    Mounting,
    /// Sample centering
    Centering,
    /// Beam alignment
    Beam,
    /// Instrument alignment
    Alignment,
    /// Data collection
    Collect,
    /// Feedback matches no known mode
    Unknown,
    /// Data collection with a scan requested
    Scanning,
}

impl GonioMode {
    /// Upper-case mode name.
    pub fn as_str(self) -> &'static str {
        match self {
            GonioMode::Init => "INIT",
            GonioMode::Mounting => "MOUNTING",
            GonioMode::Centering => "CENTERING",
            GonioMode::Beam => "BEAM",
            GonioMode::Alignment => "ALIGNMENT",
            GonioMode::Collect => "COLLECT",
            GonioMode::Unknown => "UNKNOWN",
            GonioMode::Scanning => "SCANNING",
        }
    }
}

impl fmt::Display for GonioMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GonioMode {
    type Err = BeamlineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mode = match s.to_ascii_uppercase().as_str() {
            "INIT" => GonioMode::Init,
            "MOUNTING" => GonioMode::Mounting,
            "CENTERING" => GonioMode::Centering,
            "BEAM" => GonioMode::Beam,
            "ALIGNMENT" => GonioMode::Alignment,
            "COLLECT" => GonioMode::Collect,
            "UNKNOWN" => GonioMode::Unknown,
            "SCANNING" => GonioMode::Scanning,
            _ => {
                return Err(BeamlineError::InvalidState {
                    machine: "goniometer mode".to_string(),
                    state: s.to_string(),
                })
            }
        };
        Ok(mode)
    }
}

/// Phase of a frame scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GonioPhase {
    /// No scan in progress
    Idle,
    /// Scan started, shutter not yet open
    ShutterOpening,
    /// Shutter open, frame exposing
    Scanning,
    /// Shutter closed, scan finishing
    ShutterClosing,
}

/// Feedback samples that drive the phase machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GonioSignal {
    /// Scan status changed
    ScanActive(bool),
    /// Shutter output changed
    ShutterOpen(bool),
}

/// Events emitted by the goniometer.
#[derive(Debug, Clone, PartialEq)]
pub enum GonioEvent {
    /// Housekeeping change
    Device(DeviceEvent),
    /// Mode changed
    Mode(GonioMode),
    /// Scan phase advanced
    Phase(GonioPhase),
}

impl From<DeviceEvent> for GonioEvent {
    fn from(event: DeviceEvent) -> Self {
        GonioEvent::Device(event)
    }
}

/// Scan parameters written before a scan. `None` leaves a setting untouched.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ScanSettings {
    /// Exposure time in seconds
    pub exposure_time: Option<f64>,
    /// Oscillation width in degrees
    pub delta_omega: Option<f64>,
    /// Start angle in degrees
    pub open_angle: Option<f64>,
}

fn phase_machine(name: &str) -> AppResult<StateMachine<GonioPhase, GonioSignal>> {
    StateMachine::new(
        format!("{name} scan"),
        vec![
            GonioPhase::Idle,
            GonioPhase::ShutterOpening,
            GonioPhase::Scanning,
            GonioPhase::ShutterClosing,
        ],
        vec![
            GonioSignal::ScanActive(false),
            GonioSignal::ScanActive(true),
            GonioSignal::ShutterOpen(true),
            GonioSignal::ShutterOpen(false),
        ],
        GonioPhase::Idle,
    )
}

struct GonioInner {
    core: Arc<DeviceCore<GonioEvent>>,
    phase: StateMachine<GonioPhase, GonioSignal>,
    mode: Mutex<GonioMode>,
    requested_mode: Mutex<Option<GonioMode>>,
    stopped: AtomicBool,

    scan_cmd: ProcessVariable,
    stop_cmd: ProcessVariable,
    scan_fbk: ProcessVariable,
    busy_fbk: ProcessVariable,
    calibrated_fbk: ProcessVariable,
    shutter_fbk: ProcessVariable,
    mode_fbks: Vec<(GonioMode, ProcessVariable)>,
    mode_cmds: Vec<(GonioMode, ProcessVariable)>,
    exposure_time: ProcessVariable,
    delta_omega: ProcessVariable,
    open_angle: ProcessVariable,
}

impl GonioInner {
    fn is_moving(&self) -> bool {
        self.scan_fbk.get_i64() == Some(1) || self.busy_fbk.get_i64() == Some(1)
    }

    fn mode_fbk(&self, mode: GonioMode) -> Option<i64> {
        self.mode_fbks
            .iter()
            .find(|(m, _)| *m == mode)
            .and_then(|(_, pv)| pv.get_i64())
    }

    fn sample(&self, signal: GonioSignal) {
        if self.phase.update(&signal) {
            self.core.emit(GonioEvent::Phase(self.phase.current()));
        } else if signal == GonioSignal::ScanActive(false) && !self.phase.is(&GonioPhase::Idle) {
            // Feedback skipped a phase; the scan is over regardless.
            if self.phase.change_state(&GonioPhase::Idle).is_ok() {
                tracing::debug!(device = %self.core.name(), "Scan phase resynchronized");
                self.core.emit(GonioEvent::Phase(GonioPhase::Idle));
            }
        }
    }

    fn refresh_busy(&self) {
        self.core.set_busy(self.is_moving());
    }

    fn refresh_mode(&self) {
        let mode = if self.mode_fbk(GonioMode::Centering) == Some(1) {
            GonioMode::Centering
        } else if self.mode_fbk(GonioMode::Mounting) == Some(1)
            && self.calibrated_fbk.get_i64() == Some(1)
        {
            GonioMode::Mounting
        } else if self.mode_fbk(GonioMode::Beam) == Some(0) {
            GonioMode::Beam
        } else if self.mode_fbk(GonioMode::Collect) == Some(1) {
            match *self.requested_mode.lock() {
                Some(requested @ (GonioMode::Collect | GonioMode::Scanning)) => requested,
                _ => GonioMode::Collect,
            }
        } else {
            GonioMode::Unknown
        };

        let mut current = self.mode.lock();
        if *current != mode {
            *current = mode;
            tracing::debug!(device = %self.core.name(), %mode, "Mode changed");
            self.core.emit(GonioEvent::Mode(mode));
        }
    }
}

fn on_change<F>(pv: &ProcessVariable, inner: &Weak<GonioInner>, handler: F)
where
    F: Fn(&GonioInner, &PvValue) + Send + Sync + 'static,
{
    let inner = inner.clone();
    pv.subscribe_changes(move |value| {
        if let Some(inner) = inner.upgrade() {
            handler(&inner, value);
        }
    });
}

/// Goniometer driven by scan, shutter and mode feedback channels.
pub struct Goniometer {
    inner: Arc<GonioInner>,
}

impl fmt::Debug for Goniometer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Goniometer")
            .field("core", &self.inner.core)
            .field("phase", &self.inner.phase.current())
            .field("mode", &*self.inner.mode.lock())
            .finish_non_exhaustive()
    }
}

impl Goniometer {
    /// Connect the goniometer channels named by `channels`.
    pub fn new(ctx: &PvContext, name: impl Into<String>, channels: &ChannelMap) -> AppResult<Self> {
        let name = name.into();
        let core = DeviceCore::new(name.clone(), ctx.dispatcher().clone());
        let pv = |role: &str| channels.get(role).map(|channel| ctx.pv(channel));
        let setting = |role: &str| channels.get(role).map(|channel| ctx.pv_unmonitored(channel));

        let inner = Arc::new(GonioInner {
            phase: phase_machine(&name)?,
            mode: Mutex::new(GonioMode::Init),
            requested_mode: Mutex::new(None),
            stopped: AtomicBool::new(true),
            scan_cmd: pv("scan_cmd")?,
            stop_cmd: pv("stop_cmd")?,
            scan_fbk: pv("scan_fbk")?,
            busy_fbk: pv("busy_fbk")?,
            calibrated_fbk: pv("calibrated_fbk")?,
            shutter_fbk: pv("shutter_fbk")?,
            mode_fbks: vec![
                (GonioMode::Mounting, pv("mounting_fbk")?),
                (GonioMode::Centering, pv("centering_fbk")?),
                (GonioMode::Collect, pv("collect_fbk")?),
                (GonioMode::Beam, pv("beam_fbk")?),
            ],
            mode_cmds: vec![
                (GonioMode::Mounting, pv("mounting_cmd")?),
                (GonioMode::Centering, pv("centering_cmd")?),
                (GonioMode::Collect, pv("collect_cmd")?),
                (GonioMode::Beam, pv("beam_cmd")?),
            ],
            exposure_time: setting("exposure_time")?,
            delta_omega: setting("delta_omega")?,
            open_angle: setting("open_angle")?,
            core,
        });

        for pv in [
            &inner.scan_cmd,
            &inner.stop_cmd,
            &inner.scan_fbk,
            &inner.busy_fbk,
            &inner.calibrated_fbk,
            &inner.shutter_fbk,
            &inner.exposure_time,
            &inner.delta_omega,
            &inner.open_angle,
        ] {
            inner.core.add_component(pv);
        }
        for (_, pv) in inner.mode_fbks.iter().chain(&inner.mode_cmds) {
            inner.core.add_component(pv);
        }

        let weak = Arc::downgrade(&inner);
        on_change(&inner.scan_fbk, &weak, |g, value| {
            g.sample(GonioSignal::ScanActive(value.as_i64() == Some(1)));
            g.refresh_busy();
            g.refresh_mode();
        });
        on_change(&inner.shutter_fbk, &weak, |g, value| {
            g.sample(GonioSignal::ShutterOpen(value.as_i64() == Some(1)));
        });
        on_change(&inner.busy_fbk, &weak, |g, _| {
            g.refresh_busy();
            g.refresh_mode();
        });
        on_change(&inner.calibrated_fbk, &weak, |g, _| g.refresh_mode());
        for (_, pv) in &inner.mode_fbks {
            on_change(pv, &weak, |g, _| g.refresh_mode());
        }

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

    /// Whether a scan or move is in progress, read directly from feedback.
    pub fn is_busy(&self) -> bool {
        self.inner.is_moving()
    }

    /// Current scan phase.
    pub fn phase(&self) -> GonioPhase {
        self.inner.phase.current()
    }

    /// Current mode.
    pub fn mode(&self) -> GonioMode {
        *self.inner.mode.lock()
    }

    /// Wait for the goniometer to start and/or stop moving.
    ///
    /// An expired start phase is not reported; see
    /// [`wait_for_activity`](super::wait_for_activity). [`Goniometer::stop`]
    /// aborts the wait.
    pub fn wait(&self, start: bool, stop: bool, poll: Duration, timeout: Duration) -> WaitOutcome {
        warn_if_dispatch_thread(self.inner.core.dispatcher(), self.name(), "wait");
        self.inner.stopped.store(false, Ordering::SeqCst);
        wait_for_activity(
            self.name(),
            || self.inner.is_moving(),
            start,
            stop,
            poll,
            timeout,
            Some(&self.inner.stopped),
        )
    }

    /// Write scan parameters.
    pub fn configure(&self, settings: &ScanSettings) {
        let writes = [
            (&self.inner.exposure_time, settings.exposure_time),
            (&self.inner.delta_omega, settings.delta_omega),
            (&self.inner.open_angle, settings.open_angle),
        ];
        for (pv, value) in writes {
            if let Some(value) = value {
                pv.put(value, false);
            }
        }
    }

    /// Read scan parameters back from the device.
    pub fn settings(&self) -> ScanSettings {
        ScanSettings {
            exposure_time: self.inner.exposure_time.get_f64(),
            delta_omega: self.inner.delta_omega.get_f64(),
            open_angle: self.inner.open_angle.get_f64(),
        }
    }

    /// Run one frame scan.
    ///
    /// Waits for any motion in progress to finish, processes the scan command and
    /// then waits for the scan to start and, with `wait`, to finish.
    pub fn scan(&self, wait: bool, timeout: Option<Duration>) -> WaitOutcome {
        let timeout = timeout.unwrap_or(DEFAULT_TIMEOUT);
        self.inner.core.set_message("Scanning ...");
        self.wait(false, true, POLL, timeout);
        self.inner.scan_cmd.put(1, false);
        let outcome = self.wait(true, wait, POLL, timeout);
        if wait && outcome.is_reached() {
            self.inner.core.set_message("Scan complete!");
        }
        outcome
    }

    /// Abort the current scan and any wait in progress.
    pub fn stop(&self) {
        tracing::debug!(device = %self.name(), "Stopping goniometer");
        self.inner.stopped.store(true, Ordering::SeqCst);
        self.inner.stop_cmd.put(1, false);
    }

    /// Switch to `mode`; with `wait`, block until the feedback reports it.
    ///
    /// Modes without a command channel (`INIT`, `ALIGNMENT`, `UNKNOWN`) are
    /// rejected.
    pub fn set_mode(&self, mode: GonioMode, wait: bool) -> AppResult<WaitOutcome> {
        let target = if mode == GonioMode::Scanning {
            GonioMode::Collect
        } else {
            mode
        };
        let cmd = self
            .inner
            .mode_cmds
            .iter()
            .find(|(m, _)| *m == target)
            .map(|(_, pv)| pv)
            .ok_or_else(|| BeamlineError::InvalidState {
                machine: format!("{} mode", self.name()),
                state: mode.to_string(),
            })?;

        if self.is_busy() {
            self.wait(false, true, POLL, DEFAULT_TIMEOUT);
        }
        self.inner
            .core
            .set_message(format!("Switching mode to: {mode}"));
        *self.inner.requested_mode.lock() = Some(mode);
        cmd.put(1, false);

        if wait {
            Ok(self.wait_for_modes(&[target, mode], MODE_TIMEOUT))
        } else {
            Ok(WaitOutcome::Reached)
        }
    }

    /// Poll every 50 ms until the mode is one of `modes`, or until the device is
    /// idle when `modes` is empty.
    pub fn wait_for_modes(&self, modes: &[GonioMode], timeout: Duration) -> WaitOutcome {
        warn_if_dispatch_thread(self.inner.core.dispatcher(), self.name(), "wait_for_modes");
        let outcome = if modes.is_empty() {
            tracing::debug!(device = %self.name(), "Waiting to stop moving");
            poll_until(POLL, timeout, || !self.is_busy())
        } else {
            tracing::debug!(device = %self.name(), ?modes, "Waiting for modes");
            poll_until(POLL, timeout, || modes.contains(&self.mode()))
        };
        if outcome == WaitOutcome::TimedOut {
            tracing::warn!(device = %self.name(), "Timed out waiting for goniometer");
        }
        outcome
    }

    /// Subscribe to goniometer events.
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&GonioEvent) + Send + Sync + 'static,
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

/// Populate `ioc` with goniometer records and scan/mode logic.
///
/// Processing the scan command raises the scan status, opens the shutter output
/// for the configured exposure time, closes it and drops the scan status.
pub fn simulate(ioc: &SimBackend, channels: &ChannelMap) -> AppResult<()> {
    for (role, _) in DEFAULT_ROLES {
        let initial = match *role {
            "calibrated_fbk" | "beam_fbk" | "collect_fbk" => PvValue::Int(1),
            "exposure_time" => PvValue::Double(0.1),
            "delta_omega" => PvValue::Double(1.0),
            "open_angle" => PvValue::Double(0.0),
            _ => PvValue::Int(0),
        };
        ioc.add_record(channels.get(role)?, initial);
    }

    let scan_fbk = channels.get("scan_fbk")?.to_string();
    let shutter_fbk = channels.get("shutter_fbk")?.to_string();
    let exposure = channels.get("exposure_time")?.to_string();
    {
        let (scan_fbk, shutter_fbk) = (scan_fbk.clone(), shutter_fbk.clone());
        ioc.on_put(channels.get("scan_cmd")?, move |ioc, value| {
            if value.as_i64() != Some(1) {
                return;
            }
            let exposure = ioc
                .value(&exposure)
                .and_then(|v| v.as_f64())
                .filter(|t| t.is_finite() && *t >= 0.0)
                .unwrap_or(0.1);
            let (ioc, scan_fbk, shutter_fbk) = (ioc.clone(), scan_fbk.clone(), shutter_fbk.clone());
            std::thread::spawn(move || {
                let scanning = |ioc: &SimBackend| ioc.value(&scan_fbk).and_then(|v| v.as_i64()) == Some(1);
                ioc.post(&scan_fbk, 1);
                std::thread::sleep(Duration::from_millis(10));
                if scanning(&ioc) {
                    ioc.post(&shutter_fbk, 1);
                    std::thread::sleep(Duration::from_secs_f64(exposure));
                }
                if scanning(&ioc) {
                    ioc.post(&shutter_fbk, 0);
                    std::thread::sleep(Duration::from_millis(10));
                    ioc.post(&scan_fbk, 0);
                }
            });
        });
    }
    ioc.on_put(channels.get("stop_cmd")?, move |ioc, value| {
        if value.as_i64() == Some(1) {
            ioc.post(&shutter_fbk, 0);
            ioc.post(&scan_fbk, 0);
        }
    });

    let fbk = |mode: &str| channels.get(mode).map(str::to_string);
    let mounting = fbk("mounting_fbk")?;
    let centering = fbk("centering_fbk")?;
    let collect = fbk("collect_fbk")?;
    let beam = fbk("beam_fbk")?;
    for (cmd, mode) in [
        ("mounting_cmd", GonioMode::Mounting),
        ("centering_cmd", GonioMode::Centering),
        ("collect_cmd", GonioMode::Collect),
        ("beam_cmd", GonioMode::Beam),
    ] {
        let (mounting, centering, collect, beam) =
            (mounting.clone(), centering.clone(), collect.clone(), beam.clone());
        ioc.on_put(channels.get(cmd)?, move |ioc, value| {
            if value.as_i64() != Some(1) {
                return;
            }
            ioc.post(&mounting, i64::from(mode == GonioMode::Mounting));
            ioc.post(&centering, i64::from(mode == GonioMode::Centering));
            ioc.post(&collect, i64::from(mode == GonioMode::Collect));
            ioc.post(&beam, i64::from(mode != GonioMode::Beam));
        });
    }
    Ok(())
}
