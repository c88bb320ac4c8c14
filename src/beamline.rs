//! Beamline device registry
//!
//! [`Beamline`] builds every enabled device of a [`BeamlineConfig`] on one
//! [`PvContext`] and looks them up by id. Device operations block while they
//! wait for hardware, so the `async` entry points ([`Beamline::scan`],
//! [`Beamline::open_shutter`], [`Beamline::acquire`], ...) run them on tokio's
//! blocking pool. An RPC or GUI task can await them without stalling its own
//! executor thread.
//!
//! # Example
//!
//! ```rust,ignore
//! let config = BeamlineConfig::load_from("config/beamline.toml")?;
//! let (beamline, _ioc) = Beamline::simulated(config)?;
//! beamline.wait_ready();
//! let outcome = beamline.scan("gonio", None).await?;
//! ```

use crate::channel::SimBackend;
use crate::config::{BeamlineConfig, DeviceDefinition, DeviceKind};
use crate::context::PvContext;
use crate::device::{
    detector, goniometer, poll_until, shutter, Detector, DetectorState, DeviceState, EpicsShutter,
    Goniometer, Shutter, WaitOutcome,
};
use crate::error::{AppResult, BeamlineError};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// A configured device.
#[derive(Clone)]
pub enum DeviceHandle {
    /// Shutter
    Shutter(Arc<dyn Shutter>),
    /// Goniometer
    Goniometer(Arc<Goniometer>),
    /// Detector
    Detector(Arc<Detector>),
}

impl std::fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple(self.kind().as_str())
            .field(&self.device_state())
            .finish()
    }
}

impl DeviceHandle {
    /// Kind of the device.
    pub fn kind(&self) -> DeviceKind {
        match self {
            DeviceHandle::Shutter(_) => DeviceKind::Shutter,
            DeviceHandle::Goniometer(_) => DeviceKind::Goniometer,
            DeviceHandle::Detector(_) => DeviceKind::Detector,
        }
    }

    /// Descriptive name.
    pub fn name(&self) -> &str {
        match self {
            DeviceHandle::Shutter(d) => d.name(),
            DeviceHandle::Goniometer(d) => d.name(),
            DeviceHandle::Detector(d) => d.name(),
        }
    }

    /// Housekeeping state.
    pub fn device_state(&self) -> DeviceState {
        match self {
            DeviceHandle::Shutter(d) => d.device_state(),
            DeviceHandle::Goniometer(d) => d.device_state(),
            DeviceHandle::Detector(d) => d.device_state(),
        }
    }

    /// One-line description of the device-specific state.
    pub fn detail(&self) -> String {
        match self {
            DeviceHandle::Shutter(d) if d.is_open() => "open".to_string(),
            DeviceHandle::Shutter(_) => "closed".to_string(),
            DeviceHandle::Goniometer(d) => format!("mode={} phase={:?}", d.mode(), d.phase()),
            DeviceHandle::Detector(d) => format!("state={} phase={:?}", d.state(), d.phase()),
        }
    }
}

/// Status line of one device.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceStatus {
    /// Device id
    pub id: String,
    /// Device kind
    pub kind: DeviceKind,
    /// Descriptive name
    pub name: String,
    /// All components connected
    pub active: bool,
    /// Operation in progress
    pub busy: bool,
    /// Combined health bits
    pub health: u32,
    /// Health message
    pub health_message: String,
    /// Device-specific state
    pub detail: String,
}

/// Registry of configured devices.
#[derive(Debug)]
pub struct Beamline {
    config: BeamlineConfig,
    context: PvContext,
    devices: BTreeMap<String, DeviceHandle>,
}

impl Beamline {
    /// Build every enabled device of `config` on `context`.
    pub fn new(context: PvContext, config: BeamlineConfig) -> AppResult<Self> {
        config.validate()?;
        let mut devices = BTreeMap::new();
        for definition in config.enabled_devices() {
            let device = build_device(&context, definition)?;
            tracing::info!(
                id = %definition.id,
                kind = %definition.kind,
                root = %definition.root,
                "Device created"
            );
            devices.insert(definition.id.clone(), device);
        }
        Ok(Self {
            config,
            context,
            devices,
        })
    }

    /// Build `config` against a simulated IOC populated with every enabled device.
    pub fn simulated(config: BeamlineConfig) -> AppResult<(Self, SimBackend)> {
        let ioc = SimBackend::new();
        install_simulation(&ioc, &config)?;
        let context = PvContext::from_config(Arc::new(ioc.clone()), &config)?;
        Ok((Self::new(context, config)?, ioc))
    }

    /// The configuration the registry was built from.
    pub fn config(&self) -> &BeamlineConfig {
        &self.config
    }

    /// The PV context devices share.
    pub fn context(&self) -> &PvContext {
        &self.context
    }

    /// Device ids, sorted.
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.devices.keys().map(String::as_str)
    }

    /// Look up a device.
    pub fn device(&self, id: &str) -> AppResult<&DeviceHandle> {
        self.devices
            .get(id)
            .ok_or_else(|| BeamlineError::UnknownDevice(id.to_string()))
    }

    fn wrong_kind(id: &str, expected: DeviceKind, actual: DeviceKind) -> BeamlineError {
        BeamlineError::WrongDeviceKind {
            id: id.to_string(),
            expected: expected.as_str(),
            actual: actual.as_str(),
        }
    }

    /// Look up a shutter.
    pub fn shutter(&self, id: &str) -> AppResult<Arc<dyn Shutter>> {
        match self.device(id)? {
            DeviceHandle::Shutter(d) => Ok(d.clone()),
            other => Err(Self::wrong_kind(id, DeviceKind::Shutter, other.kind())),
        }
    }

    /// Look up a goniometer.
    pub fn goniometer(&self, id: &str) -> AppResult<Arc<Goniometer>> {
        match self.device(id)? {
            DeviceHandle::Goniometer(d) => Ok(d.clone()),
            other => Err(Self::wrong_kind(id, DeviceKind::Goniometer, other.kind())),
        }
    }

    /// Look up a detector.
    pub fn detector(&self, id: &str) -> AppResult<Arc<Detector>> {
        match self.device(id)? {
            DeviceHandle::Detector(d) => Ok(d.clone()),
            other => Err(Self::wrong_kind(id, DeviceKind::Detector, other.kind())),
        }
    }

    /// Status of every device.
    pub fn status(&self) -> Vec<DeviceStatus> {
        self.devices
            .iter()
            .map(|(id, device)| {
                let state = device.device_state();
                DeviceStatus {
                    id: id.clone(),
                    kind: device.kind(),
                    name: device.name().to_string(),
                    active: state.active,
                    busy: state.busy,
                    health: state.health.severity.bits(),
                    health_message: state.health.message,
                    detail: device.detail(),
                }
            })
            .collect()
    }

    /// Poll until every device is active or the connect timeout elapses.
    ///
    /// Returns the ids of devices that are still inactive.
    pub fn wait_ready(&self) -> Vec<String> {
        let timeout = self.context.connect_timeout();
        poll_until(Duration::from_millis(20), timeout, || {
            self.devices.values().all(|d| d.device_state().active)
        });
        let inactive: Vec<String> = self
            .devices
            .iter()
            .filter(|(_, d)| !d.device_state().active)
            .map(|(id, _)| id.clone())
            .collect();
        if !inactive.is_empty() {
            tracing::warn!(devices = ?inactive, "Devices not active after connect timeout");
        }
        inactive
    }

    /// Run one goniometer scan to completion off the calling task.
    pub async fn scan(&self, id: &str, timeout: Option<Duration>) -> AppResult<WaitOutcome> {
        let gonio = self.goniometer(id)?;
        Ok(tokio::task::spawn_blocking(move || gonio.scan(true, timeout)).await?)
    }

    /// Stop a goniometer scan.
    pub async fn stop_scan(&self, id: &str) -> AppResult<()> {
        let gonio = self.goniometer(id)?;
        Ok(tokio::task::spawn_blocking(move || gonio.stop()).await?)
    }

    /// Open a shutter and wait for it to report open.
    pub async fn open_shutter(&self, id: &str, timeout: Duration) -> AppResult<WaitOutcome> {
        let shutter = self.shutter(id)?;
        Ok(tokio::task::spawn_blocking(move || {
            shutter.open(false);
            shutter.wait(true, timeout)
        })
        .await?)
    }

    /// Close a shutter and wait for it to report closed.
    pub async fn close_shutter(&self, id: &str, timeout: Duration) -> AppResult<WaitOutcome> {
        let shutter = self.shutter(id)?;
        Ok(tokio::task::spawn_blocking(move || {
            shutter.close(false);
            shutter.wait(false, timeout)
        })
        .await?)
    }

    /// Start an acquisition and wait until the detector is no longer busy.
    pub async fn acquire(&self, id: &str, timeout: Duration) -> AppResult<WaitOutcome> {
        let detector = self.detector(id)?;
        Ok(tokio::task::spawn_blocking(move || {
            detector.start();
            match detector.wait_until(&[DetectorState::Armed, DetectorState::Acquiring], timeout) {
                WaitOutcome::Reached => detector.wait_while(
                    &[
                        DetectorState::Armed,
                        DetectorState::Acquiring,
                        DetectorState::Standby,
                    ],
                    timeout,
                ),
                other => other,
            }
        })
        .await?)
    }
}

fn build_device(context: &PvContext, definition: &DeviceDefinition) -> AppResult<DeviceHandle> {
    let channels = definition.channels()?;
    let name = definition.display_name();
    let device = match definition.kind {
        DeviceKind::Shutter => {
            DeviceHandle::Shutter(Arc::new(EpicsShutter::new(context, name, &channels)?))
        }
        DeviceKind::Goniometer => {
            DeviceHandle::Goniometer(Arc::new(Goniometer::new(context, name, &channels)?))
        }
        DeviceKind::Detector => {
            DeviceHandle::Detector(Arc::new(Detector::new(context, name, &channels)?))
        }
    };
    Ok(device)
}

/// Add records and IOC logic for every enabled device of `config` to `ioc`.
pub fn install_simulation(ioc: &SimBackend, config: &BeamlineConfig) -> AppResult<()> {
    for definition in config.enabled_devices() {
        let channels = definition.channels()?;
        match definition.kind {
            DeviceKind::Shutter => shutter::simulate(ioc, &channels, Duration::from_millis(50))?,
            DeviceKind::Goniometer => goniometer::simulate(ioc, &channels)?,
            DeviceKind::Detector => {
                detector::simulate(ioc, &channels, Duration::from_millis(100))?
            }
        }
        tracing::debug!(id = %definition.id, "Simulated records installed");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> BeamlineConfig {
        BeamlineConfig {
            devices: vec![
                DeviceDefinition::new("shutter", DeviceKind::Shutter, "PSH"),
                DeviceDefinition::new("gonio", DeviceKind::Goniometer, "GON"),
                DeviceDefinition::new("ccd", DeviceKind::Detector, "CCD:cam1"),
            ],
            ..Default::default()
        }
    }

    #[test]
    fn builds_and_looks_up_devices() {
        let (beamline, _ioc) = Beamline::simulated(config()).unwrap();
        assert_eq!(beamline.ids().collect::<Vec<_>>(), vec!["ccd", "gonio", "shutter"]);
        assert!(beamline.wait_ready().is_empty());

        assert!(beamline.goniometer("gonio").is_ok());
        assert!(matches!(
            beamline.goniometer("shutter"),
            Err(BeamlineError::WrongDeviceKind {
                expected: "goniometer",
                actual: "shutter",
                ..
            })
        ));
        assert!(matches!(
            beamline.device("nope"),
            Err(BeamlineError::UnknownDevice(_))
        ));

        let status = beamline.status();
        assert_eq!(status.len(), 3);
        assert!(status.iter().all(|s| s.active));
    }

    #[test]
    fn disabled_devices_are_skipped() {
        let mut config = config();
        config.devices[2].enabled = false;
        let (beamline, _ioc) = Beamline::simulated(config).unwrap();
        assert!(beamline.detector("ccd").is_err());
    }

    #[test]
    fn invalid_config_is_rejected() {
        let mut config = config();
        config.devices[1].id = "shutter".into();
        assert!(matches!(
            Beamline::simulated(config),
            Err(BeamlineError::Configuration(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn async_operations_run_off_the_executor() {
        let (beamline, ioc) = Beamline::simulated(config()).unwrap();
        assert!(beamline.wait_ready().is_empty());

        let outcome = beamline
            .open_shutter("shutter", Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(outcome, WaitOutcome::Reached);
        assert_eq!(ioc.value("PSH:state"), Some(crate::value::PvValue::Int(1)));

        let outcome = beamline.scan("gonio", Some(Duration::from_secs(5))).await.unwrap();
        assert_eq!(outcome, WaitOutcome::Reached);

        let outcome = beamline.acquire("ccd", Duration::from_secs(5)).await.unwrap();
        assert_eq!(outcome, WaitOutcome::Reached);

        let outcome = beamline
            .close_shutter("shutter", Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(outcome, WaitOutcome::Reached);
    }
}
