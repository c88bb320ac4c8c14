//! Beamline Configuration using Figment
//!
//! Configuration is loaded from:
//! 1. a TOML file (`config/beamline.toml` by default)
//! 2. environment variables prefixed with `BEAMLINE_`, nested keys separated by `__`
//!
//! Each device entry names a kind, a channel root and optional role overrides.
//! Every device kind publishes a default role table mapping role names to
//! channel suffixes; the full channel name of a role is `"{root}:{suffix}"`,
//! or `"{root}{suffix}"` when the suffix already starts with `.` or `:`.
//!
//! # Example
//! ```no_run
//! use beamline_pv::config::BeamlineConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = BeamlineConfig::load_from("config/beamline.toml")?;
//! config.validate()?;
//! for device in config.enabled_devices() {
//!     println!("{} ({}) at {}", device.id, device.kind, device.root);
//! }
//! # Ok(())
//! # }
//! ```

use crate::device::{detector, goniometer, shutter};
use crate::error::{AppResult, BeamlineError};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::Path;
use std::time::Duration;

/// Top-level beamline configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BeamlineConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Channel protocol settings
    #[serde(default)]
    pub channel: ChannelConfig,
    /// Dispatch context settings
    #[serde(default)]
    pub dispatch: DispatchConfig,
    /// Device definitions
    #[serde(default)]
    pub devices: Vec<DeviceDefinition>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "beamline".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Channel protocol timeouts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// How long a confirmed put waits for acknowledgement
    #[serde(with = "humantime_serde", default = "default_put_timeout")]
    pub put_timeout: Duration,
    /// How long startup waits for device channels to connect
    #[serde(with = "humantime_serde", default = "default_connect_timeout")]
    pub connect_timeout: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            put_timeout: default_put_timeout(),
            connect_timeout: default_connect_timeout(),
        }
    }
}

/// Dispatch context configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Name of the dispatch thread
    #[serde(default = "default_thread_name")]
    pub thread_name: String,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            thread_name: default_thread_name(),
        }
    }
}

/// Kinds of device the registry can build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    /// Three-channel shutter (open command, close command, state)
    Shutter,
    /// Scanning goniometer
    Goniometer,
    /// Area detector
    Detector,
}

impl DeviceKind {
    /// Configuration name of the kind.
    pub fn as_str(self) -> &'static str {
        match self {
            DeviceKind::Shutter => "shutter",
            DeviceKind::Goniometer => "goniometer",
            DeviceKind::Detector => "detector",
        }
    }

    /// Default role → channel suffix table.
    pub fn default_roles(self) -> &'static [(&'static str, &'static str)] {
        match self {
            DeviceKind::Shutter => shutter::DEFAULT_ROLES,
            DeviceKind::Goniometer => goniometer::DEFAULT_ROLES,
            DeviceKind::Detector => detector::DEFAULT_ROLES,
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Device definition in configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceDefinition {
    /// Unique device identifier
    pub id: String,
    /// Device kind
    pub kind: DeviceKind,
    /// Channel name prefix
    pub root: String,
    /// Descriptive name (defaults to the id)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Whether this device is enabled
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Role → suffix overrides
    #[serde(default)]
    pub roles: BTreeMap<String, String>,
}

impl DeviceDefinition {
    /// Definition with default roles.
    pub fn new(id: impl Into<String>, kind: DeviceKind, root: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            root: root.into(),
            name: None,
            enabled: true,
            roles: BTreeMap::new(),
        }
    }

    /// Descriptive name, falling back to the id.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    /// Resolve the full channel name of every role.
    pub fn channels(&self) -> AppResult<ChannelMap> {
        let mut map = ChannelMap::defaults(self.kind, &self.root);
        for (role, suffix) in &self.roles {
            map.set(role, suffix)?;
        }
        Ok(map)
    }
}

/// Resolved channel names of one device, keyed by role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMap {
    kind: DeviceKind,
    root: String,
    names: BTreeMap<&'static str, String>,
}

impl ChannelMap {
    /// Channel names from the default role table of `kind`.
    pub fn defaults(kind: DeviceKind, root: &str) -> Self {
        let names = kind
            .default_roles()
            .iter()
            .map(|(role, suffix)| (*role, channel_name(root, suffix)))
            .collect();
        Self {
            kind,
            root: root.to_string(),
            names,
        }
    }

    /// Override the suffix of `role`.
    pub fn set(&mut self, role: &str, suffix: &str) -> AppResult<()> {
        let key = self
            .kind
            .default_roles()
            .iter()
            .map(|(r, _)| *r)
            .find(|r| *r == role)
            .ok_or_else(|| BeamlineError::UnknownRole {
                kind: self.kind.as_str(),
                role: role.to_string(),
            })?;
        self.names.insert(key, channel_name(&self.root, suffix));
        Ok(())
    }

    /// Full channel name of `role`.
    pub fn get(&self, role: &str) -> AppResult<&str> {
        self.names
            .get(role)
            .map(String::as_str)
            .ok_or_else(|| BeamlineError::UnknownRole {
                kind: self.kind.as_str(),
                role: role.to_string(),
            })
    }

    /// Device kind the map was built for.
    pub fn kind(&self) -> DeviceKind {
        self.kind
    }
}

/// Join a channel root and suffix.
pub fn channel_name(root: &str, suffix: &str) -> String {
    if suffix.starts_with('.') || suffix.starts_with(':') {
        format!("{root}{suffix}")
    } else {
        format!("{root}:{suffix}")
    }
}

// Default value functions
fn default_put_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_thread_name() -> String {
    "pv-dispatch".to_string()
}

fn default_enabled() -> bool {
    true
}

impl BeamlineConfig {
    /// Load configuration from `config/beamline.toml` and environment variables
    ///
    /// Environment variables override the file with prefix `BEAMLINE_`.
    /// Example: `BEAMLINE_APPLICATION__LOG_LEVEL=debug`
    pub fn load() -> AppResult<Self> {
        Self::load_from("config/beamline.toml")
    }

    /// Load configuration from a specific file path
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("BEAMLINE_").split("__"))
            .extract()?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(BeamlineError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.channel.put_timeout.is_zero() {
            return Err(BeamlineError::Configuration(
                "channel.put_timeout must be greater than zero".to_string(),
            ));
        }

        let mut ids = HashSet::new();
        for device in &self.devices {
            if !ids.insert(&device.id) {
                return Err(BeamlineError::Configuration(format!(
                    "Duplicate device ID: {}",
                    device.id
                )));
            }
            if device.root.trim().is_empty() {
                return Err(BeamlineError::Configuration(format!(
                    "Device '{}' has an empty channel root",
                    device.id
                )));
            }
            device.channels()?;
        }

        Ok(())
    }

    /// Get all enabled devices
    pub fn enabled_devices(&self) -> Vec<&DeviceDefinition> {
        self.devices.iter().filter(|d| d.enabled).collect()
    }

    /// Render the effective configuration, environment overrides included, as TOML.
    pub fn to_toml(&self) -> AppResult<String> {
        toml::to_string_pretty(self).map_err(|e| BeamlineError::Configuration(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
[application]
name = "08ID-1"
log_level = "debug"

[channel]
put_timeout = "750ms"

[[devices]]
id = "gonio"
kind = "goniometer"
root = "GV6K1608-001"

[devices.roles]
scan_cmd = "scanFrame2.PROC"

[[devices]]
id = "shutter"
kind = "shutter"
root = "PSH1408-I00-01"
name = "Photon Shutter"

[[devices]]
id = "ccd"
kind = "detector"
root = "CCD1608-301:cam1"
enabled = false
"#;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_from_file() {
        let file = write_config(SAMPLE);
        let config = BeamlineConfig::load_from(file.path()).unwrap();

        assert_eq!(config.application.name, "08ID-1");
        assert_eq!(config.channel.put_timeout, Duration::from_millis(750));
        assert_eq!(config.channel.connect_timeout, Duration::from_secs(2));
        assert_eq!(config.devices.len(), 3);
        assert_eq!(config.devices[1].display_name(), "Photon Shutter");
        assert_eq!(config.devices[0].display_name(), "gonio");
        assert_eq!(config.enabled_devices().len(), 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = BeamlineConfig::load_from("/nonexistent/beamline.toml").unwrap();
        assert_eq!(config.channel, ChannelConfig::default());
        assert!(config.devices.is_empty());
    }

    #[test]
    fn test_role_overrides_resolve() {
        let file = write_config(SAMPLE);
        let config = BeamlineConfig::load_from(file.path()).unwrap();
        let channels = config.devices[0].channels().unwrap();
        assert_eq!(channels.get("scan_cmd").unwrap(), "GV6K1608-001:scanFrame2.PROC");
        assert_eq!(channels.get("stop_cmd").unwrap(), "GV6K1608-001:stop");

        let shutter = config.devices[1].channels().unwrap();
        assert_eq!(shutter.get("state").unwrap(), "PSH1408-I00-01:state");
        assert!(matches!(
            shutter.get("scan_cmd"),
            Err(BeamlineError::UnknownRole { kind: "shutter", .. })
        ));
    }

    #[test]
    fn test_channel_name_joining() {
        assert_eq!(channel_name("ROOT", "state"), "ROOT:state");
        assert_eq!(channel_name("ROOT", ":state"), "ROOT:state");
        assert_eq!(channel_name("ROOT", ".PROC"), "ROOT.PROC");
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = BeamlineConfig::default();
        config.application.log_level = "loud".to_string();
        assert!(matches!(
            config.validate(),
            Err(BeamlineError::Configuration(_))
        ));
    }

    #[test]
    fn test_duplicate_device_ids() {
        let config = BeamlineConfig {
            devices: vec![
                DeviceDefinition::new("sh", DeviceKind::Shutter, "A"),
                DeviceDefinition::new("sh", DeviceKind::Shutter, "B"),
            ],
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Duplicate device ID: sh"));
    }

    #[test]
    fn test_unknown_role_override_rejected() {
        let mut device = DeviceDefinition::new("det", DeviceKind::Detector, "DET");
        device.roles.insert("warp_drive".into(), "engage".into());
        let config = BeamlineConfig {
            devices: vec![device],
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(BeamlineError::UnknownRole { kind: "detector", .. })
        ));
    }

    #[test]
    fn test_empty_root_rejected() {
        let config = BeamlineConfig {
            devices: vec![DeviceDefinition::new("sh", DeviceKind::Shutter, " ")],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_toml_is_a_config_error() {
        let file = write_config("[[devices]]\nid = 3\n");
        assert!(matches!(
            BeamlineConfig::load_from(file.path()),
            Err(BeamlineError::Config(_))
        ));
    }

    #[test]
    fn test_effective_config_renders_as_toml() {
        let file = write_config(SAMPLE);
        let config = BeamlineConfig::load_from(file.path()).unwrap();
        let rendered = config.to_toml().unwrap();
        assert!(rendered.contains("put_timeout = \"750ms\""));
        assert!(rendered.contains("scan_cmd = \"scanFrame2.PROC\""));

        let reloaded = BeamlineConfig::load_from(write_config(&rendered).path()).unwrap();
        assert_eq!(reloaded.channel, config.channel);
        assert_eq!(reloaded.devices.len(), 3);
    }

    #[test]
    fn test_environment_overrides_file() {
        let file = write_config(SAMPLE);
        std::env::set_var("BEAMLINE_DISPATCH__THREAD_NAME", "env-dispatch");
        let config = BeamlineConfig::load_from(file.path()).unwrap();
        std::env::remove_var("BEAMLINE_DISPATCH__THREAD_NAME");
        assert_eq!(config.dispatch.thread_name, "env-dispatch");
    }
}
