//! Process-variable value types.
//!
//! Channels carry scalars, strings and numeric arrays. [`PvValue`] is the
//! polymorphic value held by an [`ObservableValue`](crate::observable::ObservableValue);
//! [`Reading`] is one raw sample as delivered by a channel monitor.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A process-variable value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PvValue {
    /// Integer, enum index or boolean-like record value
    Int(i64),
    /// Floating point record value
    Double(f64),
    /// String or character-array value
    String(String),
    /// Numeric waveform
    Array(Vec<f64>),
}

impl PvValue {
    /// Numeric view of the value. Strings are parsed; arrays yield their first element.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            PvValue::Int(v) => Some(*v as f64),
            PvValue::Double(v) => Some(*v),
            PvValue::String(s) => s.trim().parse().ok(),
            PvValue::Array(values) => values.first().copied(),
        }
    }

    /// Integer view of the value. Doubles are truncated.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            PvValue::Int(v) => Some(*v),
            PvValue::Double(v) if v.is_finite() => Some(*v as i64),
            PvValue::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Record-style truthiness: any non-zero number is `true`.
    pub fn as_bool(&self) -> Option<bool> {
        self.as_f64().map(|v| v != 0.0)
    }

    /// String view, if the value is textual.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            PvValue::String(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for PvValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PvValue::Int(v) => write!(f, "{v}"),
            PvValue::Double(v) => write!(f, "{v}"),
            PvValue::String(s) => f.write_str(s),
            PvValue::Array(values) => write!(f, "{values:?}"),
        }
    }
}

impl From<i64> for PvValue {
    fn from(value: i64) -> Self {
        PvValue::Int(value)
    }
}

impl From<i32> for PvValue {
    fn from(value: i32) -> Self {
        PvValue::Int(i64::from(value))
    }
}

impl From<bool> for PvValue {
    fn from(value: bool) -> Self {
        PvValue::Int(i64::from(value))
    }
}

impl From<f64> for PvValue {
    fn from(value: f64) -> Self {
        PvValue::Double(value)
    }
}

impl From<&str> for PvValue {
    fn from(value: &str) -> Self {
        PvValue::String(value.to_string())
    }
}

impl From<String> for PvValue {
    fn from(value: String) -> Self {
        PvValue::String(value)
    }
}

impl From<Vec<f64>> for PvValue {
    fn from(value: Vec<f64>) -> Self {
        PvValue::Array(value)
    }
}

/// Alarm severity reported with each channel update.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Severity {
    /// No alarm
    #[default]
    NoAlarm,
    /// Minor alarm
    Minor,
    /// Major alarm
    Major,
    /// Value is invalid (e.g. communication failure upstream)
    Invalid,
}

impl From<u16> for Severity {
    fn from(value: u16) -> Self {
        match value {
            0 => Severity::NoAlarm,
            1 => Severity::Minor,
            2 => Severity::Major,
            _ => Severity::Invalid,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Severity::NoAlarm => "",
            Severity::Minor => "MINOR",
            Severity::Major => "MAJOR",
            Severity::Invalid => "INVALID",
        };
        f.write_str(label)
    }
}

/// One monitor update as delivered by a channel.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    /// Native value
    pub value: PvValue,
    /// Display-formatted representation (enum labels, char-array strings)
    pub display: Option<String>,
    /// Source timestamp in seconds
    pub timestamp: f64,
    /// Alarm severity
    pub severity: Severity,
}

impl Reading {
    /// A reading with no display form and no alarm.
    pub fn new(value: impl Into<PvValue>, timestamp: f64) -> Self {
        Self {
            value: value.into(),
            display: None,
            timestamp,
            severity: Severity::NoAlarm,
        }
    }

    /// Attach a display-formatted representation.
    pub fn with_display(mut self, display: impl Into<String>) -> Self {
        self.display = Some(display.into());
        self
    }

    /// Attach an alarm severity.
    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }
}

/// Current wall-clock time in seconds, used to stamp simulated and local updates.
///
/// Update timestamps are source (server) stamps in seconds since the Unix
/// epoch, as an IOC sets them. They are not a local monotonic reading and may
/// step when the host clock is adjusted.
pub fn now_seconds() -> f64 {
    let now = chrono::Utc::now();
    now.timestamp() as f64 + f64::from(now.timestamp_subsec_nanos()) * 1e-9
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_are_epoch_seconds() {
        let stamp = now_seconds();
        let expected = chrono::Utc::now().timestamp() as f64;
        assert!(stamp > 1.6e9);
        assert!((stamp - expected).abs() < 5.0);
    }

    #[test]
    fn numeric_views() {
        assert_eq!(PvValue::Int(3).as_f64(), Some(3.0));
        assert_eq!(PvValue::Double(2.9).as_i64(), Some(2));
        assert_eq!(PvValue::from(" 7 ").as_i64(), Some(7));
        assert_eq!(PvValue::Array(vec![1.5, 2.0]).as_f64(), Some(1.5));
        assert_eq!(PvValue::Array(vec![]).as_f64(), None);
        assert_eq!(PvValue::Double(f64::NAN).as_i64(), None);
    }

    #[test]
    fn truthiness_follows_record_convention() {
        assert_eq!(PvValue::Int(0).as_bool(), Some(false));
        assert_eq!(PvValue::Int(2).as_bool(), Some(true));
        assert_eq!(PvValue::from(true), PvValue::Int(1));
        assert_eq!(PvValue::from("Open").as_bool(), None);
    }

    #[test]
    fn severity_from_raw_code() {
        assert_eq!(Severity::from(0), Severity::NoAlarm);
        assert_eq!(Severity::from(2), Severity::Major);
        assert_eq!(Severity::from(17), Severity::Invalid);
        assert!(Severity::Major > Severity::Minor);
    }

    #[test]
    fn untagged_serialization() {
        assert_eq!(serde_json::to_string(&PvValue::Int(4)).unwrap(), "4");
        assert_eq!(
            serde_json::from_str::<PvValue>("\"Idle\"").unwrap(),
            PvValue::from("Idle")
        );
    }

    #[test]
    fn reading_builder() {
        let reading = Reading::new(1, 10.0)
            .with_display("Acquire")
            .with_severity(Severity::Minor);
        assert_eq!(reading.display.as_deref(), Some("Acquire"));
        assert_eq!(reading.severity, Severity::Minor);
    }
}
