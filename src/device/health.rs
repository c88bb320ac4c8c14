//! Device health bookkeeping.
//!
//! A device can have several independent problems at once ("two components
//! disconnected", "calibration lost"). Each is registered under a context string
//! with a [`Health`] severity; the reported health is the bitwise OR of every
//! registered severity plus the messages of each context.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

bitflags::bitflags! {
    /// Severity bit flags. Zero means healthy.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct Health: u32 {
        /// No impact on device functionality
        const MINOR = 1;
        /// No immediate impact; attention may soon be needed
        const MARGINAL = 1 << 1;
        /// Functionality impacted, recovery possible
        const SERIOUS = 1 << 2;
        /// Functionality broken, recovery not possible
        const CRITICAL = 1 << 3;
        /// Manually disabled
        const DISABLED = 1 << 4;
    }
}

impl Health {
    /// No problems
    pub const GOOD: Health = Health::empty();

    /// Whether no severity bit is set.
    pub const fn is_good(self) -> bool {
        self.is_empty()
    }
}

impl Default for Health {
    fn default() -> Self {
        Health::GOOD
    }
}

impl fmt::Display for Health {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_good() {
            return f.write_str("GOOD");
        }
        let names: Vec<_> = self.iter_names().map(|(name, _)| name).collect();
        f.write_str(&names.join("|"))
    }
}

/// Combined health as reported to subscribers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthReport {
    /// OR of all registered severities
    pub severity: Health,
    /// Space-separated messages of the registered contexts
    pub message: String,
}

/// Registry of active health problems keyed by context.
#[derive(Debug, Default)]
pub struct HealthManager {
    messages: BTreeMap<String, String>,
    states: BTreeSet<(Health, String)>,
}

impl HealthManager {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the message reported for `context` instead of the context name.
    pub fn register_message(&mut self, context: impl Into<String>, message: impl Into<String>) {
        self.messages.insert(context.into(), message.into());
    }

    /// Record a problem of `severity` under `context`.
    pub fn add(&mut self, severity: Health, context: &str, message: Option<&str>) {
        if let Some(message) = message {
            self.messages.insert(context.to_string(), message.to_string());
        }
        self.states.insert((severity, context.to_string()));
    }

    /// Clear every problem recorded under `context`.
    pub fn remove(&mut self, context: &str) {
        self.states.retain(|(_, c)| c != context);
    }

    /// Combined severity and message.
    pub fn health(&self) -> HealthReport {
        let mut severity = Health::GOOD;
        let mut messages = BTreeSet::new();
        for (sev, context) in &self.states {
            severity |= *sev;
            messages.insert(
                self.messages
                    .get(context)
                    .map(String::as_str)
                    .unwrap_or(context.as_str()),
            );
        }
        HealthReport {
            severity,
            message: messages.into_iter().collect::<Vec<_>>().join(" "),
        }
    }
}
