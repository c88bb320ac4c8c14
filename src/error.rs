//! Custom error types for the PV layer.
//!
//! This module defines the primary error type, `BeamlineError`, for the crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the small set of conditions that are allowed to raise.
//!
//! ## Error Hierarchy
//!
//! Hardware-layer failures never raise across the [`ProcessVariable`] boundary. A lost
//! connection, an unacknowledged write or an expired wait deadline are reported as
//! state (`connected == false`, [`PutStatus::Unacknowledged`], [`WaitOutcome::TimedOut`])
//! so GUI and scripting consumers can poll instead of handling errors.
//!
//! What remains in `BeamlineError` is:
//!
//! - **`InvalidState`** / **`InconsistentStates`**: programmer errors in state machine
//!   construction or forced transitions.
//! - **`UnknownDevice`** / **`UnknownRole`** / **`WrongDeviceKind`**: registry lookups
//!   that name something not configured.
//! - **`Config`** / **`Configuration`**: file parsing failures (from `figment`) and
//!   semantic validation failures.
//! - **`Io`** and **`Task`**: process-level failures surfaced by the binary and the
//!   async entry points.
//!
//! [`ProcessVariable`]: crate::pv::ProcessVariable
//! [`PutStatus::Unacknowledged`]: crate::pv::PutStatus::Unacknowledged
//! [`WaitOutcome::TimedOut`]: crate::device::WaitOutcome::TimedOut

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, BeamlineError>;

/// Errors reported by a [`ChannelBackend`](crate::channel::ChannelBackend).
///
/// These stay inside the channel layer; [`ProcessVariable`](crate::pv::ProcessVariable)
/// converts them into state flags and a log line.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("Channel '{0}' could not be resolved")]
    NotFound(String),

    #[error("Channel '{0}' is disconnected")]
    Disconnected(String),

    #[error("Channel '{name}' rejected the request: {reason}")]
    Rejected { name: String, reason: String },
}

#[derive(Error, Debug)]
pub enum BeamlineError {
    #[error("Invalid state '{state}' for state machine '{machine}'")]
    InvalidState { machine: String, state: String },

    #[error("Inconsistent state machine: {states} states but {values} trigger values")]
    InconsistentStates { states: usize, values: usize },

    #[error("Unknown device '{0}'")]
    UnknownDevice(String),

    #[error("Device '{id}' is a {actual}, not a {expected}")]
    WrongDeviceKind {
        id: String,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("Device kind '{kind}' has no role '{role}'")]
    UnknownRole { kind: &'static str, role: String },

    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Background task failed: {0}")]
    Task(String),
}

impl From<figment::Error> for BeamlineError {
    fn from(value: figment::Error) -> Self {
        BeamlineError::Config(Box::new(value))
    }
}

impl From<tokio::task::JoinError> for BeamlineError {
    fn from(value: tokio::task::JoinError) -> Self {
        BeamlineError::Task(value.to_string())
    }
}
