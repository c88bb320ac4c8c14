//! # Beamline PV Library
//!
//! Process-variable and device state-machine layer for beamline control. Every
//! callback a device or process variable produces is delivered on one dispatch
//! thread, in the order values were written, so GUI and scripting consumers see
//! a consistent view of the hardware.
//!
//! ## Crate Structure
//!
//! - **`dispatch`**: the single worker thread all callbacks run on.
//! - **`signal`**: subscriber lists delivering events through the dispatcher.
//! - **`observable`**: a thread-safe value that notifies on every write.
//! - **`value`**: the dynamically typed `PvValue` carried by channels.
//! - **`channel`**: the `ChannelBackend` seam plus the in-process `SimBackend` IOC.
//! - **`context`**: `PvContext`, the backend, dispatcher and timeouts devices share.
//! - **`pv`**: `ProcessVariable`, a cached, monitored named channel with confirmed writes.
//! - **`state`**: `StateMachine`, a cyclic state sequence advanced by trigger values.
//! - **`device`**: device housekeeping, health, wait helpers and the shutter,
//!   goniometer and detector drivers.
//! - **`beamline`**: a registry building devices from configuration, with `async`
//!   entry points.
//! - **`config`**: `BeamlineConfig`, loaded with figment from TOML and environment.
//! - **`logging`**: tracing subscriber setup.
//! - **`error`**: the `BeamlineError` enum.

pub mod beamline;
pub mod channel;
pub mod config;
pub mod context;
pub mod device;
pub mod dispatch;
pub mod error;
pub mod logging;
pub mod observable;
pub mod pv;
pub mod signal;
pub mod state;
pub mod value;

pub use context::PvContext;
pub use error::{AppResult, BeamlineError};
pub use pv::{ProcessVariable, PutStatus};
pub use value::PvValue;
