//! Hardware channel abstraction.
//!
//! The wire protocol that actually talks to an IOC is an external collaborator.
//! The PV layer only needs three things from it, captured by these traits:
//!
//! - a connection-state callback ([`ChannelListener::on_connection`])
//! - a value-change callback carrying timestamp and severity
//!   ([`ChannelListener::on_update`])
//! - an asynchronous put with an optional completion callback ([`Channel::put`])
//!
//! Listener callbacks are invoked on the backend's own threads. Implementations
//! must not call them while holding locks that a listener could need.

pub mod sim;

use crate::error::ChannelError;
use crate::value::{PvValue, Reading};
use std::sync::Arc;

pub use sim::SimBackend;

/// Completion callback for [`Channel::put`]. Receives `true` when the server
/// acknowledged the write.
pub type PutCallback = Box<dyn FnOnce(bool) + Send + 'static>;

/// Receiver of raw notifications for one channel.
pub trait ChannelListener: Send + Sync {
    /// Connection came up or went down.
    fn on_connection(&self, connected: bool);

    /// New monitor update.
    fn on_update(&self, reading: Reading);
}

/// One open channel.
pub trait Channel: Send + Sync {
    /// Channel name as resolved.
    fn name(&self) -> &str;

    /// Queue a write. `on_complete` fires when the server acknowledges it;
    /// it may never fire if the connection drops.
    fn put(&self, value: PvValue, on_complete: Option<PutCallback>) -> Result<(), ChannelError>;

    /// Synchronous read, used when monitoring is disabled.
    fn read(&self) -> Result<Reading, ChannelError>;

    /// Stop delivering notifications and release the channel.
    fn close(&self);
}

/// Factory for channels, shared by every PV created from one context.
pub trait ChannelBackend: Send + Sync {
    /// Resolve `name` and start delivering notifications to `listener`.
    ///
    /// When `monitor` is false only connection changes are delivered.
    fn create_channel(
        &self,
        name: &str,
        monitor: bool,
        listener: Arc<dyn ChannelListener>,
    ) -> Result<Box<dyn Channel>, ChannelError>;
}
