//! Per-connection PV context.
//!
//! Everything a process variable needs from its surroundings is carried by an
//! explicit [`PvContext`] handed to constructors: the channel backend, the
//! dispatch context that delivers notifications, and protocol timeouts. There is
//! no process-wide channel cache or global client lock.

use crate::channel::ChannelBackend;
use crate::config::{BeamlineConfig, ChannelConfig};
use crate::dispatch::Dispatcher;
use crate::pv::ProcessVariable;
use std::sync::Arc;
use std::time::Duration;

/// Shared handle used to create process variables. Cheap to clone.
#[derive(Clone)]
pub struct PvContext {
    backend: Arc<dyn ChannelBackend>,
    dispatcher: Dispatcher,
    settings: ChannelConfig,
}

impl std::fmt::Debug for PvContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PvContext")
            .field("dispatcher", &self.dispatcher)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl PvContext {
    /// Build a context from its parts.
    pub fn new(
        backend: Arc<dyn ChannelBackend>,
        dispatcher: Dispatcher,
        settings: ChannelConfig,
    ) -> Self {
        Self {
            backend,
            dispatcher,
            settings,
        }
    }

    /// Build a context from configuration, spawning the dispatch thread.
    pub fn from_config(
        backend: Arc<dyn ChannelBackend>,
        config: &BeamlineConfig,
    ) -> std::io::Result<Self> {
        let dispatcher = Dispatcher::new(config.dispatch.thread_name.clone())?;
        Ok(Self::new(backend, dispatcher, config.channel.clone()))
    }

    /// Create a monitored process variable.
    pub fn pv(&self, name: impl Into<String>) -> ProcessVariable {
        ProcessVariable::connect(self, name)
    }

    /// Create a process variable without a value monitor.
    pub fn pv_unmonitored(&self, name: impl Into<String>) -> ProcessVariable {
        ProcessVariable::connect_unmonitored(self, name)
    }

    /// The channel backend.
    pub fn backend(&self) -> &Arc<dyn ChannelBackend> {
        &self.backend
    }

    /// The dispatch context.
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// How long `put(.., wait = true)` waits for an acknowledgement.
    pub fn put_timeout(&self) -> Duration {
        self.settings.put_timeout
    }

    /// How long callers should wait for channels to connect.
    pub fn connect_timeout(&self) -> Duration {
        self.settings.connect_timeout
    }
}
