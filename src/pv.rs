//! Process variables
//!
//! A [`ProcessVariable`] binds one [`ObservableValue`] to a named hardware
//! channel. It tracks the connection lifecycle, exposes alarm severity and
//! offers get/put with the following guarantees:
//!
//! - `get()` on a monitored PV never touches the network; it returns the cached
//!   value delivered by the monitor
//! - `put(value, false)` returns as soon as the write is queued
//! - `put(value, true)` blocks the calling thread until the server acknowledges
//!   the write or the context's put timeout elapses
//!
//! Nothing here raises on hardware failure. A name that does not resolve, a lost
//! connection or a write that is never acknowledged shows up as
//! `is_connected() == false` or [`PutStatus::Unacknowledged`], plus a warning in
//! the log. Callers poll those flags.
//!
//! # Example
//!
//! ```rust,ignore
//! let ctx = PvContext::new(Arc::new(ioc), dispatcher, ChannelConfig::default());
//! let shutter = ctx.pv("BL:shutter:state");
//! shutter.subscribe_changes(|value| println!("shutter now {value}"));
//!
//! let open_cmd = ctx.pv("BL:shutter:opr:open");
//! open_cmd.toggle(1, 0);  // confirmed write of 1, then 0
//! ```

use crate::channel::{Channel, ChannelListener};
use crate::context::PvContext;
use crate::dispatch::Dispatcher;
use crate::observable::{ObservableValue, PvEvent, Snapshot};
use crate::signal::SubscriptionId;
use crate::value::{PvValue, Reading, Severity};
use parking_lot::{Condvar, Mutex};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// Outcome of the most recent write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutStatus {
    /// No write issued yet
    Idle,
    /// Write queued, acknowledgement outstanding
    Pending,
    /// Server acknowledged the write
    Acknowledged,
    /// Write failed, timed out or lost its connection before acknowledgement
    Unacknowledged,
}

struct PutState {
    status: PutStatus,
    generation: u64,
}

struct PvShared {
    name: String,
    observable: ObservableValue,
    put: Mutex<PutState>,
    put_done: Condvar,
}

impl PvShared {
    fn finish_put(&self, generation: u64, acknowledged: bool) {
        let mut put = self.put.lock();
        if put.generation == generation && put.status == PutStatus::Pending {
            put.status = if acknowledged {
                PutStatus::Acknowledged
            } else {
                PutStatus::Unacknowledged
            };
            self.put_done.notify_all();
        }
    }
}

struct PvListener {
    shared: Weak<PvShared>,
}

impl ChannelListener for PvListener {
    fn on_connection(&self, connected: bool) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        shared.observable.set_connected(connected);
        if connected {
            tracing::debug!(pv = %shared.name, "Channel connected");
        } else {
            tracing::warn!(pv = %shared.name, "Channel connection lost");
            let mut put = shared.put.lock();
            if put.status == PutStatus::Pending {
                put.status = PutStatus::Unacknowledged;
                shared.put_done.notify_all();
            }
        }
    }

    fn on_update(&self, reading: Reading) {
        if let Some(shared) = self.shared.upgrade() {
            shared.observable.set_reading(reading);
        }
    }
}

/// A named, monitored hardware channel.
pub struct ProcessVariable {
    shared: Arc<PvShared>,
    channel: Mutex<Option<Box<dyn Channel>>>,
    monitor_enabled: bool,
    dispatcher: Dispatcher,
    put_timeout: Duration,
}

impl std::fmt::Debug for ProcessVariable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessVariable")
            .field("name", &self.shared.name)
            .field("monitor_enabled", &self.monitor_enabled)
            .field("state", &self.shared.observable.snapshot())
            .field("last_put", &self.last_put())
            .finish_non_exhaustive()
    }
}

impl ProcessVariable {
    /// Resolve `name` and start monitoring it.
    ///
    /// Never fails: an unresolvable name is logged and leaves the PV
    /// permanently disconnected.
    pub fn connect(ctx: &PvContext, name: impl Into<String>) -> Self {
        Self::open(ctx, name.into(), true)
    }

    /// Resolve `name` without a value monitor; `get()` then reads on demand.
    pub fn connect_unmonitored(ctx: &PvContext, name: impl Into<String>) -> Self {
        Self::open(ctx, name.into(), false)
    }

    fn open(ctx: &PvContext, name: String, monitor: bool) -> Self {
        let shared = Arc::new(PvShared {
            observable: ObservableValue::new(name.clone(), ctx.dispatcher().clone()),
            name,
            put: Mutex::new(PutState {
                status: PutStatus::Idle,
                generation: 0,
            }),
            put_done: Condvar::new(),
        });

        let listener = Arc::new(PvListener {
            shared: Arc::downgrade(&shared),
        });
        let channel = match ctx
            .backend()
            .create_channel(&shared.name, monitor, listener)
        {
            Ok(channel) => Some(channel),
            Err(e) => {
                tracing::warn!(pv = %shared.name, error = %e, "Could not connect process variable");
                None
            }
        };

        Self {
            shared,
            channel: Mutex::new(channel),
            monitor_enabled: monitor,
            dispatcher: ctx.dispatcher().clone(),
            put_timeout: ctx.put_timeout(),
        }
    }

    /// Channel name.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Whether value monitoring is enabled.
    pub fn is_monitored(&self) -> bool {
        self.monitor_enabled
    }

    /// The underlying value cell.
    pub fn observable(&self) -> &ObservableValue {
        &self.shared.observable
    }

    /// Consistent copy of value, timestamp, connection and severity.
    pub fn snapshot(&self) -> Snapshot {
        self.shared.observable.snapshot()
    }

    /// Whether the channel is connected.
    pub fn is_connected(&self) -> bool {
        self.shared.observable.is_connected()
    }

    /// Alarm severity of the last update.
    pub fn severity(&self) -> Severity {
        self.shared.observable.severity()
    }

    /// Status of the most recent write.
    pub fn last_put(&self) -> PutStatus {
        self.shared.put.lock().status
    }

    /// Current value.
    ///
    /// With `raw == false`, a channel that reports a display-formatted string
    /// (enum label, character array) returns that string; with `raw == true`
    /// the native value is returned. Unmonitored PVs read from the channel.
    pub fn get(&self, raw: bool) -> Option<PvValue> {
        if !self.monitor_enabled {
            self.refresh();
        }
        let snapshot = self.shared.observable.snapshot();
        match (raw, snapshot.display) {
            (false, Some(display)) => Some(PvValue::String(display)),
            _ => snapshot.value,
        }
    }

    /// Current value as a number.
    pub fn get_f64(&self) -> Option<f64> {
        self.get(true).and_then(|v| v.as_f64())
    }

    /// Current value as an integer.
    pub fn get_i64(&self) -> Option<i64> {
        self.get(true).and_then(|v| v.as_i64())
    }

    fn refresh(&self) {
        let result = match self.channel.lock().as_ref() {
            Some(channel) => channel.read(),
            None => return,
        };
        match result {
            Ok(reading) => self.shared.observable.set_reading(reading),
            Err(e) => {
                tracing::warn!(pv = %self.shared.name, error = %e, "Read failed");
                self.shared.observable.set_connected(false);
            }
        }
    }

    /// Write `value`.
    ///
    /// With `wait == false` this returns [`PutStatus::Pending`] once the write is
    /// queued. With `wait == true` it blocks until the write is acknowledged or
    /// the put timeout elapses. Waiting is refused on the dispatch thread, where
    /// it would stall every notification; such calls degrade to `wait == false`.
    pub fn put(&self, value: impl Into<PvValue>, wait: bool) -> PutStatus {
        let value = value.into();
        let wait = if wait && self.dispatcher.is_dispatch_thread() {
            tracing::warn!(pv = %self.shared.name, "Confirmed put requested on the dispatch thread; not waiting");
            false
        } else {
            wait
        };

        let generation = {
            let mut put = self.shared.put.lock();
            put.generation += 1;
            put.status = PutStatus::Pending;
            put.generation
        };

        let weak = Arc::downgrade(&self.shared);
        let on_complete = Box::new(move |acknowledged: bool| {
            if let Some(shared) = weak.upgrade() {
                shared.finish_put(generation, acknowledged);
            }
        });

        let sent = match self.channel.lock().as_ref() {
            Some(channel) => channel.put(value, Some(on_complete)),
            None => Err(crate::error::ChannelError::NotFound(self.shared.name.clone())),
        };
        if let Err(e) = sent {
            tracing::warn!(pv = %self.shared.name, error = %e, "Write failed");
            self.shared.finish_put(generation, false);
            return PutStatus::Unacknowledged;
        }

        if !wait {
            return self.last_put();
        }

        let deadline = Instant::now() + self.put_timeout;
        let mut put = self.shared.put.lock();
        while put.generation == generation && put.status == PutStatus::Pending {
            if self.shared.put_done.wait_until(&mut put, deadline).timed_out() {
                break;
            }
        }
        if put.generation == generation && put.status == PutStatus::Pending {
            put.status = PutStatus::Unacknowledged;
            tracing::warn!(
                pv = %self.shared.name,
                timeout_ms = self.put_timeout.as_millis() as u64,
                "Write was not acknowledged"
            );
        }
        put.status
    }

    /// Confirmed write of `first`, then an unconfirmed write of `second`.
    ///
    /// Used for command pulses such as `toggle(1, 0)`.
    pub fn toggle(&self, first: impl Into<PvValue>, second: impl Into<PvValue>) -> PutStatus {
        self.put(first, true);
        self.put(second, false)
    }

    /// Block (polling) until connected or `timeout` elapses.
    pub fn wait_for_connection(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while !self.is_connected() {
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        true
    }

    /// Subscribe to all events of the underlying cell.
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&PvEvent) + Send + Sync + 'static,
    {
        self.shared.observable.subscribe(callback)
    }

    /// Subscribe to value changes.
    pub fn subscribe_changes<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&PvValue) + Send + Sync + 'static,
    {
        self.shared.observable.subscribe_changes(callback)
    }

    /// Remove a subscription. Idempotent.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.shared.observable.unsubscribe(id);
    }
}

impl Drop for ProcessVariable {
    fn drop(&mut self) {
        self.shared.observable.clear_subscribers();
        if let Some(channel) = self.channel.get_mut().take() {
            channel.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::SimBackend;
    use crate::config::ChannelConfig;
    use std::thread;

    fn context(ioc: &SimBackend) -> PvContext {
        let settings = ChannelConfig {
            put_timeout: Duration::from_millis(200),
            connect_timeout: Duration::from_millis(500),
        };
        PvContext::new(
            Arc::new(ioc.clone()),
            Dispatcher::new("pv-test").unwrap(),
            settings,
        )
    }

    fn settle(pv: &ProcessVariable) {
        assert!(pv.wait_for_connection(Duration::from_secs(1)));
        thread::sleep(Duration::from_millis(20));
    }

    #[test]
    fn monitored_get_returns_cached_value() {
        let ioc = SimBackend::new();
        ioc.add_record("DEV:pos", 2.5);
        let ctx = context(&ioc);
        let pv = ctx.pv("DEV:pos");
        settle(&pv);
        assert_eq!(pv.get(true), Some(PvValue::Double(2.5)));

        ioc.post("DEV:pos", 3.0);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(pv.get_f64(), Some(3.0));
    }

    #[test]
    fn display_form_unless_raw() {
        let ioc = SimBackend::new();
        ioc.add_enum_record("DET:state", 1, &["Idle", "Acquire"]);
        let ctx = context(&ioc);
        let pv = ctx.pv("DET:state");
        settle(&pv);
        assert_eq!(pv.get(false), Some(PvValue::from("Acquire")));
        assert_eq!(pv.get(true), Some(PvValue::Int(1)));
    }

    #[test]
    #[tracing_test::traced_test]
    fn unresolved_name_is_not_fatal() {
        let ioc = SimBackend::new();
        let ctx = context(&ioc);
        let pv = ctx.pv("MISSING:pv");
        assert!(!pv.is_connected());
        assert_eq!(pv.get(false), None);
        assert_eq!(pv.put(1, true), PutStatus::Unacknowledged);
        assert!(logs_contain("Could not connect process variable"));
    }

    #[test]
    fn confirmed_put_waits_for_acknowledgement() {
        let ioc = SimBackend::new();
        ioc.add_record("DEV:cmd", 0);
        ioc.set_put_delay("DEV:cmd", Duration::from_millis(50));
        let ctx = context(&ioc);
        let pv = ctx.pv("DEV:cmd");
        settle(&pv);

        let start = Instant::now();
        assert_eq!(pv.put(5, true), PutStatus::Acknowledged);
        assert!(start.elapsed() >= Duration::from_millis(45));
        assert_eq!(ioc.value("DEV:cmd"), Some(PvValue::Int(5)));
    }

    #[test]
    fn unconfirmed_put_returns_immediately() {
        let ioc = SimBackend::new();
        ioc.add_record("DEV:cmd", 0);
        ioc.set_put_delay("DEV:cmd", Duration::from_millis(100));
        let ctx = context(&ioc);
        let pv = ctx.pv("DEV:cmd");
        settle(&pv);

        assert_eq!(pv.put(1, false), PutStatus::Pending);
        thread::sleep(Duration::from_millis(150));
        assert_eq!(pv.last_put(), PutStatus::Acknowledged);
    }

    #[test]
    fn missing_acknowledgement_times_out_without_raising() {
        let ioc = SimBackend::new();
        ioc.add_record("DEV:cmd", 0);
        ioc.set_acknowledge("DEV:cmd", false);
        let ctx = context(&ioc);
        let pv = ctx.pv("DEV:cmd");
        settle(&pv);

        let start = Instant::now();
        assert_eq!(pv.put(1, true), PutStatus::Unacknowledged);
        assert!(start.elapsed() >= Duration::from_millis(190));
        assert_eq!(pv.last_put(), PutStatus::Unacknowledged);
    }

    #[test]
    fn confirmed_put_from_callback_does_not_block_dispatch() {
        let ioc = SimBackend::new();
        ioc.add_record("DEV:trigger", 0);
        ioc.add_record("DEV:cmd", 0);
        ioc.set_acknowledge("DEV:cmd", false);
        let ctx = context(&ioc);
        let trigger = ctx.pv("DEV:trigger");
        let cmd = Arc::new(ctx.pv("DEV:cmd"));
        settle(&trigger);
        settle(&cmd);

        let results = Arc::new(Mutex::new(Vec::new()));
        let r = results.clone();
        let c = cmd.clone();
        trigger.subscribe_changes(move |value| {
            if value.as_i64() == Some(1) {
                let start = Instant::now();
                let status = c.put(1, true);
                r.lock().push((status, start.elapsed()));
            }
        });

        ioc.post("DEV:trigger", 1);
        let deadline = Instant::now() + Duration::from_secs(1);
        while results.lock().is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(ctx.dispatcher().flush(Duration::from_millis(100)));

        let results = results.lock();
        assert_eq!(results.len(), 1);
        let (status, elapsed) = results[0];
        assert_eq!(status, PutStatus::Pending);
        assert!(elapsed < Duration::from_millis(100));
        assert_eq!(ioc.writes("DEV:cmd"), vec![PvValue::Int(1)]);
    }

    #[test]
    fn connection_loss_marks_pending_put_unacknowledged() {
        let ioc = SimBackend::new();
        ioc.add_record("DEV:cmd", 0);
        ioc.set_put_delay("DEV:cmd", Duration::from_millis(150));
        let ctx = context(&ioc);
        let pv = ctx.pv("DEV:cmd");
        settle(&pv);

        assert_eq!(pv.put(1, false), PutStatus::Pending);
        ioc.set_connected("DEV:cmd", false);
        thread::sleep(Duration::from_millis(30));
        assert!(!pv.is_connected());
        assert_eq!(pv.last_put(), PutStatus::Unacknowledged);

        // A late acknowledgement does not resurrect the write.
        thread::sleep(Duration::from_millis(200));
        assert_eq!(pv.last_put(), PutStatus::Unacknowledged);
    }

    #[test]
    fn toggle_pulses_the_command() {
        let ioc = SimBackend::new();
        ioc.add_record("SH:opr:open", 0);
        let ctx = context(&ioc);
        let pv = ctx.pv("SH:opr:open");
        settle(&pv);

        pv.toggle(1, 0);
        assert_eq!(
            ioc.writes("SH:opr:open"),
            vec![PvValue::Int(1), PvValue::Int(0)]
        );
    }

    #[test]
    fn unmonitored_get_reads_on_demand() {
        let ioc = SimBackend::new();
        ioc.add_record("GON:expTime", 1.0);
        let ctx = context(&ioc);
        let pv = ctx.pv_unmonitored("GON:expTime");
        assert!(!pv.is_monitored());
        assert!(pv.wait_for_connection(Duration::from_secs(1)));

        ioc.post("GON:expTime", 0.5);
        assert_eq!(pv.get_f64(), Some(0.5));
    }

    #[test]
    fn drop_releases_channel_and_subscribers() {
        let ioc = SimBackend::new();
        ioc.add_record("DEV:x", 0);
        let ctx = context(&ioc);
        let pv = ctx.pv("DEV:x");
        pv.subscribe_changes(|_| {});
        assert_eq!(ioc.channel_count("DEV:x"), 1);
        drop(pv);
        assert_eq!(ioc.channel_count("DEV:x"), 0);
    }
}
