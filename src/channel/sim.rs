//! Simulated IOC
//!
//! An in-process [`ChannelBackend`] holding named records. It behaves like a
//! soft IOC as seen from a client:
//!
//! - every open channel gets its own delivery thread, so listener callbacks
//!   arrive on a thread the caller does not own
//! - writes update the record, notify monitors and then acknowledge
//!   (optionally after a delay, or never, to model lost completions)
//! - per-record put hooks let tests and the simulator binary script IOC logic,
//!   e.g. "writing `scanFrame.PROC` raises `scanFrame:status` for two seconds"
//!
//! # Example
//!
//! ```rust,ignore
//! let ioc = SimBackend::new();
//! ioc.add_record("BL:gonio:scanFrame:status", 0);
//! ioc.on_put("BL:gonio:scanFrame.PROC", |ioc, _| {
//!     ioc.post("BL:gonio:scanFrame:status", 1);
//!     ioc.post_after("BL:gonio:scanFrame:status", 0, Duration::from_millis(500));
//! });
//! ```

use super::{Channel, ChannelBackend, ChannelListener, PutCallback};
use crate::error::ChannelError;
use crate::value::{now_seconds, PvValue, Reading, Severity};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::sync::mpsc;

type PutHook = Arc<dyn Fn(&SimBackend, &PvValue) + Send + Sync + 'static>;

enum Delivery {
    Connection(bool),
    Update(Reading),
    PutDone(PutCallback, bool),
}

struct Monitor {
    id: u64,
    monitor: bool,
    tx: mpsc::UnboundedSender<Delivery>,
}

struct SimRecord {
    reading: Reading,
    labels: Vec<String>,
    connected: bool,
    acknowledge: bool,
    put_delay: Duration,
    writes: Vec<PvValue>,
    monitors: Vec<Monitor>,
}

impl SimRecord {
    fn new(value: PvValue, labels: Vec<String>) -> Self {
        let mut record = Self {
            reading: Reading::new(value.clone(), now_seconds()),
            labels,
            connected: true,
            acknowledge: true,
            put_delay: Duration::ZERO,
            writes: Vec::new(),
            monitors: Vec::new(),
        };
        record.reading.display = record.display_for(&value);
        record
    }

    fn display_for(&self, value: &PvValue) -> Option<String> {
        match value {
            PvValue::String(s) => Some(s.clone()),
            PvValue::Int(index) if !self.labels.is_empty() => usize::try_from(*index)
                .ok()
                .and_then(|i| self.labels.get(i).cloned()),
            _ => None,
        }
    }

    fn store(&mut self, value: PvValue, severity: Severity) -> Reading {
        let reading = Reading {
            display: self.display_for(&value),
            value,
            timestamp: now_seconds(),
            severity,
        };
        self.reading = reading.clone();
        for monitor in self.monitors.iter().filter(|m| m.monitor) {
            let _ = monitor.tx.send(Delivery::Update(reading.clone()));
        }
        reading
    }
}

#[derive(Default)]
struct SimInner {
    records: Mutex<HashMap<String, SimRecord>>,
    hooks: RwLock<HashMap<String, PutHook>>,
    next_id: AtomicU64,
}

/// In-process simulated IOC. Clones share the same records.
#[derive(Clone, Default)]
pub struct SimBackend {
    inner: Arc<SimInner>,
}

impl std::fmt::Debug for SimBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimBackend")
            .field("records", &self.inner.records.lock().len())
            .finish_non_exhaustive()
    }
}

impl SimBackend {
    /// Create an IOC with no records.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or replace) a connected record.
    pub fn add_record(&self, name: impl Into<String>, initial: impl Into<PvValue>) {
        self.insert(name.into(), SimRecord::new(initial.into(), Vec::new()));
    }

    /// Add an enum record whose integer values display as `labels`.
    pub fn add_enum_record(&self, name: impl Into<String>, index: i64, labels: &[&str]) {
        let labels = labels.iter().map(|l| (*l).to_string()).collect();
        self.insert(name.into(), SimRecord::new(PvValue::Int(index), labels));
    }

    fn insert(&self, name: String, record: SimRecord) {
        self.inner.records.lock().insert(name, record);
    }

    /// Whether a record exists.
    pub fn has_record(&self, name: &str) -> bool {
        self.inner.records.lock().contains_key(name)
    }

    /// Publish a new value from the IOC side, as a monitor update.
    pub fn post(&self, name: &str, value: impl Into<PvValue>) {
        self.post_with_severity(name, value, Severity::NoAlarm);
    }

    /// Publish a new value with an alarm severity.
    pub fn post_with_severity(&self, name: &str, value: impl Into<PvValue>, severity: Severity) {
        let mut records = self.inner.records.lock();
        match records.get_mut(name) {
            Some(record) => {
                record.store(value.into(), severity);
            }
            None => tracing::warn!(record = name, "Simulated IOC has no such record"),
        }
    }

    /// Publish a value after `delay`, from a helper thread.
    pub fn post_after(&self, name: &str, value: impl Into<PvValue>, delay: Duration) {
        let ioc = self.clone();
        let name = name.to_string();
        let value = value.into();
        thread::spawn(move || {
            thread::sleep(delay);
            ioc.post(&name, value);
        });
    }

    /// Bring a record's connection up or down.
    pub fn set_connected(&self, name: &str, connected: bool) {
        let mut records = self.inner.records.lock();
        if let Some(record) = records.get_mut(name) {
            if record.connected != connected {
                record.connected = connected;
                for monitor in &record.monitors {
                    let _ = monitor.tx.send(Delivery::Connection(connected));
                }
                if connected {
                    for monitor in record.monitors.iter().filter(|m| m.monitor) {
                        let _ = monitor.tx.send(Delivery::Update(record.reading.clone()));
                    }
                }
            }
        }
    }

    /// Whether writes to `name` are acknowledged.
    pub fn set_acknowledge(&self, name: &str, acknowledge: bool) {
        if let Some(record) = self.inner.records.lock().get_mut(name) {
            record.acknowledge = acknowledge;
        }
    }

    /// Delay between a write and its acknowledgement.
    pub fn set_put_delay(&self, name: &str, delay: Duration) {
        if let Some(record) = self.inner.records.lock().get_mut(name) {
            record.put_delay = delay;
        }
    }

    /// Run `hook` after every write to `name`, on the writing thread.
    pub fn on_put<F>(&self, name: &str, hook: F)
    where
        F: Fn(&SimBackend, &PvValue) + Send + Sync + 'static,
    {
        self.inner
            .hooks
            .write()
            .insert(name.to_string(), Arc::new(hook));
    }

    /// Current value of a record.
    pub fn value(&self, name: &str) -> Option<PvValue> {
        self.inner
            .records
            .lock()
            .get(name)
            .map(|r| r.reading.value.clone())
    }

    /// Every value written to `name` by clients, oldest first.
    pub fn writes(&self, name: &str) -> Vec<PvValue> {
        self.inner
            .records
            .lock()
            .get(name)
            .map(|r| r.writes.clone())
            .unwrap_or_default()
    }

    /// Number of open channels on `name`.
    pub fn channel_count(&self, name: &str) -> usize {
        self.inner
            .records
            .lock()
            .get(name)
            .map_or(0, |r| r.monitors.len())
    }

    fn release(&self, name: &str, id: u64) {
        if let Some(record) = self.inner.records.lock().get_mut(name) {
            record.monitors.retain(|m| m.id != id);
        }
    }
}

impl ChannelBackend for SimBackend {
    fn create_channel(
        &self,
        name: &str,
        monitor: bool,
        listener: Arc<dyn ChannelListener>,
    ) -> Result<Box<dyn Channel>, ChannelError> {
        if !self.has_record(name) {
            return Err(ChannelError::NotFound(name.to_string()));
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<Delivery>();
        thread::Builder::new()
            .name(format!("ch:{name}"))
            .spawn(move || {
                while let Some(delivery) = rx.blocking_recv() {
                    match delivery {
                        Delivery::Connection(up) => listener.on_connection(up),
                        Delivery::Update(reading) => listener.on_update(reading),
                        Delivery::PutDone(callback, ok) => callback(ok),
                    }
                }
            })
            .map_err(|e| ChannelError::Rejected {
                name: name.to_string(),
                reason: e.to_string(),
            })?;

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut records = self.inner.records.lock();
            let record = records
                .get_mut(name)
                .ok_or_else(|| ChannelError::NotFound(name.to_string()))?;
            let _ = tx.send(Delivery::Connection(record.connected));
            if monitor && record.connected {
                let _ = tx.send(Delivery::Update(record.reading.clone()));
            }
            record.monitors.push(Monitor {
                id,
                monitor,
                tx: tx.clone(),
            });
        }

        Ok(Box::new(SimChannel {
            name: name.to_string(),
            id,
            ioc: self.clone(),
            tx: Mutex::new(Some(tx)),
        }))
    }
}

struct SimChannel {
    name: String,
    id: u64,
    ioc: SimBackend,
    tx: Mutex<Option<mpsc::UnboundedSender<Delivery>>>,
}

impl Channel for SimChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn put(&self, value: PvValue, on_complete: Option<PutCallback>) -> Result<(), ChannelError> {
        let tx = self
            .tx
            .lock()
            .clone()
            .ok_or_else(|| ChannelError::Disconnected(self.name.clone()))?;
        {
            let mut records = self.ioc.inner.records.lock();
            let record = records
                .get_mut(&self.name)
                .ok_or_else(|| ChannelError::NotFound(self.name.clone()))?;
            if !record.connected {
                return Err(ChannelError::Disconnected(self.name.clone()));
            }
            record.writes.push(value.clone());
            let severity = record.reading.severity;
            record.store(value.clone(), severity);

            if let Some(callback) = on_complete {
                if record.acknowledge {
                    let delay = record.put_delay;
                    if delay.is_zero() {
                        let _ = tx.send(Delivery::PutDone(callback, true));
                    } else {
                        thread::spawn(move || {
                            thread::sleep(delay);
                            let _ = tx.send(Delivery::PutDone(callback, true));
                        });
                    }
                }
            }
        }

        let hook = self.ioc.inner.hooks.read().get(&self.name).cloned();
        if let Some(hook) = hook {
            hook(&self.ioc, &value);
        }
        Ok(())
    }

    fn read(&self) -> Result<Reading, ChannelError> {
        let records = self.ioc.inner.records.lock();
        match records.get(&self.name) {
            Some(record) if record.connected => Ok(record.reading.clone()),
            Some(_) => Err(ChannelError::Disconnected(self.name.clone())),
            None => Err(ChannelError::NotFound(self.name.clone())),
        }
    }

    fn close(&self) {
        if self.tx.lock().take().is_some() {
            self.ioc.release(&self.name, self.id);
        }
    }
}

impl Drop for SimChannel {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        log: Mutex<Vec<String>>,
    }

    impl ChannelListener for Recorder {
        fn on_connection(&self, connected: bool) {
            self.log.lock().push(format!("conn:{connected}"));
        }

        fn on_update(&self, reading: Reading) {
            let shown = reading.display.unwrap_or_else(|| reading.value.to_string());
            self.log.lock().push(format!("value:{shown}"));
        }
    }

    fn wait_for_log(recorder: &Recorder, len: usize) -> Vec<String> {
        for _ in 0..100 {
            if recorder.log.lock().len() >= len {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        recorder.log.lock().clone()
    }

    #[test]
    fn unknown_names_do_not_resolve() {
        let ioc = SimBackend::new();
        let result = ioc.create_channel("NOPE", true, Arc::new(Recorder::default()));
        assert!(matches!(result, Err(ChannelError::NotFound(_))));
    }

    #[test]
    fn monitor_sees_initial_value_and_posts() {
        let ioc = SimBackend::new();
        ioc.add_enum_record("DET:state", 0, &["Idle", "Acquire"]);
        let recorder = Arc::new(Recorder::default());
        let _channel = ioc.create_channel("DET:state", true, recorder.clone()).unwrap();
        ioc.post("DET:state", 1);

        assert_eq!(
            wait_for_log(&recorder, 3),
            vec!["conn:true", "value:Idle", "value:Acquire"]
        );
    }

    #[test]
    fn writes_are_recorded_and_hooked() {
        let ioc = SimBackend::new();
        ioc.add_record("CMD", 0);
        ioc.add_record("FBK", 0);
        ioc.on_put("CMD", |ioc, value| ioc.post("FBK", value.clone()));

        let channel = ioc
            .create_channel("CMD", false, Arc::new(Recorder::default()))
            .unwrap();
        channel.put(PvValue::Int(1), None).unwrap();
        channel.put(PvValue::Int(0), None).unwrap();

        assert_eq!(ioc.writes("CMD"), vec![PvValue::Int(1), PvValue::Int(0)]);
        assert_eq!(ioc.value("FBK"), Some(PvValue::Int(0)));
    }

    #[test]
    fn disconnected_records_refuse_io() {
        let ioc = SimBackend::new();
        ioc.add_record("X", 1.5);
        let channel = ioc
            .create_channel("X", true, Arc::new(Recorder::default()))
            .unwrap();
        ioc.set_connected("X", false);
        assert!(matches!(channel.read(), Err(ChannelError::Disconnected(_))));
        assert!(channel.put(PvValue::Double(2.0), None).is_err());
    }

    #[test]
    fn close_releases_the_channel() {
        let ioc = SimBackend::new();
        ioc.add_record("X", 1);
        let channel = ioc
            .create_channel("X", true, Arc::new(Recorder::default()))
            .unwrap();
        assert_eq!(ioc.channel_count("X"), 1);
        channel.close();
        channel.close();
        assert_eq!(ioc.channel_count("X"), 0);
        drop(channel);
        assert_eq!(ioc.channel_count("X"), 0);
    }
}
