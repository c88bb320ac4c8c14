//! Delivery guarantees of process-variable notifications.

use beamline_pv::channel::SimBackend;
use beamline_pv::config::ChannelConfig;
use beamline_pv::device::poll_until;
use beamline_pv::dispatch::Dispatcher;
use beamline_pv::observable::PvEvent;
use beamline_pv::{ProcessVariable, PvContext, PvValue};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

const POLL: Duration = Duration::from_millis(5);
const TIMEOUT: Duration = Duration::from_secs(2);

fn setup() -> (SimBackend, PvContext, ProcessVariable) {
    let ioc = SimBackend::new();
    ioc.add_record("BL:counter", 0);
    let ctx = PvContext::new(
        Arc::new(ioc.clone()),
        Dispatcher::new("order-test").unwrap(),
        ChannelConfig::default(),
    );
    let pv = ctx.pv("BL:counter");
    assert!(poll_until(POLL, TIMEOUT, || pv.get_i64() == Some(0)).is_reached());
    assert!(ctx.dispatcher().flush(TIMEOUT));
    (ioc, ctx, pv)
}

#[test]
fn changes_arrive_in_write_order_on_the_dispatch_thread() {
    let (ioc, ctx, pv) = setup();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let threads = Arc::new(Mutex::new(Vec::new()));
    let (s, t, d) = (seen.clone(), threads.clone(), ctx.dispatcher().clone());
    pv.subscribe_changes(move |value| {
        s.lock().push(value.as_i64().unwrap_or(-1));
        t.lock().push(d.is_dispatch_thread());
    });

    for i in 1..=100 {
        ioc.post("BL:counter", i);
    }
    assert!(poll_until(POLL, TIMEOUT, || seen.lock().len() == 100).is_reached());

    assert_eq!(*seen.lock(), (1..=100).collect::<Vec<i64>>());
    assert!(threads.lock().iter().all(|on_dispatch| *on_dispatch));
    assert_eq!(pv.get(true), Some(PvValue::Int(100)));
}

#[test]
fn repeated_values_still_notify() {
    let (ioc, _ctx, pv) = setup();

    let count = Arc::new(Mutex::new(0));
    let c = count.clone();
    pv.subscribe_changes(move |_| *c.lock() += 1);

    ioc.post("BL:counter", 5);
    ioc.post("BL:counter", 5);
    assert!(poll_until(POLL, TIMEOUT, || *count.lock() == 2).is_reached());
}

#[test]
fn no_callback_after_unsubscribe_returns() {
    let (ioc, ctx, pv) = setup();

    let hits = Arc::new(Mutex::new(0));
    let h = hits.clone();
    let id = pv.subscribe(move |event| {
        if matches!(event, PvEvent::Changed(_)) {
            *h.lock() += 1;
        }
    });

    // Hold the dispatch thread so the updates below are queued, not delivered.
    let gate = Arc::new(Mutex::new(()));
    let held = gate.lock();
    let g = gate.clone();
    ctx.dispatcher().post(move || {
        let _wait = g.lock();
    });

    ioc.post("BL:counter", 1);
    ioc.post("BL:counter", 2);
    assert!(poll_until(POLL, TIMEOUT, || pv.get_i64() == Some(2)).is_reached());
    pv.unsubscribe(id);
    pv.unsubscribe(id);
    drop(held);

    assert!(ctx.dispatcher().flush(TIMEOUT));
    assert_eq!(*hits.lock(), 0);
}

#[test]
fn connection_loss_is_reported_as_state() {
    let (ioc, _ctx, pv) = setup();

    let events = Arc::new(Mutex::new(Vec::new()));
    let e = events.clone();
    pv.subscribe(move |event| {
        if let PvEvent::Active(active) = event {
            e.lock().push(*active);
        }
    });

    ioc.set_connected("BL:counter", false);
    assert!(poll_until(POLL, TIMEOUT, || !pv.is_connected()).is_reached());
    ioc.set_connected("BL:counter", true);
    assert!(poll_until(POLL, TIMEOUT, || events.lock().len() == 2).is_reached());
    assert_eq!(*events.lock(), vec![false, true]);
    assert!(pv.is_connected());
}
