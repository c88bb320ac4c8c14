//! Timing behaviour of blocking device waits against the simulated IOC.

use beamline_pv::channel::SimBackend;
use beamline_pv::config::ChannelConfig;
use beamline_pv::device::{wait_for_activity, WaitOutcome};
use beamline_pv::dispatch::Dispatcher;
use beamline_pv::{ProcessVariable, PvContext};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn context(ioc: &SimBackend) -> PvContext {
    PvContext::new(
        Arc::new(ioc.clone()),
        Dispatcher::new("activity-test").unwrap(),
        ChannelConfig::default(),
    )
}

fn connected(ctx: &PvContext, name: &str) -> ProcessVariable {
    let pv = ctx.pv(name);
    assert!(pv.wait_for_connection(Duration::from_secs(1)));
    pv
}

#[test]
fn wait_returns_shortly_after_device_stops() {
    let ioc = SimBackend::new();
    ioc.add_record("DEV:state", 1);
    let ctx = context(&ioc);
    let state = connected(&ctx, "DEV:state");

    let started = Instant::now();
    ioc.post_after("DEV:state", 0, Duration::from_millis(50));
    let outcome = wait_for_activity(
        "DEV",
        || state.get_i64() == Some(1),
        true,
        true,
        Duration::from_millis(10),
        Duration::from_secs(1),
        None,
    );

    let elapsed = started.elapsed();
    assert_eq!(outcome, WaitOutcome::Reached);
    assert!(elapsed >= Duration::from_millis(50), "{:?}", elapsed);
    assert!(elapsed < Duration::from_millis(300), "{:?}", elapsed);
}

#[test]
fn wait_for_device_that_never_starts_is_bounded_by_timeout() {
    let ioc = SimBackend::new();
    ioc.add_record("DEV:state", 0);
    let ctx = context(&ioc);
    let state = connected(&ctx, "DEV:state");

    let started = Instant::now();
    let outcome = wait_for_activity(
        "DEV",
        || state.get_i64() == Some(1),
        true,
        true,
        Duration::from_millis(10),
        Duration::from_millis(200),
        None,
    );

    let elapsed = started.elapsed();
    assert_eq!(outcome, WaitOutcome::Reached);
    assert!(elapsed >= Duration::from_millis(190), "{:?}", elapsed);
    assert!(elapsed < Duration::from_millis(600), "{:?}", elapsed);
}

#[test]
fn wait_for_stuck_device_times_out() {
    let ioc = SimBackend::new();
    ioc.add_record("DEV:state", 1);
    let ctx = context(&ioc);
    let state = connected(&ctx, "DEV:state");

    let outcome = wait_for_activity(
        "DEV",
        || state.get_i64() == Some(1),
        false,
        true,
        Duration::from_millis(10),
        Duration::from_millis(100),
        None,
    );
    assert_eq!(outcome, WaitOutcome::TimedOut);
}

#[test]
fn abort_flag_ends_wait() {
    let ioc = SimBackend::new();
    ioc.add_record("DEV:state", 1);
    let ctx = context(&ioc);
    let state = connected(&ctx, "DEV:state");
    let abort = Arc::new(AtomicBool::new(false));

    let flag = abort.clone();
    let stopper = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(50));
        flag.store(true, std::sync::atomic::Ordering::SeqCst);
    });

    let started = Instant::now();
    let outcome = wait_for_activity(
        "DEV",
        || state.get_i64() == Some(1),
        false,
        true,
        Duration::from_millis(10),
        Duration::from_secs(5),
        Some(&abort),
    );
    stopper.join().unwrap();

    assert_eq!(outcome, WaitOutcome::Aborted);
    assert!(started.elapsed() < Duration::from_secs(1));
}
