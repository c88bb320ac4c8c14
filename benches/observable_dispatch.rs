//! Criterion benchmarks for the notification path.
//!
//! Every process-variable update takes the observable's write lock, queues one
//! job on the dispatch thread and fans out to subscribers there. These benches
//! track the cost of that path.
//!
//! Key metrics:
//! - Update throughput with varying subscriber counts
//! - End-to-end latency from write to callback
//! - State machine sample processing
//!
//! Run with: cargo bench --bench observable_dispatch

use beamline_pv::dispatch::Dispatcher;
use beamline_pv::observable::ObservableValue;
use beamline_pv::state::StateMachine;
use beamline_pv::value::{PvValue, Severity};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Batches of updates, flushed once per batch, for 0 to 16 subscribers.
fn observable_update_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("observable_update");
    const BATCH: u64 = 1_000;

    for subscribers in [0usize, 1, 4, 16] {
        let dispatcher = Dispatcher::new("bench-dispatch").unwrap();
        let observable = ObservableValue::new("BENCH:value", dispatcher.clone());
        let hits = Arc::new(AtomicU64::new(0));
        for _ in 0..subscribers {
            let h = hits.clone();
            observable.subscribe_changes(move |_| {
                h.fetch_add(1, Ordering::Relaxed);
            });
        }

        group.throughput(Throughput::Elements(BATCH));
        group.bench_with_input(
            BenchmarkId::new("subscribers", subscribers),
            &subscribers,
            |b, _| {
                b.iter(|| {
                    for i in 0..BATCH {
                        observable.set(
                            PvValue::Int(black_box(i as i64)),
                            0.0,
                            true,
                            Severity::NoAlarm,
                        );
                    }
                    dispatcher.flush(Duration::from_secs(10));
                });
            },
        );
    }

    group.finish();
}

/// One update, waiting for its callback to run.
fn observable_round_trip(c: &mut Criterion) {
    let dispatcher = Dispatcher::new("bench-dispatch").unwrap();
    let observable = ObservableValue::new("BENCH:latency", dispatcher.clone());
    observable.subscribe_changes(|value| {
        black_box(value);
    });

    c.bench_function("observable_round_trip", |b| {
        let mut i = 0i64;
        b.iter(|| {
            i += 1;
            observable.set(PvValue::Int(i), 0.0, true, Severity::NoAlarm);
            dispatcher.flush(Duration::from_secs(1));
        });
    });
}

/// Cycling a three-state machine through its triggers.
fn state_machine_update(c: &mut Criterion) {
    let machine = StateMachine::new("bench", vec!['A', 'B', 'C'], vec![0, 1, 2], 'A').unwrap();

    c.bench_function("state_machine_cycle", |b| {
        b.iter(|| {
            for value in [1, 2, 0] {
                black_box(machine.update(&value));
            }
        });
    });
}

criterion_group!(
    benches,
    observable_update_throughput,
    observable_round_trip,
    state_machine_update
);
criterion_main!(benches);
