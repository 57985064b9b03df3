//! Scheduling core benchmarks.
//!
//! Measures the three hot paths: executor admission (submit through
//! completion), the park/wake handoff, and discrete-time step dispatch for
//! varying agent counts. Also sizes schedule expansion, which is pure
//! pending-index work with no threads involved.
//!
//! # Running
//!
//! ```bash
//! cargo bench --bench scheduler_bench
//!
//! # Individual groups
//! cargo bench --bench scheduler_bench -- executor
//! cargo bench --bench scheduler_bench -- discrete
//! cargo bench --bench scheduler_bench -- expansion
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use simsched::{
    Action, ActivityContext, AgentId, BlockingWatcher, DiscreteScheduler, Executor, ParkError,
    Scheduler,
};

const DRAIN_ITEMS: u64 = 256;
const HANDOFFS: u64 = 1_000;

/// Submit `DRAIN_ITEMS` trivial work items and run the pool to termination.
fn bench_submit_drain(c: &mut Criterion) {
    let mut group = c.benchmark_group("executor/submit_drain");
    group.throughput(Throughput::Elements(DRAIN_ITEMS));

    for slots in [1usize, 4, 16] {
        group.bench_with_input(BenchmarkId::from_parameter(slots), &slots, |b, &slots| {
            b.iter(|| {
                let pool = Executor::new(slots);
                let ran = Arc::new(AtomicU64::new(0));
                for _ in 0..DRAIN_ITEMS {
                    let ran = Arc::clone(&ran);
                    let _ = pool.submit(Arc::new(move |_: &ActivityContext| {
                        ran.fetch_add(1, Ordering::Relaxed);
                    }));
                }
                pool.shutdown();
                assert!(pool.await_termination(Duration::from_secs(30)));
                black_box(ran.load(Ordering::Relaxed))
            })
        });
    }
    group.finish();
}

/// One parked activity woken `HANDOFFS` times by the bench thread.
///
/// A second, always-active keeper occupies the pool so parking never
/// reaches quiescence; without it every park would come straight back as
/// a forced wake and the bench would measure the sweep, not the handoff.
fn bench_park_wake(c: &mut Criterion) {
    let mut group = c.benchmark_group("executor/park_wake");
    group.throughput(Throughput::Elements(HANDOFFS));

    group.bench_function("ping", |b| {
        b.iter(|| {
            let pool = Executor::new(2);
            let stop = Arc::new(AtomicBool::new(false));
            let keeper_stop = Arc::clone(&stop);
            let _ = pool.submit(Arc::new(move |_: &ActivityContext| {
                while !keeper_stop.load(Ordering::SeqCst) {
                    std::thread::sleep(Duration::from_micros(200));
                }
            }));

            let seen = Arc::new(AtomicU64::new(0));
            let counter = Arc::clone(&seen);
            let handle = pool
                .submit(Arc::new(move |ctx: &ActivityContext| loop {
                    match ctx.park() {
                        Ok(()) => {
                            counter.fetch_add(1, Ordering::SeqCst);
                        }
                        Err(ParkError::ForcedWake) | Err(ParkError::Terminated) => return,
                    }
                }))
                .unwrap_or_else(|_| panic!("fresh executor rejected work"));

            let mut delivered = 0u64;
            while delivered < HANDOFFS {
                if handle.wake() {
                    delivered += 1;
                }
            }
            stop.store(true, Ordering::SeqCst);
            pool.shutdown();
            assert!(pool.await_termination(Duration::from_secs(30)));
            black_box(seen.load(Ordering::SeqCst))
        })
    });
    group.finish();
}

/// A full discrete run: `agents` repeating schedules over a 64-step horizon.
fn bench_discrete_steps(c: &mut Criterion) {
    const HORIZON: u64 = 64;
    let mut group = c.benchmark_group("discrete/steps");
    group.sample_size(10);

    for agents in [1u64, 8, 32] {
        // Step 1 from time 0 activates at every step, horizon inclusive.
        group.throughput(Throughput::Elements((HORIZON + 1) * agents));
        group.bench_with_input(BenchmarkId::from_parameter(agents), &agents, |b, &agents| {
            b.iter(|| {
                let sched = DiscreteScheduler::new(HORIZON, 8);
                let done = Arc::new(BlockingWatcher::new());
                assert!(sched.add_watcher(Arc::clone(&done) as _));

                let ran = Arc::new(AtomicU64::new(0));
                for agent in 0..agents {
                    let ran = Arc::clone(&ran);
                    sched.schedule_infinitely(
                        Arc::new(Action::new(AgentId(agent), move |_: &ActivityContext| {
                            ran.fetch_add(1, Ordering::Relaxed);
                        })),
                        0,
                        1,
                    );
                }
                assert!(sched.start());
                assert!(done.wait_until_killed_timeout(Duration::from_secs(60)));
                black_box(ran.load(Ordering::Relaxed))
            })
        });
    }
    group.finish();
}

/// Pending-index insertion cost for a fully expanded infinite schedule.
fn bench_expansion(c: &mut Criterion) {
    let mut group = c.benchmark_group("discrete/expansion");

    for horizon in [1_000u64, 100_000] {
        group.throughput(Throughput::Elements(horizon + 1));
        group.bench_with_input(
            BenchmarkId::from_parameter(horizon),
            &horizon,
            |b, &horizon| {
                b.iter(|| {
                    let sched = DiscreteScheduler::new(horizon, 1);
                    sched.schedule_infinitely(Arc::new(|_: &ActivityContext| {}), 0, 1);
                    black_box(sched.pending_activations())
                })
            },
        );
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_submit_drain,
    bench_park_wake,
    bench_discrete_steps,
    bench_expansion,
);

criterion_main!(benches);
