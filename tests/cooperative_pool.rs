//! Executor scenarios built on park/wake collaboration between activities:
//! a producer feeding a parked consumer, and a wake ring passing a token
//! between activities until a limit is hit.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use simsched::{ActivityContext, ActivityHandle, Executor, ParkError};

const WAIT: Duration = Duration::from_secs(10);

#[test]
fn parked_consumer_drains_a_producer_in_order() {
    let pool = Arc::new(Executor::new(2));
    let queue: Arc<Mutex<VecDeque<u32>>> = Arc::new(Mutex::new(VecDeque::new()));
    let done = Arc::new(AtomicBool::new(false));
    let seen: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));

    let (q, d, s) = (Arc::clone(&queue), Arc::clone(&done), Arc::clone(&seen));
    let handle = pool
        .submit(Arc::new(move |ctx: &ActivityContext| loop {
            if let Some(item) = q.lock().unwrap().pop_front() {
                s.lock().unwrap().push(item);
                continue;
            }
            if d.load(Ordering::SeqCst) {
                return;
            }
            match ctx.park() {
                // Woken or force-woken: re-check the queue either way.
                Ok(()) | Err(ParkError::ForcedWake) => {}
                Err(ParkError::Terminated) => return,
            }
        }))
        .unwrap_or_else(|_| panic!("fresh executor rejected work"));

    for item in 0..200u32 {
        queue.lock().unwrap().push_back(item);
        // False means the consumer is busy draining and will see the item.
        let _ = handle.wake();
        if item % 50 == 0 {
            thread::sleep(Duration::from_millis(1));
        }
    }
    done.store(true, Ordering::SeqCst);
    let _ = handle.wake();

    pool.shutdown();
    assert!(pool.await_termination(WAIT));

    let seen = seen.lock().unwrap();
    assert_eq!(*seen, (0..200).collect::<Vec<_>>());
    let stats = pool.stats();
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.panicked, 0);
    assert_eq!(stats.park_rejections, 0);
}

#[test]
fn wake_ring_passes_a_token_to_a_limit() {
    const RING: usize = 3;
    const LIMIT: usize = 30;

    let pool = Arc::new(Executor::new(RING));
    let token = Arc::new(AtomicUsize::new(0));
    let handles: Arc<Mutex<Vec<Option<ActivityHandle>>>> =
        Arc::new(Mutex::new(vec![None; RING]));

    let mut collected = Vec::with_capacity(RING);
    for me in 0..RING {
        let token = Arc::clone(&token);
        let handles = Arc::clone(&handles);
        let handle = pool
            .submit(Arc::new(move |ctx: &ActivityContext| loop {
                match ctx.park() {
                    Ok(()) => {
                        let passes = token.fetch_add(1, Ordering::SeqCst) + 1;
                        if passes >= LIMIT {
                            return;
                        }
                        let next = handles.lock().unwrap()[(me + 1) % RING]
                            .clone()
                            .unwrap_or_else(|| panic!("ring kicked before handles were shared"));
                        // The neighbor may not have parked yet; retry until
                        // the pass lands so no token is ever dropped.
                        while !next.wake() {
                            thread::yield_now();
                        }
                    }
                    Err(ParkError::ForcedWake) => {
                        if token.load(Ordering::SeqCst) >= LIMIT {
                            return;
                        }
                    }
                    Err(ParkError::Terminated) => return,
                }
            }))
            .unwrap_or_else(|_| panic!("fresh executor rejected work"));
        collected.push(handle);
    }
    *handles.lock().unwrap() = collected.iter().cloned().map(Some).collect();

    // Kick the ring once activity 0 has parked.
    while !collected[0].wake() {
        thread::yield_now();
    }

    pool.shutdown();
    assert!(pool.await_termination(WAIT));
    // Termination latches while force-woken stragglers are still wrapping
    // up; quiescence waits for their exit so the counters are final.
    assert!(pool.await_quiescence());

    assert_eq!(token.load(Ordering::SeqCst), LIMIT);
    let stats = pool.stats();
    assert_eq!(stats.completed, RING as u64);
    assert_eq!(stats.wakes, LIMIT as u64);
    assert!(stats.forced_wakes >= 2, "ring stragglers exit by forced wake");
}

#[test]
fn counters_reconcile_after_a_full_run() {
    let pool = Executor::new(1);
    let ran = Arc::new(AtomicUsize::new(0));
    for _ in 0..5 {
        let ran = Arc::clone(&ran);
        pool.submit(Arc::new(move |_: &ActivityContext| {
            ran.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap_or_else(|_| panic!("fresh executor rejected work"));
    }
    pool.shutdown();
    assert!(pool.await_termination(WAIT));

    assert_eq!(ran.load(Ordering::SeqCst), 5);
    let stats = pool.stats();
    assert_eq!(stats.submitted, 5);
    assert_eq!(stats.completed, 5);
    assert_eq!(stats.rejected, 0);
    assert_eq!(stats.queued, 0);
    assert_eq!(stats.active, 0);
    assert_eq!(stats.parked, 0);

    assert!(pool.submit(Arc::new(|_: &ActivityContext| {})).is_err());
    assert_eq!(pool.stats().rejected, 1);
}
