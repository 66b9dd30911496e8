//! Deadline-window timer monotonicity and coalescing, driven by the
//! real singleton poller thread.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tasklets::{Tasklet, TaskletMutex, Timer};

fn spin_until(flag: &AtomicBool, timeout: Duration) -> bool {
    let start = Instant::now();
    while !flag.load(Ordering::SeqCst) {
        if start.elapsed() > timeout {
            return false;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    true
}

/// Property #5 — a timer armed with `earliest = now + d` never reports
/// fired before `d` has elapsed, and always does so within a few backend
/// ticks of `latest`.
#[test]
fn timer_never_fires_before_earliest() {
    let _lock = common::poller_test_lock();

    let timer = Timer::init();
    let start = Instant::now();
    timer.set_relative(Duration::from_millis(30), Duration::from_millis(60));

    let fired = Arc::new(AtomicBool::new(false));
    let fired_at = Arc::new(std::sync::Mutex::new(None));

    let mutex = TaskletMutex::new(());
    let mut guard = mutex.lock();
    let tasklet = Tasklet::init(mutex.clone());
    {
        let fired = fired.clone();
        let fired_at = fired_at.clone();
        tasklet.goto(&mut guard, move |_, me| {
            if timer.wait(&me.handle()) {
                fired.store(true, Ordering::SeqCst);
                *fired_at.lock().unwrap() = Some(start.elapsed());
            }
        });
    }
    drop(guard);

    assert!(spin_until(&fired, Duration::from_millis(500)));
    let elapsed = fired_at.lock().unwrap().unwrap();
    assert!(elapsed >= Duration::from_millis(30), "fired too early: {elapsed:?}");
}

/// S3 — two timers with overlapping windows both fire in the same
/// dispatch pass, no earlier than the later of their `earliest` values
/// and no later than the smaller `latest` plus a couple of backend
/// ticks.
#[test]
fn overlapping_timers_coalesce_into_one_wakeup() {
    let _lock = common::poller_test_lock();

    let timer_a = Arc::new(Timer::init());
    let timer_b = Arc::new(Timer::init());

    let start = Instant::now();
    timer_a.set_relative(Duration::from_millis(80), Duration::from_millis(200));
    timer_b.set_relative(Duration::from_millis(120), Duration::from_millis(140));

    let fired_a = Arc::new(std::sync::Mutex::new(None));
    let fired_b = Arc::new(std::sync::Mutex::new(None));
    let done_a = Arc::new(AtomicBool::new(false));
    let done_b = Arc::new(AtomicBool::new(false));

    let mutex_a = TaskletMutex::new(());
    let mut guard_a = mutex_a.lock();
    let tasklet_a = Tasklet::init(mutex_a.clone());
    {
        let timer_a = timer_a.clone();
        let fired_a = fired_a.clone();
        let done_a = done_a.clone();
        tasklet_a.goto(&mut guard_a, move |_, me| {
            if timer_a.wait(&me.handle()) {
                *fired_a.lock().unwrap() = Some(start.elapsed());
                done_a.store(true, Ordering::SeqCst);
            }
        });
    }
    drop(guard_a);

    let mutex_b = TaskletMutex::new(());
    let mut guard_b = mutex_b.lock();
    let tasklet_b = Tasklet::init(mutex_b.clone());
    {
        let timer_b = timer_b.clone();
        let fired_b = fired_b.clone();
        let done_b = done_b.clone();
        tasklet_b.goto(&mut guard_b, move |_, me| {
            if timer_b.wait(&me.handle()) {
                *fired_b.lock().unwrap() = Some(start.elapsed());
                done_b.store(true, Ordering::SeqCst);
            }
        });
    }
    drop(guard_b);

    assert!(spin_until(&done_a, Duration::from_secs(1)));
    assert!(spin_until(&done_b, Duration::from_secs(1)));

    let at_a = fired_a.lock().unwrap().unwrap();
    let at_b = fired_b.lock().unwrap().unwrap();

    assert!(at_a >= Duration::from_millis(80));
    assert!(at_b >= Duration::from_millis(120));
    // Both windows close by 140ms; the poller must not have slept past
    // timer B's `latest` waiting for timer A's looser one.
    assert!(at_a <= Duration::from_millis(250), "timer A: {at_a:?}");
    assert!(at_b <= Duration::from_millis(250), "timer B: {at_b:?}");
}

#[test]
fn clear_deregisters_without_waking_waiters() {
    let _lock = common::poller_test_lock();

    let timer = Timer::init();
    timer.set_relative(Duration::from_secs(10), Duration::from_secs(10));
    timer.clear();

    let mutex = TaskletMutex::new(());
    let tasklet = Tasklet::init(mutex);
    assert!(!timer.wait(&tasklet.handle()), "a cleared timer must not report as already fired");
    timer.fini();
}
