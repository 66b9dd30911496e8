//! FIFO draining, idempotent enqueue, and cross-thread wake-up.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tasklets::{RunQueue, Tasklet, TaskletMutex};

#[test]
fn run_drains_fifo_even_when_a_step_reenqueues() {
    let queue = RunQueue::create();
    RunQueue::target(Some(queue.clone()));

    let order = Arc::new(Mutex::new(Vec::new()));
    let mutexes: Vec<_> = (0..3).map(|_| TaskletMutex::new(())).collect();
    let mut tasklets = Vec::new();

    for (i, mutex) in mutexes.iter().enumerate() {
        let mut guard = mutex.lock();
        let tasklet = Tasklet::init(mutex.clone());
        let order = order.clone();
        if i == 0 {
            // Tasklet 0 re-enqueues itself once from within its own
            // step; that second run must appear at the tail of the
            // drain, after tasklets 1 and 2 (already queued ahead of
            // the re-enqueue), not immediately after the first run.
            tasklet.later(move |_, me| {
                order.lock().unwrap().push(0);
                me.later(|_, _| {
                    order.lock().unwrap().push(100);
                });
            });
        } else {
            tasklet.later(move |_, _| {
                order.lock().unwrap().push(i);
            });
        }
        drop(guard);
        tasklets.push(tasklet);
    }

    queue.run(false);
    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 100]);
}

#[test]
fn enqueue_is_idempotent_for_an_already_queued_tasklet() {
    let queue = RunQueue::create();
    RunQueue::target(Some(queue.clone()));

    let mutex = TaskletMutex::new(());
    let mut guard = mutex.lock();
    let tasklet = Tasklet::init(mutex.clone());
    let runs = Arc::new(AtomicUsize::new(0));
    {
        let runs = runs.clone();
        tasklet.later(move |_, _| {
            runs.fetch_add(1, Ordering::SeqCst);
        });
    }
    drop(guard);

    assert_eq!(queue.len(), 1);
    queue.enqueue_current(tasklet.handle());
    queue.enqueue_current(tasklet.handle());
    assert_eq!(queue.len(), 1, "re-enqueueing a queued tasklet must not duplicate it");

    queue.run(false);
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

/// S2 — a tasklet parked on thread A is released by `tasklet_later` from
/// thread B, targeting A's queue; A's blocking `run` returns only once
/// that step has actually executed.
#[test]
fn cross_thread_wake_unblocks_run_queue_run() {
    let queue = RunQueue::create();
    let done = Arc::new(std::sync::atomic::AtomicBool::new(false));

    let mutex = TaskletMutex::new(());
    let tasklet = {
        let mut guard = mutex.lock();
        let tasklet = Tasklet::init(mutex.clone());
        tasklet.goto(&mut guard, |_, _| {});
        tasklet.stop(); // idle, not yet runnable — thread B will schedule it
        tasklet
    };

    let queue_for_b = queue.clone();
    let done_for_b = done.clone();
    let tasklet_for_b = tasklet.clone();
    let handle = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(1));
        RunQueue::target(Some(queue_for_b));
        tasklet_for_b.later(move |_, _| {
            done_for_b.store(true, Ordering::SeqCst);
        });
    });

    RunQueue::target(Some(queue.clone()));
    queue.run(true);
    handle.join().unwrap();

    assert!(done.load(Ordering::SeqCst));
}
