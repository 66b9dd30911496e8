//! Counted-semaphore and broadcast behavior of [`tasklets::WaitList`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tasklets::{RunQueue, Tasklet, TaskletMutex, WaitList};

/// A tasklet whose step drains as much count as is available in one go.
fn spawn_drainer(queue: &RunQueue, wait_list: &Arc<WaitList>, got: &Arc<AtomicU64>) -> Tasklet<()> {
    let mutex = TaskletMutex::new(());
    let mut guard = mutex.lock();
    let tasklet = Tasklet::init(mutex.clone());
    let wait_list = wait_list.clone();
    let got = got.clone();
    tasklet.goto(&mut guard, move |_, me| {
        let handle = me.handle();
        while wait_list.down(1, &handle) {
            got.fetch_add(1, Ordering::SeqCst);
        }
    });
    drop(guard);
    RunQueue::target(Some(queue.clone()));
    tasklet
}

/// S1 — three tasklets parked on a zero-count wait list; a `broadcast`
/// with nothing to deliver wakes them into re-parking (no progress), then
/// three rounds of `up(2)` deliver a total of six units across however
/// the run queue happens to schedule the drainers.
#[test]
fn counted_semaphore_total_delivered_matches_total_up() {
    let queue = RunQueue::create();
    RunQueue::target(Some(queue.clone()));

    let wait_list = Arc::new(WaitList::init(0));
    let got = Arc::new(AtomicU64::new(0));

    let _tasklets: Vec<_> = (0..3)
        .map(|_| spawn_drainer(&queue, &wait_list, &got))
        .collect();

    // All three parked on creation (count is 0).
    queue.run(false);
    assert_eq!(wait_list.waiting(), 3);
    assert_eq!(got.load(Ordering::SeqCst), 0);

    // Broadcast wakes all three; each re-tries down and re-parks since
    // the count is still zero. No progress, no count touched.
    wait_list.broadcast();
    queue.run(false);
    assert_eq!(got.load(Ordering::SeqCst), 0);
    assert_eq!(wait_list.waiting(), 3);
    assert_eq!(wait_list.count(), 0);

    for _ in 0..3 {
        wait_list.up(2);
        queue.run(false);
    }

    assert_eq!(got.load(Ordering::SeqCst), 6);
    assert_eq!(wait_list.count(), 0);
}

/// Property #2 — `up(n)` releases exactly the first `n` waiters in
/// subscription order, leaving the rest parked.
#[test]
fn up_releases_front_waiters_in_fifo_order() {
    let queue = RunQueue::create();
    RunQueue::target(Some(queue.clone()));

    let wait_list = Arc::new(WaitList::init(0));
    let order = Arc::new(std::sync::Mutex::new(Vec::new()));

    let mutexes: Vec<_> = (0..4).map(|_| TaskletMutex::new(())).collect();
    let tasklets: Vec<_> = mutexes
        .iter()
        .enumerate()
        .map(|(i, mutex)| {
            let mut guard = mutex.lock();
            let tasklet = Tasklet::init(mutex.clone());
            let wait_list = wait_list.clone();
            let order = order.clone();
            tasklet.goto(&mut guard, move |_, me| {
                if wait_list.down(1, &me.handle()) {
                    order.lock().unwrap().push(i);
                }
            });
            drop(guard);
            tasklet
        })
        .collect();

    queue.run(false);
    assert_eq!(wait_list.waiting(), 4);

    // Releases exactly the first two waiters (0 and 1), in order.
    wait_list.up(2);
    queue.run(false);
    assert_eq!(*order.lock().unwrap(), vec![0, 1]);
    assert_eq!(wait_list.waiting(), 2);

    wait_list.up(2);
    queue.run(false);
    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
    assert_eq!(wait_list.waiting(), 0);

    drop(tasklets);
}

/// Property #3 — `broadcast` on an empty waiter set is a no-op; on a
/// non-empty set it wakes everyone without touching the count.
#[test]
fn broadcast_is_idempotent_and_count_preserving() {
    let wait_list = WaitList::init(5);
    wait_list.broadcast();
    assert_eq!(wait_list.count(), 5);
    assert_eq!(wait_list.waiting(), 0);

    let queue = RunQueue::create();
    RunQueue::target(Some(queue.clone()));
    let wait_list = Arc::new(wait_list);

    let mutex = TaskletMutex::new(());
    let mut guard = mutex.lock();
    let tasklet = Tasklet::init(mutex.clone());
    let woken = Arc::new(AtomicU64::new(0));
    {
        let woken = woken.clone();
        tasklet.goto(&mut guard, move |_, me| {
            woken.fetch_add(1, Ordering::SeqCst);
            me.handle();
        });
    }
    drop(guard);

    // Manually park it without consuming count, the way a pure
    // condition-variable wait would.
    wait_list.wait(&tasklet.handle());
    assert_eq!(wait_list.waiting(), 1);

    wait_list.broadcast();
    queue.run(false);
    assert_eq!(wait_list.waiting(), 0);
    assert_eq!(wait_list.count(), 5, "broadcast must not touch the count");
}

/// `fini` on a wait list with no parked tasklets succeeds; a non-empty
/// one is a programmer-contract violation (panics).
#[test]
fn fini_requires_empty_waiters() {
    let wait_list = WaitList::init(0);
    wait_list.fini();
}

#[test]
#[should_panic(expected = "waiters still parked")]
fn fini_panics_with_waiters_still_parked() {
    let wait_list = Arc::new(WaitList::init(0));
    let mutex = TaskletMutex::new(());
    let tasklet = Tasklet::init(mutex);
    wait_list.wait(&tasklet.handle());
    Arc::try_unwrap(wait_list)
        .unwrap_or_else(|_| panic!("wait list still shared"))
        .fini();
}
