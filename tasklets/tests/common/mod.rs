//! Shared test helpers.
//!
//! [`Poller::singleton`] is process-wide; tests that touch it (timers,
//! watched fds) serialize through [`poller_test_lock`] so they don't
//! observe each other's registrations within the same test binary.

use std::sync::{Mutex, MutexGuard, OnceLock};

static POLLER_TEST_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

pub fn poller_test_lock() -> MutexGuard<'static, ()> {
    let _ = env_logger::try_init();
    POLLER_TEST_LOCK
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}
