//! A cooperative tasklet scheduler for network services: a step-function
//! run queue, tasklet-affine mutexes, counted/broadcast wait-lists, and a
//! singleton poller that turns edge-triggered fd readiness and timer
//! expiry into tasklet wakeups.
//!
//! Start with [`run_queue::RunQueue`] and [`tasklet::Tasklet`] to build a
//! worker thread, [`wait_list::WaitList`] to synchronize tasklets, and
//! [`watched_fd::WatchedFd`] / [`timer::Timer`] to drive them from I/O and
//! deadlines.

mod error;
mod poller;
mod run_queue;
mod tasklet;
mod timer;
mod wait_list;
mod watched_fd;

pub use error::{Error, Result};
pub use poller::Poller;
pub use run_queue::RunQueue;
pub use tasklet::{GoverningMutex, RawTasklet, Tasklet, TaskletHandle, TaskletMutex, TaskletMutexGuard};
pub use timer::Timer;
pub use wait_list::WaitList;
pub use watched_fd::{Handler as WatchedFdHandler, WatchedFd, ERR, IN, OUT};
