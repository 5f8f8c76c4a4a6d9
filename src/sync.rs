//! Cross-thread synchronization primitive and `sync_wait`.
//!
//! `parking_lot`'s `Mutex`/`Condvar` pair is futex-backed on Linux, giving a
//! manual-reset event the same "block the OS thread cheaply" behavior a raw
//! futex syscall wrapper would, without any `unsafe` code here.

use std::future::Future;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::error::JoinError;
use crate::scheduler::Scheduler;

/// A manual-reset event: `wait()` blocks while unset, `set()` releases every
/// waiter, `reset()` re-arms it.
pub struct ManualResetEvent {
    state: Mutex<bool>,
    condvar: Condvar,
}

impl ManualResetEvent {
    pub fn new(initially_set: bool) -> Self {
        Self {
            state: Mutex::new(initially_set),
            condvar: Condvar::new(),
        }
    }

    pub fn set(&self) {
        let mut guard = self.state.lock();
        *guard = true;
        self.condvar.notify_all();
    }

    pub fn reset(&self) {
        *self.state.lock() = false;
    }

    pub fn wait(&self) {
        let mut guard = self.state.lock();
        while !*guard {
            self.condvar.wait(&mut guard);
        }
    }
}

impl Default for ManualResetEvent {
    fn default() -> Self {
        Self::new(false)
    }
}

/// Runs `future` to completion from a non-task thread, blocking the caller
/// until it resolves. Spawns a detached joinable task bound to the
/// scheduler and blocks on its completion event (the same primitive a
/// `JoinHandle::wait()` uses), then returns the result or resumes the
/// task's captured panic.
pub fn sync_wait<F>(scheduler: &Arc<Scheduler>, future: F) -> F::Output
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let handle = scheduler.spawn(future, 0, Default::default());
    match handle.wait() {
        Ok(value) => value,
        Err(err @ JoinError::Cancelled) => panic!("{err}"),
        Err(err) => err.resume(),
    }
}
