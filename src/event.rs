//! FD-wait event (C5 awaitable) — `fd_wait`. An `AtomicU8`-backed state
//! machine, CAS-guarded because both the reactor and a cancelling task may
//! race to transition it. A stored task handle (`Arc<dyn RawTask>`) replaces
//! the coroutine-handle resumption a non-Rust implementation of this state
//! machine would need, and lets the reactor resume the waiter with this
//! event's own `affinity`/`priority` rather than the waiter's spawn-time
//! defaults — the same `schedule(handle.coro, handle.affinity,
//! handle.priority)` the original performs on fire/timeout.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use parking_lot::Mutex;

use crate::config::Priority;
use crate::error::FdWaitOutcome;
use crate::scheduler::Scheduler;
use crate::task::{self, RawTask};
use crate::timer::TimerHandle;

/// Readiness direction an [`FdWaitEvent`] waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Readable,
    Writable,
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FdWaitState {
    Created = 0,
    Scheduled = 1,
    Fired = 2,
    Error = 3,
    Timeout = 4,
    Abandoned = 5,
}

impl FdWaitState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => FdWaitState::Created,
            1 => FdWaitState::Scheduled,
            2 => FdWaitState::Fired,
            3 => FdWaitState::Error,
            4 => FdWaitState::Timeout,
            5 => FdWaitState::Abandoned,
            _ => unreachable!("invalid FdWaitState discriminant"),
        }
    }
}

impl From<FdWaitState> for FdWaitOutcome {
    fn from(state: FdWaitState) -> Self {
        match state {
            FdWaitState::Fired => FdWaitOutcome::Fired,
            FdWaitState::Error => FdWaitOutcome::Error,
            FdWaitState::Timeout => FdWaitOutcome::Timeout,
            FdWaitState::Abandoned => FdWaitOutcome::Abandoned,
            FdWaitState::Created | FdWaitState::Scheduled => {
                unreachable!("non-terminal FdWaitState has no outcome")
            }
        }
    }
}

/// Cross-thread event state for one outstanding fd wait. Only the waiter
/// performs `Created -> Scheduled`; only the reactor performs
/// `Scheduled -> {Fired, Error, Timeout}`; only a canceller performs
/// `Scheduled -> Abandoned`.
pub(crate) struct FdWaitEvent {
    pub(crate) fd: i32,
    pub(crate) direction: Direction,
    pub(crate) deadline: Option<Instant>,
    pub(crate) affinity: u64,
    pub(crate) priority: Priority,
    state: AtomicU8,
    token: Mutex<Option<mio::Token>>,
    timer_handle: Mutex<Option<TimerHandle>>,
    task_handle: Mutex<Option<Arc<dyn RawTask>>>,
}

impl FdWaitEvent {
    fn new(fd: i32, direction: Direction, deadline: Option<Instant>, affinity: u64, priority: Priority) -> Self {
        Self {
            fd,
            direction,
            deadline,
            affinity,
            priority,
            state: AtomicU8::new(FdWaitState::Created as u8),
            token: Mutex::new(None),
            timer_handle: Mutex::new(None),
            task_handle: Mutex::new(None),
        }
    }

    pub(crate) fn state(&self) -> FdWaitState {
        FdWaitState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn try_transition(&self, from: FdWaitState, to: FdWaitState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn set_token(&self, token: mio::Token) {
        *self.token.lock() = Some(token);
    }

    pub(crate) fn token(&self) -> Option<mio::Token> {
        *self.token.lock()
    }

    pub(crate) fn set_timer_handle(&self, handle: TimerHandle) {
        *self.timer_handle.lock() = Some(handle);
    }

    pub(crate) fn take_timer_handle(&self) -> Option<TimerHandle> {
        self.timer_handle.lock().take()
    }

    pub(crate) fn set_task_handle(&self, task: Arc<dyn RawTask>) {
        *self.task_handle.lock() = Some(task);
    }

    pub(crate) fn take_task_handle(&self) -> Option<Arc<dyn RawTask>> {
        self.task_handle.lock().take()
    }
}

/// Future returned by [`fd_wait`]. Resolves to an [`FdWaitOutcome`] once the
/// fd becomes ready, errors, times out, or is abandoned by a canceller.
pub struct FdWait {
    scheduler: Arc<Scheduler>,
    event: Arc<FdWaitEvent>,
}

impl Future for FdWait {
    type Output = FdWaitOutcome;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        match this.event.state() {
            FdWaitState::Created => {
                if let Some(deadline) = this.event.deadline {
                    if deadline <= crate::timer::now() {
                        return Poll::Ready(FdWaitOutcome::Timeout);
                    }
                }
                let task = task::current_task().expect("fd_wait() awaited outside a running task");
                this.event.set_task_handle(task);
                if this.scheduler.register_fd_wait(&this.event) {
                    Poll::Pending
                } else {
                    Poll::Ready(FdWaitOutcome::Error)
                }
            }
            FdWaitState::Scheduled => Poll::Pending,
            terminal => Poll::Ready(terminal.into()),
        }
    }
}

impl Drop for FdWait {
    fn drop(&mut self) {
        // If this future is torn down while still registered (e.g. the
        // owning task's future was replaced or the task panicked before
        // completing the await), unwind the registration rather than
        // leaking an fd interest and a timer in the scheduler.
        if self.event.state() == FdWaitState::Scheduled {
            self.scheduler.unregister_fd_wait(&self.event);
        }
    }
}

/// Constructs an fd-wait event in `Created` state and waits for `fd` to
/// become ready for `direction`, or for `deadline` to elapse (`None`
/// disables the timeout). `affinity` and `priority` govern how the waiting
/// task is rescheduled once the event resolves (`affinity = 0` means "any
/// worker"), independent of the affinities/priority it was originally
/// spawned with. Must be called from within a running task.
pub fn fd_wait(
    scheduler: Arc<Scheduler>,
    fd: i32,
    direction: Direction,
    deadline: Option<Instant>,
    affinity: u64,
    priority: Priority,
) -> FdWait {
    FdWait {
        scheduler,
        event: Arc::new(FdWaitEvent::new(fd, direction, deadline, affinity, priority)),
    }
}
