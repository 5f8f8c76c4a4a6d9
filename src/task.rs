//! Task (C5): a polled `Future` wrapped in a promise — typed return value,
//! captured panic, a joinable variant, and a continuation waker for tasks
//! awaiting other tasks.
//!
//! Rust's `Future::poll` already supplies the suspension and resumption
//! machinery a stackless coroutine promise would otherwise need to
//! hand-roll; this module only adds the scheduling glue around it: the
//! `is_scheduled` at-most-once-resumed guard, the completion cell, and the
//! continuation waker.

use std::any::Any;
use std::cell::RefCell;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use parking_lot::Mutex;

use crate::config::Priority;
use crate::error::JoinError;
use crate::scheduler::Scheduler;
use crate::sync::ManualResetEvent;
use crate::waker;

/// Object-safe handle the scheduler's work queues actually store: "resume
/// this task once." Concrete task types implement it over their own
/// (generic) return type.
pub(crate) trait RawTask: Send + Sync {
    fn run(self: Arc<Self>);

    /// Forces this task directly onto worker `worker`'s queue, bypassing
    /// the placement heuristic in [`Scheduler::schedule`]. Used by
    /// [`relocate`]. Shares the same at-most-once-scheduled CAS as
    /// `wake`/`wake_by_ref`, so a relocate racing a reactor wakeup can
    /// never double-enqueue the task.
    fn place_on(self: Arc<Self>, worker: usize);

    /// Re-enqueues this task through the normal placement heuristic, but
    /// using `affinity`/`priority` supplied by the caller rather than the
    /// task's own defaults from spawn time. Used by the reactor to resume a
    /// task with the affinity/priority carried on the `FdWaitEvent` it was
    /// suspended on, mirroring the original's
    /// `schedule(handle.coro, handle.affinity, handle.priority)`. Shares the
    /// same at-most-once-scheduled CAS as `place_on`/`wake`.
    fn reschedule_with(self: Arc<Self>, affinity: u64, priority: Priority);
}

thread_local! {
    /// The task currently being polled by this worker thread, if any. Set
    /// by `TaskInner::run` for the duration of the poll so that awaitables
    /// defined outside the task body (namely [`relocate`] and
    /// [`crate::event::fd_wait`]) can recover a handle to the task
    /// suspending on them.
    static CURRENT_TASK: RefCell<Option<Arc<dyn RawTask>>> = const { RefCell::new(None) };
}

pub(crate) fn current_task() -> Option<Arc<dyn RawTask>> {
    CURRENT_TASK.with(|cell| cell.borrow().clone())
}

pub(crate) struct TaskInner<T> {
    future: Mutex<Option<Pin<Box<dyn Future<Output = T> + Send>>>>,
    is_scheduled: AtomicBool,
    scheduler: Arc<Scheduler>,
    affinity: u64,
    priority: Priority,
    result: Mutex<Option<std::thread::Result<T>>>,
    continuation: Mutex<Option<Waker>>,
    join_event: ManualResetEvent,
    joinable: bool,
}

impl<T: Send + 'static> TaskInner<T> {
    /// Invoked from the task's own waker: re-enqueues the task unless it is
    /// already scheduled (the at-most-once-resumed guard from §3).
    pub(crate) fn reschedule(self: &Arc<Self>) {
        if !self.is_scheduled.swap(true, Ordering::AcqRel) {
            let task: Arc<dyn RawTask> = self.clone();
            self.scheduler.schedule(task, self.affinity, self.priority);
        }
    }

    fn complete(self: &Arc<Self>, result: std::thread::Result<T>) {
        let is_panic = result.is_err();
        *self.result.lock() = Some(result);
        self.join_event.set();
        if let Some(waker) = self.continuation.lock().take() {
            waker.wake();
        }
        if is_panic && !self.joinable {
            tracing::error!("fire-and-forget task panicked; result discarded");
        }
    }

    pub(crate) fn take_result(&self) -> Option<std::thread::Result<T>> {
        self.result.lock().take()
    }

    pub(crate) fn set_continuation(&self, waker: Waker) {
        *self.continuation.lock() = Some(waker);
    }
}

impl<T: Send + 'static> RawTask for TaskInner<T> {
    fn run(self: Arc<Self>) {
        // Single-resume invariant: a waker fired after we already started
        // running (e.g. a spurious wake queued while polling) must not
        // cause a second concurrent poll.
        if !self.is_scheduled.swap(false, Ordering::AcqRel) {
            return;
        }

        let task_waker = waker::waker_for(self.clone());
        let mut cx = Context::from_waker(&task_waker);

        let previous = CURRENT_TASK.with(|cell| cell.borrow_mut().replace(self.clone()));

        let mut guard = self.future.lock();
        let Some(future) = guard.as_mut() else {
            // Already completed (defensive: a stray wake arrived after the
            // boxed future was dropped).
            CURRENT_TASK.with(|cell| *cell.borrow_mut() = previous);
            return;
        };

        let poll_result = catch_unwind(AssertUnwindSafe(|| future.as_mut().poll(&mut cx)));
        CURRENT_TASK.with(|cell| *cell.borrow_mut() = previous);
        match poll_result {
            Ok(Poll::Pending) => {}
            Ok(Poll::Ready(value)) => {
                *guard = None;
                drop(guard);
                self.complete(Ok(value));
            }
            Err(panic) => {
                *guard = None;
                drop(guard);
                self.complete(Err(panic));
            }
        }
    }

    fn place_on(self: Arc<Self>, worker: usize) {
        if !self.is_scheduled.swap(true, Ordering::AcqRel) {
            let scheduler = self.scheduler.clone();
            let task: Arc<dyn RawTask> = self;
            scheduler.place_on(worker, task);
        }
    }

    fn reschedule_with(self: Arc<Self>, affinity: u64, priority: Priority) {
        if !self.is_scheduled.swap(true, Ordering::AcqRel) {
            let scheduler = self.scheduler.clone();
            let task: Arc<dyn RawTask> = self;
            scheduler.schedule(task, affinity, priority);
        }
    }
}

pub(crate) fn spawn<F>(
    scheduler: Arc<Scheduler>,
    future: F,
    affinity: u64,
    priority: Priority,
    joinable: bool,
) -> Arc<TaskInner<F::Output>>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let inner = Arc::new(TaskInner {
        future: Mutex::new(Some(Box::pin(future))),
        is_scheduled: AtomicBool::new(true),
        scheduler: scheduler.clone(),
        affinity,
        priority,
        result: Mutex::new(None),
        continuation: Mutex::new(None),
        join_event: ManualResetEvent::new(false),
        joinable,
    });
    let raw: Arc<dyn RawTask> = inner.clone();
    scheduler.schedule(raw, affinity, priority);
    inner
}

/// Handle to a joinable task's eventual result. Dropping it does not cancel
/// the task: per the structured-concurrency contract, a task always runs to
/// completion once spawned.
pub struct JoinHandle<T> {
    pub(crate) inner: Arc<TaskInner<T>>,
}

impl<T: Send + 'static> JoinHandle<T> {
    /// Blocks the calling (non-task) thread until the task completes.
    pub fn wait(self) -> Result<T, JoinError> {
        self.inner.join_event.wait();
        match self.inner.take_result() {
            Some(Ok(value)) => Ok(value),
            Some(Err(panic)) => Err(JoinError::Panicked(downcast_payload(panic))),
            None => Err(JoinError::Cancelled),
        }
    }
}

impl<T: Send + 'static> Future for JoinHandle<T> {
    type Output = Result<T, JoinError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(result) = self.inner.take_result() {
            return Poll::Ready(to_join_result(result));
        }
        self.inner.set_continuation(cx.waker().clone());
        // Re-check after registering the continuation to close the race
        // where the task completed between the two locks above.
        if let Some(result) = self.inner.take_result() {
            return Poll::Ready(to_join_result(result));
        }
        Poll::Pending
    }
}

fn to_join_result<T>(result: std::thread::Result<T>) -> Result<T, JoinError> {
    match result {
        Ok(value) => Ok(value),
        Err(panic) => Err(JoinError::Panicked(downcast_payload(panic))),
    }
}

fn downcast_payload(panic: Box<dyn Any + Send>) -> Box<dyn Any + Send> {
    panic
}

/// Future returned by [`yield_now`]: on first poll, reschedules the current
/// task via the normal placement heuristic and suspends; resolves on the
/// second poll (i.e. once the scheduler resumes it).
pub struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        if this.yielded {
            return Poll::Ready(());
        }
        this.yielded = true;
        cx.waker().wake_by_ref();
        Poll::Pending
    }
}

/// Yields the worker to other ready tasks, re-enqueuing the current task
/// via the normal placement heuristic.
pub fn yield_now() -> YieldNow {
    YieldNow { yielded: false }
}

/// Future returned by [`relocate`]: forces the current task directly onto
/// `worker`'s queue, bypassing the placement heuristic.
pub struct Relocate {
    worker: usize,
    relocated: bool,
}

impl Future for Relocate {
    type Output = ();

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        if this.relocated {
            return Poll::Ready(());
        }
        this.relocated = true;
        let task = current_task().expect("relocate() awaited outside a running task");
        task.place_on(this.worker);
        Poll::Pending
    }
}

/// Immediately re-enqueues the current task directly onto `worker`,
/// bypassing the normal placement heuristic. Must be awaited from within a
/// running task (panics otherwise on first poll).
pub fn relocate(worker: usize) -> Relocate {
    Relocate {
        worker,
        relocated: false,
    }
}
