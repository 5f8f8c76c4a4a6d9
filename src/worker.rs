//! Worker thread loop (C3): pop from this worker's own queue, run the task,
//! and park when the queue is empty. Parking relies on `std::thread::park`'s
//! permit semantics — [`crate::queue::WorkQueue::push`] unconditionally
//! calls `unpark` on the bound thread, so a push racing the check-then-park
//! below can never be missed.

use std::cell::Cell;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::scheduler::Scheduler;

thread_local! {
    static WORKER_INDEX: Cell<Option<usize>> = const { Cell::new(None) };
}

/// The index of the worker currently executing, if called from within a
/// worker thread (i.e. from inside a running task). `None` from any other
/// thread, including the reactor thread.
pub fn current_worker() -> Option<usize> {
    WORKER_INDEX.with(|cell| cell.get())
}

pub(crate) fn run(index: usize, scheduler: Arc<Scheduler>) {
    let span = tracing::info_span!("worker_loop", worker = index);
    let _enter = span.enter();

    WORKER_INDEX.with(|cell| cell.set(Some(index)));
    let queue = scheduler.queues[index].clone();
    queue.bind_owner(std::thread::current());

    loop {
        if let Some(task) = queue.pop() {
            tracing::trace!("dequeue");
            task.run();
            continue;
        }
        if !scheduler.active.load(Ordering::Acquire) {
            break;
        }
        std::thread::park();
    }

    tracing::debug!("worker shutting down");
}
