//! Per-worker work queue (C2): a lock-free MPMC queue split into two
//! priority bands. Consumers drain the high band before the low band
//! whenever both are non-empty; there is no stronger fairness guarantee.
//! Built on `crossbeam_queue::SegQueue`, with a worker park/unpark
//! handshake layered on top so a producer can wake the one thread that owns
//! this queue.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::Thread;

use crossbeam_queue::SegQueue;
use parking_lot::Mutex;

use crate::config::Priority;
use crate::task::RawTask;

pub(crate) struct WorkQueue {
    high: SegQueue<Arc<dyn RawTask>>,
    low: SegQueue<Arc<dyn RawTask>>,
    len: AtomicUsize,
    parked_thread: Mutex<Option<Thread>>,
}

impl WorkQueue {
    pub(crate) fn new() -> Self {
        Self {
            high: SegQueue::new(),
            low: SegQueue::new(),
            len: AtomicUsize::new(0),
            parked_thread: Mutex::new(None),
        }
    }

    /// Registers the thread that owns this queue so `push` can unpark it.
    /// Called once, by the worker thread itself, before it starts popping.
    pub(crate) fn bind_owner(&self, thread: Thread) {
        *self.parked_thread.lock() = Some(thread);
    }

    pub(crate) fn push(&self, task: Arc<dyn RawTask>, priority: Priority) {
        match priority {
            Priority::High => self.high.push(task),
            Priority::Normal => self.low.push(task),
        }
        self.len.fetch_add(1, Ordering::AcqRel);
        if let Some(thread) = self.parked_thread.lock().as_ref() {
            thread.unpark();
        }
    }

    pub(crate) fn pop(&self) -> Option<Arc<dyn RawTask>> {
        let task = self.high.pop().or_else(|| self.low.pop());
        if task.is_some() {
            self.len.fetch_sub(1, Ordering::AcqRel);
        }
        task
    }

    /// Approximate queue depth, used only by the placement heuristic; need
    /// not be exact under concurrent mutation.
    pub(crate) fn len_approx(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct RecordingTask(usize, Arc<AtomicUsize>);

    impl RawTask for RecordingTask {
        fn run(self: Arc<Self>) {
            self.1.store(self.0, Ordering::SeqCst);
        }

        fn place_on(self: Arc<Self>, _worker: usize) {}

        fn reschedule_with(self: Arc<Self>, _affinity: u64, _priority: Priority) {}
    }

    #[test]
    fn high_priority_drains_before_low() {
        let queue = WorkQueue::new();
        let last_run = Arc::new(AtomicUsize::new(0));
        let low: Arc<dyn RawTask> = Arc::new(RecordingTask(1, last_run.clone()));
        let high: Arc<dyn RawTask> = Arc::new(RecordingTask(2, last_run.clone()));

        queue.push(low, Priority::Normal);
        queue.push(high, Priority::High);

        queue.pop().unwrap().run();
        assert_eq!(last_run.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn len_approx_tracks_pushes_and_pops() {
        let queue = WorkQueue::new();
        let sink = Arc::new(AtomicUsize::new(0));
        assert_eq!(queue.len_approx(), 0);

        queue.push(Arc::new(RecordingTask(1, sink.clone())), Priority::Normal);
        assert_eq!(queue.len_approx(), 1);

        assert!(queue.pop().is_some());
        assert_eq!(queue.len_approx(), 0);
        assert!(queue.pop().is_none());
    }
}
