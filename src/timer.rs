//! Timer heap (C1) and the `delay` awaitable built on top of it.
//!
//! Entries order by `(deadline, sequence)`: deadline first, then a
//! monotonically increasing sequence number assigned at insertion, since
//! Rust gives no stable address for a value that may move and a pointer
//! identity isn't available to break deadline ties.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::event::FdWaitEvent;
use crate::scheduler::Scheduler;

/// Absolute monotonic instant. Always derived from `Instant::now()` at the
/// call site, never recomputed later.
pub fn now() -> Instant {
    Instant::now()
}

/// Convenience: an absolute deadline `duration` from now.
pub fn after(duration: Duration) -> Instant {
    now() + duration
}

pub(crate) enum TimerTarget {
    /// A plain `delay()` suspension: waking it just invokes the waker.
    Delay(Arc<DelayState>),
    /// A deadline attached to an fd-wait event: expiry must also detach the
    /// fd from the poller, which is why the reactor special-cases this
    /// branch rather than treating every timer uniformly.
    FdWait(Arc<FdWaitEvent>),
}

/// Stable handle returned by [`TimerHeap::add`], usable with
/// [`TimerHeap::cancel`]. Cancellation is idempotent.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct TimerHandle {
    deadline: Instant,
    sequence: u64,
}

/// Ordered `{deadline, target}` set behind a single mutex, per §4.1.
pub(crate) struct TimerHeap {
    entries: Mutex<std::collections::BTreeMap<(Instant, u64), TimerTarget>>,
    next_sequence: AtomicU64,
}

impl TimerHeap {
    pub(crate) fn new() -> Self {
        Self {
            entries: Mutex::new(std::collections::BTreeMap::new()),
            next_sequence: AtomicU64::new(0),
        }
    }

    pub(crate) fn add(&self, deadline: Instant, target: TimerTarget) -> TimerHandle {
        let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().insert((deadline, sequence), target);
        tracing::debug!(sequence, "timer armed");
        TimerHandle { deadline, sequence }
    }

    pub(crate) fn cancel(&self, handle: TimerHandle) {
        let removed = self.entries.lock().remove(&(handle.deadline, handle.sequence)).is_some();
        tracing::debug!(sequence = handle.sequence, removed, "timer cancelled");
    }

    pub(crate) fn peek_deadline(&self) -> Option<Instant> {
        self.entries.lock().keys().next().map(|(deadline, _)| *deadline)
    }

    /// Removes and returns every entry whose deadline has elapsed, in
    /// deadline order.
    pub(crate) fn drain_expired(&self, now: Instant) -> Vec<TimerTarget> {
        let mut entries = self.entries.lock();
        let expired_keys: Vec<(Instant, u64)> = entries
            .range(..)
            .take_while(|((deadline, _), _)| *deadline <= now)
            .map(|(k, _)| *k)
            .collect();
        expired_keys
            .into_iter()
            .filter_map(|k| entries.remove(&k))
            .collect()
    }
}

/// Shared completion state for a `delay()` awaitable.
pub(crate) struct DelayState {
    fired: AtomicBool,
    waker: Mutex<Option<Waker>>,
}

impl DelayState {
    /// Invoked by the reactor when this timer's deadline has been reached.
    pub(crate) fn fire(&self) {
        self.fired.store(true, Ordering::Release);
        if let Some(waker) = self.waker.lock().take() {
            waker.wake();
        }
    }
}

/// Future returned by [`delay`]. Suspends the current task and resumes it
/// once `deadline` has elapsed.
pub struct Delay {
    scheduler: Arc<Scheduler>,
    deadline: Instant,
    state: Arc<DelayState>,
    handle: Option<TimerHandle>,
}

impl Future for Delay {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        if this.state.fired.load(Ordering::Acquire) || now() >= this.deadline {
            return Poll::Ready(());
        }

        *this.state.waker.lock() = Some(cx.waker().clone());

        if this.handle.is_none() {
            let handle = this
                .scheduler
                .add_timer(this.deadline, TimerTarget::Delay(this.state.clone()));
            this.handle = Some(handle);
        }

        Poll::Pending
    }
}

impl Drop for Delay {
    fn drop(&mut self) {
        // Cancelling an already-fired timer is a documented no-op
        // (`TimerHeap::cancel` just finds nothing to remove).
        if let Some(handle) = self.handle.take() {
            self.scheduler.cancel_timer(handle);
        }
    }
}

/// Suspends the current task for `duration`, registering a timer with
/// `target = this task`; resumes after expiry. A zero or already-elapsed
/// duration resolves on first poll without registering a timer.
pub fn delay(scheduler: Arc<Scheduler>, duration: Duration) -> Delay {
    Delay {
        scheduler,
        deadline: after(duration),
        state: Arc::new(DelayState {
            fired: AtomicBool::new(false),
            waker: Mutex::new(None),
        }),
        handle: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delay_state() -> Arc<DelayState> {
        Arc::new(DelayState {
            fired: AtomicBool::new(false),
            waker: Mutex::new(None),
        })
    }

    #[test]
    fn heap_orders_by_deadline_then_sequence() {
        let heap = TimerHeap::new();
        let base = now();
        let far = delay_state();
        let near = delay_state();

        let handle_far = heap.add(base + Duration::from_millis(20), TimerTarget::Delay(far));
        let handle_near = heap.add(base + Duration::from_millis(10), TimerTarget::Delay(near.clone()));

        assert_eq!(heap.peek_deadline(), Some(handle_near.deadline));

        let expired = heap.drain_expired(base + Duration::from_millis(15));
        assert_eq!(expired.len(), 1);
        match &expired[0] {
            TimerTarget::Delay(state) => assert!(Arc::ptr_eq(state, &near)),
            TimerTarget::FdWait(_) => panic!("expected a delay target"),
        }

        // The later entry is still pending.
        assert_eq!(heap.peek_deadline(), Some(handle_far.deadline));
    }

    #[test]
    fn cancel_is_idempotent() {
        let heap = TimerHeap::new();
        let handle = heap.add(now() + Duration::from_millis(5), TimerTarget::Delay(delay_state()));

        heap.cancel(handle);
        heap.cancel(handle); // already removed; must not panic

        assert!(heap.peek_deadline().is_none());
        assert!(heap.drain_expired(now() + Duration::from_secs(1)).is_empty());
    }

    #[test]
    fn drain_expired_is_empty_when_nothing_has_elapsed() {
        let heap = TimerHeap::new();
        heap.add(now() + Duration::from_secs(60), TimerTarget::Delay(delay_state()));
        assert!(heap.drain_expired(now()).is_empty());
    }
}
