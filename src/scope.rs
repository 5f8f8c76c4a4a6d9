//! Structured concurrency: `AsyncScope` lets a task fan out a bounded set
//! of child tasks and await them all finishing before proceeding. A fan-out
//! counter plus a single stored continuation waker, released when the
//! counter reaches zero, backs the whole thing.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use parking_lot::Mutex;

use crate::config::Priority;
use crate::scheduler::Scheduler;

struct ScopeInner {
    outstanding: AtomicUsize,
    continuation: Mutex<Option<Waker>>,
}

/// Bounds the lifetime of a set of spawned child tasks: [`AsyncScope::spawn`]
/// fans out, [`AsyncScope::join`] suspends the caller until every child
/// spawned through this scope has completed. Each child carries a guard
/// that decrements the outstanding count on drop, so a panicking child
/// still unblocks `join` exactly once.
pub struct AsyncScope {
    scheduler: Arc<Scheduler>,
    inner: Arc<ScopeInner>,
    joined: bool,
}

impl AsyncScope {
    pub fn new(scheduler: Arc<Scheduler>) -> Self {
        Self {
            scheduler,
            inner: Arc::new(ScopeInner {
                outstanding: AtomicUsize::new(0),
                continuation: Mutex::new(None),
            }),
            joined: false,
        }
    }

    /// Spawns `future` as a detached child of this scope. `join()` will not
    /// resolve until it, and every other child spawned so far, completes.
    pub fn spawn<F>(&self, future: F, affinity: u64, priority: Priority)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.inner.outstanding.fetch_add(1, Ordering::AcqRel);
        let guard = DecrementOnDrop {
            inner: self.inner.clone(),
        };
        let wrapped = async move {
            future.await;
            drop(guard);
        };
        self.scheduler.spawn_detached(wrapped, affinity, priority);
    }

    /// Consumes the scope, returning a future that resolves once every
    /// child spawned through it has completed (including children spawned
    /// after this call, as long as it happens before the counter next
    /// reaches zero).
    pub fn join(mut self) -> ScopeJoin {
        self.joined = true;
        ScopeJoin {
            inner: self.inner.clone(),
        }
    }
}

impl Drop for AsyncScope {
    /// A scope dropped without ever being joined is a programmer error per
    /// the structured-concurrency contract. Debug builds catch it loudly;
    /// release builds just leak the still-running children rather than
    /// invoke undefined behavior.
    fn drop(&mut self) {
        debug_assert!(
            self.joined,
            "AsyncScope dropped without calling join(); spawned tasks were leaked"
        );
    }
}

struct DecrementOnDrop {
    inner: Arc<ScopeInner>,
}

impl Drop for DecrementOnDrop {
    fn drop(&mut self) {
        if self.inner.outstanding.fetch_sub(1, Ordering::AcqRel) == 1 {
            if let Some(waker) = self.inner.continuation.lock().take() {
                waker.wake();
            }
        }
    }
}

/// Future returned by [`AsyncScope::join`].
pub struct ScopeJoin {
    inner: Arc<ScopeInner>,
}

impl Future for ScopeJoin {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.inner.outstanding.load(Ordering::Acquire) == 0 {
            return Poll::Ready(());
        }
        *self.inner.continuation.lock() = Some(cx.waker().clone());
        // Re-check: the last child may have decremented to zero between
        // the check above and registering the continuation.
        if self.inner.outstanding.load(Ordering::Acquire) == 0 {
            return Poll::Ready(());
        }
        Poll::Pending
    }
}
