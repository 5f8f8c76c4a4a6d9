//! The `Scheduler` (C2/C4): owns the per-worker queues, the timer heap, the
//! fd-wait token table, and the worker/reactor thread lifecycle.
//!
//! Many per-worker queues, a dedicated reactor thread, and the φ
//! low-discrepancy placement sequence from §4.4 replace what a single
//! shared queue and one polling thread would otherwise have to serialize
//! through.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use mio::unix::SourceFd;
use mio::{Interest, Registry, Token};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use slab::Slab;

use crate::config::{Priority, SchedulerConfig, MAX_CONCURRENCY};
use crate::event::{Direction, FdWaitEvent, FdWaitState};
use crate::poller::Poller;
use crate::queue::WorkQueue;
use crate::task::{self, JoinHandle, RawTask};
use crate::timer::{TimerHandle, TimerHeap, TimerTarget};
use crate::{reactor, worker};

/// Golden ratio, used verbatim for the low-discrepancy placement sequence:
/// `index = floor(counter * phi) mod popcount(mask)`.
const PHI: f64 = 1.618_033_988_749_895;

/// Reserved token the reactor registers its own self-wake handle under;
/// never handed out by [`Scheduler::register_fd_wait`].
pub(crate) const REACTOR_WAKE_TOKEN: Token = Token(usize::MAX);

pub struct Scheduler {
    pub(crate) queues: Vec<Arc<WorkQueue>>,
    cpu_count: usize,
    placement_counter: AtomicU64,
    pub(crate) timers: TimerHeap,
    pub(crate) active: Arc<AtomicBool>,
    pub(crate) registry: Registry,
    wake_handle: mio::Waker,
    pub(crate) fd_tokens: Mutex<Slab<Arc<FdWaitEvent>>>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
    reactor_thread: Mutex<Option<thread::JoinHandle<()>>>,
    #[allow(dead_code)]
    config: SchedulerConfig,
}

impl Scheduler {
    /// Builds a scheduler with default configuration (worker count =
    /// `min(available_parallelism(), MAX_CONCURRENCY)`) and starts its
    /// worker and reactor threads immediately.
    pub fn new() -> Arc<Self> {
        Self::with_config(SchedulerConfig::default())
    }

    /// Builds a scheduler from an explicit [`SchedulerConfig`].
    pub fn with_config(config: SchedulerConfig) -> Arc<Self> {
        let worker_count = config
            .worker_count
            .unwrap_or_else(|| {
                thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(1)
            })
            .clamp(1, config.max_concurrency.max(1))
            .min(MAX_CONCURRENCY);

        let queues: Vec<Arc<WorkQueue>> = (0..worker_count).map(|_| Arc::new(WorkQueue::new())).collect();

        // `poll_budget` of 0 means "use the resolved worker count" per §4.9.
        let poll_budget = if config.poll_budget == 0 { worker_count } else { config.poll_budget };
        let poller = Poller::new(Some(poll_budget)).expect("failed to create I/O poller");
        let registry = poller
            .try_clone_registry()
            .expect("failed to clone mio registry");
        let wake_handle =
            mio::Waker::new(&registry, REACTOR_WAKE_TOKEN).expect("failed to create reactor self-wake handle");

        let scheduler = Arc::new(Self {
            queues,
            cpu_count: worker_count,
            placement_counter: AtomicU64::new(0),
            timers: TimerHeap::new(),
            active: Arc::new(AtomicBool::new(true)),
            registry,
            wake_handle,
            fd_tokens: Mutex::new(Slab::new()),
            workers: Mutex::new(Vec::new()),
            reactor_thread: Mutex::new(None),
            config,
        });

        let reactor_scheduler = scheduler.clone();
        let reactor_handle = thread::Builder::new()
            .name("taskloop-reactor".into())
            .spawn(move || reactor::run(reactor_scheduler, poller))
            .expect("failed to spawn reactor thread");
        *scheduler.reactor_thread.lock() = Some(reactor_handle);

        let mut workers = Vec::with_capacity(worker_count);
        for index in 0..worker_count {
            let worker_scheduler = scheduler.clone();
            let handle = thread::Builder::new()
                .name(format!("taskloop-worker-{index}"))
                .spawn(move || worker::run(index, worker_scheduler))
                .expect("failed to spawn worker thread");
            workers.push(handle);
        }
        *scheduler.workers.lock() = workers;

        scheduler
    }

    /// A process-wide lazily-initialized scheduler, for callers that want
    /// singleton-style access without threading an `Arc<Scheduler>` through
    /// their own code.
    pub fn global() -> Arc<Self> {
        static GLOBAL: OnceCell<Arc<Scheduler>> = OnceCell::new();
        GLOBAL.get_or_init(Scheduler::new).clone()
    }

    /// Spawns a joinable task. `affinity` is a bitmask of eligible worker
    /// indices (`0` means "any worker"); `priority` selects the queue band.
    pub fn spawn<F>(self: &Arc<Self>, future: F, affinity: u64, priority: Priority) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let inner = task::spawn(self.clone(), future, affinity, priority, true);
        JoinHandle { inner }
    }

    /// Spawns a fire-and-forget task. A panic inside it is logged and
    /// otherwise discarded; there is no handle to observe it.
    pub fn spawn_detached<F>(self: &Arc<Self>, future: F, affinity: u64, priority: Priority)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        task::spawn(self.clone(), future, affinity, priority, false);
    }

    /// Stops accepting new work, wakes every parked worker and the reactor,
    /// and blocks until all threads have exited. Tasks already queued or
    /// running are allowed to run to completion; nothing is forcibly
    /// cancelled.
    pub fn shutdown(&self) {
        self.active.store(false, Ordering::Release);
        for handle in self.workers.lock().iter() {
            handle.thread().unpark();
        }
        let _ = self.wake_handle.wake();

        for handle in self.workers.lock().drain(..).collect::<Vec<_>>() {
            let _ = handle.join();
        }
        if let Some(handle) = self.reactor_thread.lock().take() {
            let _ = handle.join();
        }
    }

    pub(crate) fn schedule(&self, task: Arc<dyn RawTask>, affinity: u64, priority: Priority) {
        let mask = if affinity == 0 { self.full_mask() } else { affinity & self.full_mask() };
        let index = self.place(mask);
        tracing::trace!(worker = index, ?priority, affinity, "enqueue");
        self.queues[index].push(task, priority);
    }

    /// Forces `task` directly onto `worker`'s queue at the low priority
    /// band, bypassing [`Scheduler::place`]. Backs [`crate::task::relocate`].
    pub(crate) fn place_on(&self, worker: usize, task: Arc<dyn RawTask>) {
        let worker = worker % self.queues.len();
        tracing::trace!(worker, "relocate enqueue");
        self.queues[worker].push(task, Priority::Normal);
    }

    fn full_mask(&self) -> u64 {
        if self.cpu_count >= 64 {
            u64::MAX
        } else {
            (1u64 << self.cpu_count) - 1
        }
    }

    /// Warm-dispatch followed by the φ low-discrepancy placement sequence
    /// from §4.4: an idle eligible queue is always preferred, and only once
    /// every eligible queue has at least one task does load spread via the
    /// golden-ratio sequence, without the coordination cost of a true
    /// work-stealing deque.
    fn place(&self, mask: u64) -> usize {
        for (index, queue) in self.queues.iter().enumerate() {
            if mask & (1u64 << index) != 0 && queue.len_approx() == 0 {
                return index;
            }
        }

        let popcount = mask.count_ones() as u64;
        if popcount == 0 {
            return 0;
        }
        let counter = self.placement_counter.fetch_add(1, Ordering::Relaxed);
        let slot = ((counter as f64 * PHI).floor() as u64) % popcount;
        nth_set_bit(mask, slot).unwrap_or(0)
    }

    /// Registers `event`'s fd with the reactor for the direction it wants,
    /// arming its deadline timer if one was given. Returns `false` if the
    /// event was not in `Created` state (a race with a canceller) or
    /// registration failed.
    pub(crate) fn register_fd_wait(&self, event: &Arc<FdWaitEvent>) -> bool {
        if !event.try_transition(FdWaitState::Created, FdWaitState::Scheduled) {
            return false;
        }

        let token = {
            let mut tokens = self.fd_tokens.lock();
            Token(tokens.insert(event.clone()))
        };
        event.set_token(token);

        let interest = match event.direction {
            Direction::Readable => Interest::READABLE,
            Direction::Writable => Interest::WRITABLE,
        };
        let mut source = SourceFd(&event.fd);
        if let Err(err) = self.registry.register(&mut source, token, interest) {
            tracing::warn!(error = %err, fd = event.fd, "fd registration failed");
            self.fd_tokens.lock().remove(token.0);
            event.try_transition(FdWaitState::Scheduled, FdWaitState::Error);
            return false;
        }

        if let Some(deadline) = event.deadline {
            let handle = self.timers.add(deadline, TimerTarget::FdWait(event.clone()));
            event.set_timer_handle(handle);
        }

        let _ = self.wake_handle.wake();
        true
    }

    /// Cancels an outstanding fd wait. Idempotent: a no-op unless the event
    /// is still `Scheduled` (the reactor may have already resolved it).
    pub(crate) fn unregister_fd_wait(&self, event: &Arc<FdWaitEvent>) {
        if !event.try_transition(FdWaitState::Scheduled, FdWaitState::Abandoned) {
            return;
        }
        if let Some(token) = event.token() {
            self.fd_tokens.lock().remove(token.0);
            let mut source = SourceFd(&event.fd);
            let _ = self.registry.deregister(&mut source);
        }
        if let Some(handle) = event.take_timer_handle() {
            self.timers.cancel(handle);
        }
    }

    pub(crate) fn add_timer(&self, deadline: Instant, target: TimerTarget) -> TimerHandle {
        let handle = self.timers.add(deadline, target);
        let _ = self.wake_handle.wake();
        handle
    }

    pub(crate) fn cancel_timer(&self, handle: TimerHandle) {
        self.timers.cancel(handle);
    }
}

/// Index of the `slot`-th set bit in `mask`, counting from the
/// least-significant bit. `mask` must be non-zero and `slot < popcount`.
fn nth_set_bit(mask: u64, slot: u64) -> Option<usize> {
    let mut remaining = slot;
    let mut bits = mask;
    while bits != 0 {
        let index = bits.trailing_zeros();
        if remaining == 0 {
            return Some(index as usize);
        }
        remaining -= 1;
        bits &= bits - 1;
    }
    None
}
