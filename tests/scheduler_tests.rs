//! End-to-end scenarios and cross-thread invariants (S1-S6, invariants 1-7).
//! Each test builds its own scheduler, since the scheduler owns real OS
//! threads and is meant to be constructed once per logical program.

use std::collections::HashSet;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use taskloop::{
    after, current_worker, delay, relocate, sync_wait, yield_now, AsyncIoError, AsyncScope,
    FastListener, FastSocket, Priority, Scheduler, SchedulerConfig,
};

static TRACING_INIT: Once = Once::new();

fn init_tracing() {
    TRACING_INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
}

fn test_scheduler() -> Arc<Scheduler> {
    test_scheduler_with_workers(4)
}

fn test_scheduler_with_workers(workers: usize) -> Arc<Scheduler> {
    init_tracing();
    Scheduler::with_config(SchedulerConfig::builder().worker_count(workers).build())
}

fn loopback() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

// --- S1: delay order ------------------------------------------------------

#[test]
fn s1_delay_order() {
    let scheduler = test_scheduler();
    let order = Arc::new(Mutex::new(Vec::new()));
    let scope = AsyncScope::new(scheduler.clone());

    for ms in [30u64, 10, 20] {
        let order = order.clone();
        let scheduler = scheduler.clone();
        scope.spawn(
            async move {
                delay(scheduler, Duration::from_millis(ms)).await;
                order.lock().unwrap().push(ms);
            },
            0,
            Priority::Normal,
        );
    }

    sync_wait(&scheduler, scope.join());
    assert_eq!(*order.lock().unwrap(), vec![10, 20, 30]);
    scheduler.shutdown();
}

// --- S2: TCP echo -----------------------------------------------------------

#[test]
fn s2_tcp_echo() {
    let scheduler = test_scheduler();
    let listener = FastListener::bind(scheduler.clone(), loopback(), 128).unwrap();
    let addr = listener.local_addr().unwrap();

    scheduler.spawn_detached(
        async move {
            let (mut socket, _) = listener.accept(None).await.unwrap();
            let mut buf = [0u8; 11];
            socket.recv_all(&mut buf, None).await.unwrap();
            socket.send_all(&buf, None).await.unwrap();
        },
        0,
        Priority::Normal,
    );

    let connect_scheduler = scheduler.clone();
    let echoed = sync_wait(&scheduler, async move {
        let mut client = FastSocket::connect(connect_scheduler, addr, None).await.unwrap();
        client.send_all(b"Hello World", None).await.unwrap();
        let mut buf = [0u8; 11];
        client.recv_all(&mut buf, None).await.unwrap();
        buf
    });

    assert_eq!(&echoed, b"Hello World");
    scheduler.shutdown();
}

// --- S3: accept timeout ------------------------------------------------------

#[test]
fn s3_accept_timeout() {
    let scheduler = test_scheduler();
    let listener = FastListener::bind(scheduler.clone(), loopback(), 128).unwrap();

    let start = Instant::now();
    let result = sync_wait(&scheduler, async move {
        listener.accept(Some(after(Duration::from_millis(50)))).await
    });
    let elapsed = start.elapsed();

    assert!(matches!(result, Err(AsyncIoError::Timeout)));
    assert!(elapsed >= Duration::from_millis(50));
    assert!(elapsed <= Duration::from_millis(300));
    scheduler.shutdown();
}

// --- S4: scope fan-out -------------------------------------------------------

#[test]
fn s4_scope_fan_out() {
    let scheduler = test_scheduler();
    let completed = Arc::new(AtomicUsize::new(0));
    let scope = AsyncScope::new(scheduler.clone());

    for _ in 0..1000 {
        let completed = completed.clone();
        let scheduler = scheduler.clone();
        scope.spawn(
            async move {
                delay(scheduler, Duration::from_millis(1)).await;
                completed.fetch_add(1, Ordering::SeqCst);
            },
            0,
            Priority::Normal,
        );
    }

    sync_wait(&scheduler, scope.join());
    assert_eq!(completed.load(Ordering::SeqCst), 1000);
    scheduler.shutdown();
}

// --- S5: sync-wait ------------------------------------------------------------

#[test]
fn s5_sync_wait() {
    let scheduler = test_scheduler();
    let inner_scheduler = scheduler.clone();
    let value = sync_wait(&scheduler, async move {
        delay(inner_scheduler, Duration::from_millis(5)).await;
        42
    });
    assert_eq!(value, 42);
    scheduler.shutdown();
}

// --- S6: relocate --------------------------------------------------------------

#[test]
fn s6_relocate() {
    let scheduler = test_scheduler_with_workers(4);
    let observed = sync_wait(&scheduler, async move {
        relocate(2).await;
        current_worker()
    });
    assert_eq!(observed, Some(2));
    scheduler.shutdown();
}

// --- Invariant 1: single-resume ------------------------------------------------

/// A future that panics if it is ever polled while another poll of the same
/// instance is already in flight, and otherwise re-wakes itself a bounded
/// number of times. Exercises both the `is_scheduled` CAS guard and the
/// per-task future mutex as a backstop against concurrent polling.
struct RacyFuture {
    in_poll: Arc<AtomicUsize>,
    remaining: usize,
}

impl Future for RacyFuture {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        let concurrent = this.in_poll.fetch_add(1, Ordering::SeqCst);
        assert_eq!(concurrent, 0, "task polled concurrently with itself");
        std::thread::sleep(Duration::from_micros(200));
        this.in_poll.fetch_sub(1, Ordering::SeqCst);

        if this.remaining == 0 {
            Poll::Ready(())
        } else {
            this.remaining -= 1;
            cx.waker().wake_by_ref();
            Poll::Pending
        }
    }
}

#[test]
fn invariant_single_resume() {
    let scheduler = test_scheduler();
    let in_poll = Arc::new(AtomicUsize::new(0));
    let handle = scheduler.spawn(
        RacyFuture {
            in_poll,
            remaining: 20,
        },
        0,
        Priority::Normal,
    );
    handle.wait().expect("task must not panic");
    scheduler.shutdown();
}

// --- Invariant 2: timer ordering -------------------------------------------------

#[test]
fn invariant_timer_ordering() {
    let scheduler = test_scheduler();
    let order = Arc::new(Mutex::new(Vec::new()));
    let scope = AsyncScope::new(scheduler.clone());

    for (label, ms) in [("far", 40u64), ("near", 5)] {
        let order = order.clone();
        let scheduler = scheduler.clone();
        scope.spawn(
            async move {
                delay(scheduler, Duration::from_millis(ms)).await;
                order.lock().unwrap().push(label);
            },
            0,
            Priority::Normal,
        );
    }

    sync_wait(&scheduler, scope.join());
    assert_eq!(*order.lock().unwrap(), vec!["near", "far"]);
    scheduler.shutdown();
}

// --- Invariant 3: fd-wait race resolves to exactly one outcome -----------------

#[test]
fn invariant_fd_wait_race_resolves_once() {
    let scheduler = test_scheduler();
    let listener = FastListener::bind(scheduler.clone(), loopback(), 128).unwrap();
    let addr = listener.local_addr().unwrap();

    let connect_scheduler = scheduler.clone();
    scheduler.spawn_detached(
        async move {
            delay(connect_scheduler.clone(), Duration::from_millis(10)).await;
            let _ = FastSocket::connect(connect_scheduler, addr, None).await;
        },
        0,
        Priority::Normal,
    );

    let deadline = Some(after(Duration::from_millis(20)));
    let result = sync_wait(&scheduler, async move { listener.accept(deadline).await });

    assert!(result.is_ok() || matches!(result, Err(AsyncIoError::Timeout)));
    scheduler.shutdown();
}

// --- Invariant 4: scope join exactly once --------------------------------------

#[test]
fn invariant_scope_join_exactly_once() {
    let scheduler = test_scheduler();
    let joins = Arc::new(AtomicUsize::new(0));
    let scope = AsyncScope::new(scheduler.clone());

    for _ in 0..16 {
        scope.spawn(yield_now(), 0, Priority::Normal);
    }

    let joins_clone = joins.clone();
    sync_wait(&scheduler, async move {
        scope.join().await;
        joins_clone.fetch_add(1, Ordering::SeqCst);
    });

    assert_eq!(joins.load(Ordering::SeqCst), 1);
    scheduler.shutdown();
}

// --- Invariant 5: warm-dispatch placement ---------------------------------------

#[test]
fn invariant_warm_dispatch_placement() {
    let workers = 4;
    let scheduler = test_scheduler_with_workers(workers);
    let hits = Arc::new(Mutex::new(Vec::new()));
    let scope = AsyncScope::new(scheduler.clone());

    for _ in 0..(2 * workers) {
        let hits = hits.clone();
        scope.spawn(
            async move {
                if let Some(worker) = current_worker() {
                    hits.lock().unwrap().push(worker);
                }
                // Keep the worker busy long enough that the whole fan-out
                // loop below finishes placing every task before any worker
                // comes back around for a second one.
                std::thread::sleep(Duration::from_millis(30));
            },
            0,
            Priority::Normal,
        );
    }

    sync_wait(&scheduler, scope.join());
    let hits = hits.lock().unwrap();
    let first_wave: HashSet<usize> = hits.iter().take(workers).cloned().collect();
    assert_eq!(first_wave.len(), workers, "expected every worker to get exactly one task in the first wave");
    scheduler.shutdown();
}

// --- Invariant 6: cancellation idempotence --------------------------------------

#[test]
fn invariant_cancel_pending_delay_is_clean() {
    let scheduler = test_scheduler();
    let mut pending = Box::pin(delay(scheduler.clone(), Duration::from_secs(5)));
    let waker = std::task::Waker::noop();
    let mut cx = Context::from_waker(waker);

    assert_eq!(pending.as_mut().poll(&mut cx), Poll::Pending);
    drop(pending); // cancels the still-armed 5s timer; must not block or panic

    scheduler.shutdown();
}

#[test]
fn invariant_cancel_already_fired_delay_is_noop() {
    let scheduler = test_scheduler();
    sync_wait(&scheduler, async {
        delay(scheduler.clone(), Duration::from_millis(1)).await;
    });
    // The `Delay` above has already fired and been dropped; reaching this
    // point without panicking demonstrates `TimerHeap::cancel`'s no-op path.
    scheduler.shutdown();
}

// --- Scope misuse: dropping without joining is a programmer error --------------

#[test]
#[should_panic(expected = "dropped without calling join")]
fn dropping_unjoined_scope_panics_in_debug() {
    let scheduler = test_scheduler();
    let scope = AsyncScope::new(scheduler.clone());
    scope.spawn(
        async {
            std::thread::sleep(Duration::from_millis(50));
        },
        0,
        Priority::Normal,
    );
    drop(scope); // never joined, and a child is still outstanding
}

// --- Invariant 7: abort shutdown terminates promptly ----------------------------

#[test]
fn invariant_abort_shutdown_terminates_promptly() {
    let scheduler = test_scheduler();
    for _ in 0..8 {
        let scheduler_for_task = scheduler.clone();
        scheduler.spawn_detached(
            async move {
                delay(scheduler_for_task, Duration::from_millis(5)).await;
            },
            0,
            Priority::Normal,
        );
    }

    let start = Instant::now();
    scheduler.shutdown();
    assert!(start.elapsed() < Duration::from_secs(2));
}
