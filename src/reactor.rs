//! Readiness reactor (C4 driver): the single thread that owns the
//! [`crate::poller::Poller`], turning fd readiness and timer expiry into
//! task wakeups. Each readable event is resolved through the CAS-guarded
//! [`crate::event::FdWaitEvent`] state machine; each loop iteration also
//! drains the timer heap, so fd and timer expiry share one wait.

use std::io;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::event::{FdWaitEvent, FdWaitState};
use crate::poller::Poller;
use crate::scheduler::{Scheduler, REACTOR_WAKE_TOKEN};
use crate::timer::TimerTarget;

pub(crate) fn run(scheduler: Arc<Scheduler>, mut poller: Poller) {
    let span = tracing::info_span!("reactor_loop");
    let _enter = span.enter();

    while scheduler.active.load(Ordering::Acquire) {
        let timeout = scheduler
            .timers
            .peek_deadline()
            .map(|deadline| deadline.saturating_duration_since(crate::timer::now()));

        match poller.poll(timeout) {
            Ok(events) => {
                let mut woken = Vec::new();
                for event in events {
                    if event.token() == REACTOR_WAKE_TOKEN {
                        continue;
                    }
                    let fd_event = scheduler.fd_tokens.lock().get(event.token().0).cloned();
                    let Some(fd_event) = fd_event else {
                        continue;
                    };
                    let outcome_state = if event.is_error() || event.is_read_closed() || event.is_write_closed() {
                        FdWaitState::Error
                    } else {
                        FdWaitState::Fired
                    };
                    if fd_event.try_transition(FdWaitState::Scheduled, outcome_state) {
                        deregister(&scheduler, &fd_event);
                        if let Some(task) = fd_event.take_task_handle() {
                            woken.push((task, fd_event.affinity, fd_event.priority));
                        }
                    }
                }
                for (task, affinity, priority) in woken {
                    task.reschedule_with(affinity, priority);
                }
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                tracing::error!(error = %err, "reactor poll failed");
            }
        }

        let now = crate::timer::now();
        for target in scheduler.timers.drain_expired(now) {
            match target {
                TimerTarget::Delay(state) => state.fire(),
                TimerTarget::FdWait(fd_event) => {
                    if fd_event.try_transition(FdWaitState::Scheduled, FdWaitState::Timeout) {
                        deregister(&scheduler, &fd_event);
                        if let Some(task) = fd_event.take_task_handle() {
                            task.reschedule_with(fd_event.affinity, fd_event.priority);
                        }
                    }
                }
            }
        }
    }

    tracing::debug!("reactor shutting down");
}

fn deregister(scheduler: &Arc<Scheduler>, event: &Arc<FdWaitEvent>) {
    if let Some(token) = event.token() {
        scheduler.fd_tokens.lock().remove(token.0);
        let mut source = mio::unix::SourceFd(&event.fd);
        let _ = scheduler.registry.deregister(&mut source);
    }
    if let Some(handle) = event.take_timer_handle() {
        scheduler.timers.cancel(handle);
    }
}
