//! A multi-threaded cooperative task scheduler with an integrated I/O
//! readiness reactor and timer heap.
//!
//! The public surface is built around [`scheduler::Scheduler`]: spawn
//! [`Future`](std::future::Future)s onto it with [`scheduler::Scheduler::spawn`]
//! or [`scheduler::Scheduler::spawn_detached`], suspend with
//! [`timer::delay`] or [`event::fd_wait`], fan out structured child work
//! with [`scope::AsyncScope`], and drive a future from outside the
//! scheduler entirely with [`sync::sync_wait`].

pub mod config;
pub mod error;
pub mod event;
pub(crate) mod queue;
pub(crate) mod poller;
pub(crate) mod reactor;
pub mod scheduler;
pub mod scope;
pub mod socket;
pub mod sync;
pub mod task;
pub mod timer;
pub(crate) mod waker;
pub(crate) mod worker;

pub use config::{Priority, SchedulerConfig};
pub use error::{AsyncIoError, FdWaitOutcome, JoinError};
pub use event::{fd_wait, Direction, FdWait};
pub use scheduler::Scheduler;
pub use scope::{AsyncScope, ScopeJoin};
pub use socket::{FastListener, FastSocket};
pub use sync::{sync_wait, ManualResetEvent};
pub use task::{relocate, yield_now, JoinHandle, Relocate, YieldNow};
pub use timer::{after, delay, now, Delay};
pub use worker::current_worker;
