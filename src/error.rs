//! Error types distinguishing the categories in the design's error model:
//! timeouts, I/O failures, abandonment and task panics are never conflated.

use std::any::Any;
use std::fmt;
use std::io;

/// Outcome of an [`crate::event::fd_wait`] await, kept distinct from
/// [`AsyncIoError`] so event-state and OS errno are never folded into one
/// type (see `DESIGN.md` for why that conflation is deliberately avoided).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FdWaitOutcome {
    /// The fd became ready in the requested direction.
    Fired,
    /// The poller reported an error or hangup condition.
    Error,
    /// The deadline elapsed before readiness.
    Timeout,
    /// The wait was cancelled by another task before it resolved.
    Abandoned,
}

/// Errors surfaced by the async I/O helpers in [`crate::socket`].
#[derive(Debug, thiserror::Error)]
pub enum AsyncIoError {
    #[error("operation timed out")]
    Timeout,
    #[error("wait was abandoned")]
    Abandoned,
    #[error("connection reset by peer")]
    ConnectionReset,
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<AsyncIoError> for io::Error {
    fn from(err: AsyncIoError) -> Self {
        match err {
            AsyncIoError::Timeout => io::Error::new(io::ErrorKind::TimedOut, "timed out"),
            AsyncIoError::Abandoned => {
                io::Error::new(io::ErrorKind::Interrupted, "wait abandoned")
            }
            AsyncIoError::ConnectionReset => {
                io::Error::new(io::ErrorKind::ConnectionReset, "connection reset")
            }
            AsyncIoError::Io(e) => e,
        }
    }
}

/// The result of joining a task: either its return value (handled by the
/// caller directly), [`JoinError::Panicked`] carrying the captured panic
/// payload, or [`JoinError::Cancelled`] for a task that never ran to
/// completion (reserved for future forced-cancellation support; the current
/// scheduler never produces it, since dropped handles let tasks run to
/// completion per the structured-concurrency contract).
pub enum JoinError {
    Panicked(Box<dyn Any + Send + 'static>),
    Cancelled,
}

impl std::error::Error for JoinError {}

impl JoinError {
    /// Resumes the captured panic on the caller's stack, re-raising the
    /// task's unhandled panic in the joining thread.
    pub fn resume(self) -> ! {
        match self {
            JoinError::Panicked(payload) => std::panic::resume_unwind(payload),
            JoinError::Cancelled => panic!("joined a cancelled task"),
        }
    }
}

impl fmt::Debug for JoinError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JoinError::Panicked(_) => f.write_str("JoinError::Panicked(..)"),
            JoinError::Cancelled => f.write_str("JoinError::Cancelled"),
        }
    }
}

impl fmt::Display for JoinError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JoinError::Panicked(_) => write!(f, "task panicked"),
            JoinError::Cancelled => write!(f, "task was cancelled"),
        }
    }
}
