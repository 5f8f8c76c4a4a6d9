//! Thin wrapper around `mio::Poll`, owned exclusively by the reactor thread.
//!
//! It is not shared behind an `Arc<Mutex<_>>`: only the single reactor
//! thread ever calls [`Poller::poll`], so there is no concurrent access to
//! guard against. Registration from arbitrary threads goes through a
//! cloned [`mio::Registry`] instead (see the `registry` field on
//! [`crate::scheduler::Scheduler`]), which is `Send + Sync` on its own.

use std::io;
use std::time::Duration;

use mio::{Events, Poll, Registry};

/// Tunable max number of events buffered per poll call.
const DEFAULT_EVENT_CAPACITY: usize = 1024;

pub(crate) struct Poller {
    poll: Poll,
    events: Events,
}

impl Poller {
    pub(crate) fn new(capacity: Option<usize>) -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(capacity.unwrap_or(DEFAULT_EVENT_CAPACITY)),
        })
    }

    /// A cloned handle to the registry, safe to hand to other threads for
    /// fd registration independent of the polling loop.
    pub(crate) fn try_clone_registry(&self) -> io::Result<Registry> {
        self.poll.registry().try_clone()
    }

    /// Polls for events with an optional timeout (`None` blocks
    /// indefinitely), then hands back an iterator over the fired events.
    pub(crate) fn poll(&mut self, timeout: Option<Duration>) -> io::Result<impl Iterator<Item = &mio::event::Event>> {
        self.poll.poll(&mut self.events, timeout)?;
        Ok(self.events.iter())
    }
}
