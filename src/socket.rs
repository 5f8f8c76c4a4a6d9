//! Non-blocking TCP sockets awaited through the scheduler's own `fd_wait`
//! readiness primitive (C6).
//!
//! The send/recv/accept loops below follow the same shape throughout:
//! try the non-blocking syscall, await readiness on `WouldBlock`, retry,
//! until the buffer is exhausted or an error other than `WouldBlock` occurs.

use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::time::Instant;

use mio::net::{TcpListener, TcpStream};
use socket2::{Domain, Protocol, Socket, Type};

use crate::config::Priority;
use crate::error::{AsyncIoError, FdWaitOutcome};
use crate::event::{fd_wait, Direction};
use crate::scheduler::Scheduler;

/// `affinity`/`priority` every socket readiness wait resumes with: any
/// worker, high priority, so I/O wakeups preempt freshly-queued compute
/// the way the reactor's own fd-wait dispatch always has.
const IO_AFFINITY: u64 = 0;
const IO_PRIORITY: Priority = Priority::High;

/// A non-blocking TCP connection, readable and writable from within a task.
pub struct FastSocket {
    scheduler: Arc<Scheduler>,
    stream: TcpStream,
}

impl FastSocket {
    /// Connects to `addr`, waiting for the connection to become writable
    /// (the standard non-blocking-connect completion signal) or `deadline`
    /// to elapse.
    pub async fn connect(scheduler: Arc<Scheduler>, addr: SocketAddr, deadline: Option<Instant>) -> Result<Self, AsyncIoError> {
        let stream = TcpStream::connect(addr)?;
        let socket = Self {
            scheduler,
            stream,
        };
        socket.await_ready(Direction::Writable, deadline).await?;
        if let Some(err) = socket.stream.take_error()? {
            return Err(AsyncIoError::Io(err));
        }
        Ok(socket)
    }

    pub(crate) fn from_stream(scheduler: Arc<Scheduler>, stream: TcpStream) -> Self {
        Self { scheduler, stream }
    }

    async fn await_ready(&self, direction: Direction, deadline: Option<Instant>) -> Result<(), AsyncIoError> {
        let fd = self.stream.as_raw_fd();
        match fd_wait(self.scheduler.clone(), fd, direction, deadline, IO_AFFINITY, IO_PRIORITY).await {
            FdWaitOutcome::Fired => Ok(()),
            FdWaitOutcome::Timeout => Err(AsyncIoError::Timeout),
            FdWaitOutcome::Abandoned => Err(AsyncIoError::Abandoned),
            FdWaitOutcome::Error => Err(AsyncIoError::Io(io::Error::other("fd reported an error condition"))),
        }
    }

    /// Writes as much of `buf` as a single non-blocking send accepts,
    /// retrying on `WouldBlock` until readiness or `deadline`.
    pub async fn send(&mut self, buf: &[u8], deadline: Option<Instant>) -> Result<usize, AsyncIoError> {
        loop {
            match self.stream.write(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.await_ready(Direction::Writable, deadline).await?;
                }
                Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                    return Err(AsyncIoError::ConnectionReset);
                }
                Err(e) => return Err(AsyncIoError::Io(e)),
            }
        }
    }

    /// Sends the entirety of `buf`, looping over [`Self::send`] until
    /// exhausted.
    pub async fn send_all(&mut self, mut buf: &[u8], deadline: Option<Instant>) -> Result<(), AsyncIoError> {
        while !buf.is_empty() {
            let n = self.send(buf, deadline).await?;
            if n == 0 {
                return Err(AsyncIoError::ConnectionReset);
            }
            buf = &buf[n..];
        }
        Ok(())
    }

    /// Reads into `buf`, retrying on `WouldBlock` until readiness or
    /// `deadline`. Returns `Ok(0)` on a clean peer shutdown.
    pub async fn recv(&mut self, buf: &mut [u8], deadline: Option<Instant>) -> Result<usize, AsyncIoError> {
        loop {
            match self.stream.read(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.await_ready(Direction::Readable, deadline).await?;
                }
                Err(e) if e.kind() == io::ErrorKind::ConnectionReset => {
                    return Err(AsyncIoError::ConnectionReset);
                }
                Err(e) => return Err(AsyncIoError::Io(e)),
            }
        }
    }

    /// Fills `buf` entirely, looping over [`Self::recv`]. A clean shutdown
    /// before `buf` is full is reported as [`AsyncIoError::ConnectionReset`].
    pub async fn recv_all(&mut self, mut buf: &mut [u8], deadline: Option<Instant>) -> Result<(), AsyncIoError> {
        while !buf.is_empty() {
            let n = self.recv(buf, deadline).await?;
            if n == 0 {
                return Err(AsyncIoError::ConnectionReset);
            }
            buf = &mut buf[n..];
        }
        Ok(())
    }

    pub fn close(mut self) -> io::Result<()> {
        self.stream.shutdown(std::net::Shutdown::Both)
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream.peer_addr()
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.stream.local_addr()
    }
}

/// A non-blocking TCP listener.
pub struct FastListener {
    scheduler: Arc<Scheduler>,
    listener: TcpListener,
}

impl FastListener {
    /// Binds and listens on `addr` with the given `backlog` (the pending-
    /// connection queue depth passed to `listen(2)`). Built via `socket2`
    /// rather than `mio::net::TcpListener::bind`, which hardcodes its own
    /// backlog and gives callers no way to override it.
    pub fn bind(scheduler: Arc<Scheduler>, addr: SocketAddr, backlog: i32) -> io::Result<Self> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.listen(backlog)?;
        let listener = TcpListener::from_std(socket.into());
        Ok(Self { scheduler, listener })
    }

    /// Accepts one connection, waiting for readiness or `deadline`.
    pub async fn accept(&self, deadline: Option<Instant>) -> Result<(FastSocket, SocketAddr), AsyncIoError> {
        loop {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    return Ok((FastSocket::from_stream(self.scheduler.clone(), stream), addr));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    let fd = self.listener.as_raw_fd();
                    match fd_wait(self.scheduler.clone(), fd, Direction::Readable, deadline, IO_AFFINITY, IO_PRIORITY).await {
                        FdWaitOutcome::Fired => continue,
                        FdWaitOutcome::Timeout => return Err(AsyncIoError::Timeout),
                        FdWaitOutcome::Abandoned => return Err(AsyncIoError::Abandoned),
                        FdWaitOutcome::Error => {
                            return Err(AsyncIoError::Io(io::Error::other("fd reported an error condition")));
                        }
                    }
                }
                Err(e) => return Err(AsyncIoError::Io(e)),
            }
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}
