//! The readiness multiplexer: a thin wrapper around epoll.
//!
//! Everything that registers descriptors goes through the [`Registry`]
//! trait rather than the concrete [`Poller`], so tests can substitute
//! an instrumented fake and account for every register/deregister.

use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};

use crate::error::EngineError;

/// Which readiness kinds a registration asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest {
    pub read: bool,
    pub write: bool,
}

impl Interest {
    pub const READ: Interest = Interest { read: true, write: false };
    pub const WRITE: Interest = Interest { read: false, write: true };
    pub const BOTH: Interest = Interest { read: true, write: true };

    fn flags(&self) -> EpollFlags {
        let mut flags = EpollFlags::empty();
        if self.read {
            flags |= EpollFlags::EPOLLIN;
        }
        if self.write {
            flags |= EpollFlags::EPOLLOUT;
        }
        flags
    }
}

/// One ready descriptor as reported by a poll cycle.
///
/// HUP and ERR conditions are folded into readability: a read on such
/// a descriptor returns 0 or an error, which is exactly how the stream
/// layer learns about them.
#[derive(Debug, Clone, Copy)]
pub struct ReadyEvent {
    pub fd: RawFd,
    pub readable: bool,
    pub writable: bool,
}

/// Registration surface of the multiplexer.
///
/// `register` adds or updates interest for a descriptor; `deregister`
/// removes all interest and is idempotent.
pub trait Registry {
    fn register(&mut self, fd: BorrowedFd<'_>, interest: Interest) -> Result<(), EngineError>;
    fn deregister(&mut self, fd: BorrowedFd<'_>) -> Result<(), EngineError>;
}

/// The concrete epoll-backed multiplexer.
pub struct Poller {
    epoll: Epoll,
    buf: Vec<EpollEvent>,
}

const EVENT_BATCH: usize = 128;

impl Poller {
    pub fn new() -> Result<Self, EngineError> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)
            .map_err(|e| EngineError::Io(e.into()))?;
        Ok(Poller {
            epoll,
            buf: vec![EpollEvent::empty(); EVENT_BATCH],
        })
    }

    /// Block until at least one registered descriptor is ready or the
    /// timeout elapses, and fill `out` with the ready set. `None`
    /// blocks indefinitely. EINTR is reported as an empty cycle.
    pub fn poll_into(
        &mut self,
        timeout: Option<Duration>,
        out: &mut Vec<ReadyEvent>,
    ) -> Result<(), EngineError> {
        out.clear();
        let timeout = match timeout {
            None => EpollTimeout::NONE,
            Some(d) => EpollTimeout::from(d.as_millis().min(u16::MAX as u128) as u16),
        };
        let n = match self.epoll.wait(&mut self.buf, timeout) {
            Ok(n) => n,
            Err(Errno::EINTR) => 0,
            Err(e) => return Err(EngineError::Io(e.into())),
        };
        for ev in &self.buf[..n] {
            let flags = ev.events();
            out.push(ReadyEvent {
                fd: ev.data() as RawFd,
                readable: flags
                    .intersects(EpollFlags::EPOLLIN | EpollFlags::EPOLLHUP | EpollFlags::EPOLLERR),
                writable: flags.intersects(EpollFlags::EPOLLOUT | EpollFlags::EPOLLERR),
            });
        }
        Ok(())
    }
}

impl Registry for Poller {
    fn register(&mut self, fd: BorrowedFd<'_>, interest: Interest) -> Result<(), EngineError> {
        let mut ev = EpollEvent::new(interest.flags(), fd.as_raw_fd() as u64);
        match self.epoll.add(fd, ev) {
            Ok(()) => Ok(()),
            // Already registered: update the interest set instead.
            Err(Errno::EEXIST) => self
                .epoll
                .modify(fd, &mut ev)
                .map_err(|e| registration_error(fd, e)),
            Err(e) => Err(registration_error(fd, e)),
        }
    }

    fn deregister(&mut self, fd: BorrowedFd<'_>) -> Result<(), EngineError> {
        match self.epoll.delete(fd) {
            // Deregistering an unregistered descriptor is a no-op.
            Ok(()) | Err(Errno::ENOENT) | Err(Errno::EBADF) => Ok(()),
            Err(e) => Err(registration_error(fd, e)),
        }
    }
}

fn registration_error(fd: BorrowedFd<'_>, source: Errno) -> EngineError {
    EngineError::Registration {
        fd: fd.as_raw_fd(),
        source,
    }
}

/// Switch a descriptor we are about to pump into non-blocking mode.
pub(crate) fn set_nonblocking(fd: RawFd) -> Result<(), EngineError> {
    // SAFETY: plain fcntl on a descriptor the caller owns.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(EngineError::Io(std::io::Error::last_os_error()));
    }
    let rc = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if rc < 0 {
        return Err(EngineError::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}
