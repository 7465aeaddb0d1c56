//! The non-blocking bidirectional byte pump.
//!
//! One `RwStream` serves both shapes of endpoint: a socket, where the
//! read and write descriptor are the same fd, and a CGI pipe pair,
//! where they differ. The owner learns what happened through the
//! [`StreamEvent`]s returned from `handle_event` — data arrived, the
//! read side reached end-of-stream, or the pending output drained.
//!
//! Per readiness event the stream performs at most one read and one
//! write syscall; level-triggered epoll re-reports anything left over.
//! Write interest is armed only while output is pending, so an idle
//! connection never spins on EPOLLOUT.

use std::io;
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};

use crate::error::EngineError;
use crate::poller::{Interest, ReadyEvent, Registry};

const READ_CHUNK: usize = 4096;

/// What a readiness event produced, in the order it happened.
#[derive(Debug, PartialEq, Eq)]
pub enum StreamEvent {
    /// One chunk read from the stream.
    Data(Vec<u8>),
    /// The read side reached end-of-stream. Reported exactly once; the
    /// read descriptor has been deregistered and closed by the time the
    /// owner sees this.
    ReadEnd,
    /// The pending output buffer emptied. The owner may now close the
    /// write side if it has nothing further to send.
    WriteDrained,
}

/// The descriptor(s) behind a stream.
///
/// `Socket` holds one fd used for both directions and closed only when
/// both are done; `Pipes` holds two independently closable fds.
enum Endpoints {
    Socket { fd: Option<OwnedFd> },
    Pipes {
        read: Option<OwnedFd>,
        write: Option<OwnedFd>,
    },
}

pub struct RwStream {
    endpoints: Endpoints,
    read_fd: RawFd,
    write_fd: RawFd,
    out: Vec<u8>,
    out_pos: usize,
    read_closed: bool,
    write_closed: bool,
    read_scratch: Box<[u8; READ_CHUNK]>,
}

impl RwStream {
    /// Stream over a single socket descriptor. Registers read interest.
    pub fn socket(fd: OwnedFd, registry: &mut dyn Registry) -> Result<Self, EngineError> {
        let raw = fd.as_raw_fd();
        registry.register(fd.as_fd(), Interest::READ)?;
        Ok(RwStream {
            endpoints: Endpoints::Socket { fd: Some(fd) },
            read_fd: raw,
            write_fd: raw,
            out: Vec::new(),
            out_pos: 0,
            read_closed: false,
            write_closed: false,
            read_scratch: Box::new([0u8; READ_CHUNK]),
        })
    }

    /// Stream over a pipe pair (CGI: script stdout to read, script
    /// stdin to write). Registers read interest on the read end; the
    /// write end is registered lazily when output is queued.
    pub fn pipes(
        read: OwnedFd,
        write: OwnedFd,
        registry: &mut dyn Registry,
    ) -> Result<Self, EngineError> {
        let read_raw = read.as_raw_fd();
        let write_raw = write.as_raw_fd();
        registry.register(read.as_fd(), Interest::READ)?;
        Ok(RwStream {
            endpoints: Endpoints::Pipes {
                read: Some(read),
                write: Some(write),
            },
            read_fd: read_raw,
            write_fd: write_raw,
            out: Vec::new(),
            out_pos: 0,
            read_closed: false,
            write_closed: false,
            read_scratch: Box::new([0u8; READ_CHUNK]),
        })
    }

    pub fn read_raw(&self) -> RawFd {
        self.read_fd
    }

    pub fn write_raw(&self) -> RawFd {
        self.write_fd
    }

    pub fn pending_out(&self) -> usize {
        self.out.len() - self.out_pos
    }

    pub fn read_open(&self) -> bool {
        !self.read_closed
    }

    pub fn write_open(&self) -> bool {
        !self.write_closed
    }

    /// Queue bytes for asynchronous delivery. Never blocks; the actual
    /// write happens on the next write-readiness event.
    pub fn write(&mut self, bytes: &[u8], registry: &mut dyn Registry) -> Result<(), EngineError> {
        if self.write_closed || bytes.is_empty() {
            return Ok(());
        }
        self.out.extend_from_slice(bytes);
        self.arm_write(registry)
    }

    /// Pump the stream for one readiness event. Returns the owner
    /// notifications in the order they occurred.
    pub fn handle_event(
        &mut self,
        ev: ReadyEvent,
        registry: &mut dyn Registry,
    ) -> Result<Vec<StreamEvent>, EngineError> {
        let mut events = Vec::new();

        if ev.readable && ev.fd == self.read_fd && !self.read_closed {
            match self.read_once()? {
                Some(0) => {
                    self.close_read(registry)?;
                    events.push(StreamEvent::ReadEnd);
                }
                Some(n) => {
                    events.push(StreamEvent::Data(self.read_scratch[..n].to_vec()));
                }
                None => {}
            }
        }

        if ev.writable && ev.fd == self.write_fd && !self.write_closed && self.pending_out() > 0 {
            if self.write_once()? {
                self.disarm_write(registry)?;
                events.push(StreamEvent::WriteDrained);
            }
        }

        Ok(events)
    }

    /// Close and deregister the write side. Used by the CGI owner to
    /// signal end of input to the script. No-op when already closed.
    pub fn close_write(&mut self, registry: &mut dyn Registry) -> Result<(), EngineError> {
        if self.write_closed {
            return Ok(());
        }
        self.write_closed = true;
        self.out.clear();
        self.out_pos = 0;
        match &mut self.endpoints {
            Endpoints::Socket { fd } => {
                if let Some(owned) = fd {
                    registry.deregister(owned.as_fd())?;
                    if self.read_closed {
                        *fd = None;
                    } else {
                        // Read side still live: re-arm read interest only.
                        registry.register(owned.as_fd(), Interest::READ)?;
                    }
                }
            }
            Endpoints::Pipes { write, .. } => {
                if let Some(owned) = write.take() {
                    registry.deregister(owned.as_fd())?;
                }
            }
        }
        Ok(())
    }

    /// Full teardown: deregister then close whatever is still open.
    /// Safe to call any number of times.
    pub fn close(&mut self, registry: &mut dyn Registry) -> Result<(), EngineError> {
        self.read_closed = true;
        self.write_closed = true;
        self.out.clear();
        self.out_pos = 0;
        match &mut self.endpoints {
            Endpoints::Socket { fd } => {
                if let Some(owned) = fd.take() {
                    registry.deregister(owned.as_fd())?;
                }
            }
            Endpoints::Pipes { read, write } => {
                if let Some(owned) = read.take() {
                    registry.deregister(owned.as_fd())?;
                }
                if let Some(owned) = write.take() {
                    registry.deregister(owned.as_fd())?;
                }
            }
        }
        Ok(())
    }

    // ── Internals ────────────────────────────────────────────────────

    fn write_fd_borrowed(&self) -> Option<BorrowedFd<'_>> {
        match &self.endpoints {
            Endpoints::Socket { fd } => fd.as_ref().map(|f| f.as_fd()),
            Endpoints::Pipes { write, .. } => write.as_ref().map(|f| f.as_fd()),
        }
    }

    /// One non-blocking read. `Some(0)` is end-of-stream, `None` means
    /// the descriptor was not actually ready (EAGAIN/EINTR).
    fn read_once(&mut self) -> Result<Option<usize>, EngineError> {
        // SAFETY: read_fd is open while !read_closed; buffer is owned.
        let n = unsafe {
            libc::read(
                self.read_fd,
                self.read_scratch.as_mut_ptr() as *mut libc::c_void,
                READ_CHUNK,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            return match err.kind() {
                io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => Ok(None),
                _ => Err(EngineError::Io(err)),
            };
        }
        Ok(Some(n as usize))
    }

    /// One non-blocking write of the pending buffer's head. Returns
    /// true when the buffer emptied.
    fn write_once(&mut self) -> Result<bool, EngineError> {
        let chunk = &self.out[self.out_pos..];
        // SAFETY: write_fd is open while !write_closed.
        let n = unsafe {
            libc::write(
                self.write_fd,
                chunk.as_ptr() as *const libc::c_void,
                chunk.len(),
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            return match err.kind() {
                io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => Ok(false),
                _ => Err(EngineError::Io(err)),
            };
        }
        self.out_pos += n as usize;
        if self.out_pos == self.out.len() {
            self.out.clear();
            self.out_pos = 0;
            return Ok(true);
        }
        Ok(false)
    }

    fn close_read(&mut self, registry: &mut dyn Registry) -> Result<(), EngineError> {
        self.read_closed = true;
        let pending = self.pending_out();
        match &mut self.endpoints {
            Endpoints::Socket { fd } => {
                if self.write_closed {
                    // Both directions done: deregister and close the fd.
                    if let Some(owned) = fd.take() {
                        registry.deregister(owned.as_fd())?;
                    }
                } else if let Some(owned) = fd.as_ref() {
                    if pending > 0 {
                        // Output still pending: keep write interest only.
                        registry.register(owned.as_fd(), Interest::WRITE)?;
                    } else {
                        // Idle until the owner queues output; write()
                        // re-arms interest then. The fd stays open for
                        // the write side.
                        registry.deregister(owned.as_fd())?;
                    }
                }
            }
            Endpoints::Pipes { read, .. } => {
                if let Some(owned) = read.take() {
                    registry.deregister(owned.as_fd())?;
                }
            }
        }
        Ok(())
    }

    fn arm_write(&mut self, registry: &mut dyn Registry) -> Result<(), EngineError> {
        match &self.endpoints {
            Endpoints::Socket { .. } => {
                let interest = if self.read_closed { Interest::WRITE } else { Interest::BOTH };
                if let Some(fd) = self.write_fd_borrowed() {
                    registry.register(fd, interest)?;
                }
            }
            Endpoints::Pipes { .. } => {
                if let Some(fd) = self.write_fd_borrowed() {
                    registry.register(fd, Interest::WRITE)?;
                }
            }
        }
        Ok(())
    }

    fn disarm_write(&mut self, registry: &mut dyn Registry) -> Result<(), EngineError> {
        match &self.endpoints {
            Endpoints::Socket { .. } => {
                if let Some(fd) = self.write_fd_borrowed() {
                    if self.read_closed {
                        registry.deregister(fd)?;
                    } else {
                        registry.register(fd, Interest::READ)?;
                    }
                }
            }
            Endpoints::Pipes { .. } => {
                if let Some(fd) = self.write_fd_borrowed() {
                    registry.deregister(fd)?;
                }
            }
        }
        Ok(())
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::poller::Poller;
    use nix::fcntl::OFlag;
    use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
    use nix::unistd::pipe2;
    use std::collections::HashMap;
    use std::time::Duration;

    /// The instrumented fake multiplexer: counts register/deregister
    /// calls per descriptor and never touches the OS.
    #[derive(Default)]
    struct CountingRegistry {
        registers: HashMap<RawFd, usize>,
        deregisters: HashMap<RawFd, usize>,
    }

    impl Registry for CountingRegistry {
        fn register(&mut self, fd: BorrowedFd<'_>, _interest: Interest) -> Result<(), EngineError> {
            *self.registers.entry(fd.as_raw_fd()).or_insert(0) += 1;
            Ok(())
        }

        fn deregister(&mut self, fd: BorrowedFd<'_>) -> Result<(), EngineError> {
            *self.deregisters.entry(fd.as_raw_fd()).or_insert(0) += 1;
            Ok(())
        }
    }

    fn nonblocking_socketpair() -> (OwnedFd, OwnedFd) {
        socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
        )
        .unwrap()
    }

    fn read_some(fd: RawFd, buf: &mut [u8]) -> isize {
        // SAFETY: fd is a live descriptor owned by the test.
        unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) }
    }

    fn write_some(fd: RawFd, buf: &[u8]) -> isize {
        // SAFETY: fd is a live descriptor owned by the test.
        unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) }
    }

    #[test]
    fn round_trip_across_partial_writes() {
        let mut poller = Poller::new().unwrap();
        let (ours, theirs) = nonblocking_socketpair();
        let theirs_raw = theirs.as_raw_fd();
        let mut stream = RwStream::socket(ours, &mut poller).unwrap();

        // Large enough to exceed the socket buffer, forcing delivery
        // to split across many write-readiness events.
        let payload: Vec<u8> = (0..1_000_000u32).map(|i| (i % 251) as u8).collect();
        stream.write(&payload, &mut poller).unwrap();

        let mut received = Vec::new();
        let mut drained = false;
        let mut scratch = [0u8; 65536];
        let mut events = Vec::new();
        for _ in 0..10_000 {
            poller
                .poll_into(Some(Duration::from_millis(10)), &mut events)
                .unwrap();
            let batch: Vec<ReadyEvent> = events.clone();
            for ev in batch {
                if ev.fd == stream.write_raw() {
                    for sev in stream.handle_event(ev, &mut poller).unwrap() {
                        if sev == StreamEvent::WriteDrained {
                            drained = true;
                        }
                    }
                }
            }
            loop {
                let n = read_some(theirs_raw, &mut scratch);
                if n <= 0 {
                    break;
                }
                received.extend_from_slice(&scratch[..n as usize]);
            }
            if drained && received.len() == payload.len() {
                break;
            }
        }

        assert!(drained, "pending output never drained");
        assert_eq!(received.len(), payload.len());
        assert_eq!(received, payload, "byte order or content corrupted");
    }

    #[test]
    fn read_end_reported_once_on_pipe_eof() {
        let mut poller = Poller::new().unwrap();
        let (pipe_read, pipe_write) = pipe2(OFlag::O_NONBLOCK | OFlag::O_CLOEXEC).unwrap();
        let (_unused_read, stdin_write) = pipe2(OFlag::O_NONBLOCK | OFlag::O_CLOEXEC).unwrap();
        let mut stream = RwStream::pipes(pipe_read, stdin_write, &mut poller).unwrap();

        write_some(pipe_write.as_raw_fd(), b"out");
        drop(pipe_write);

        let mut data = Vec::new();
        let mut read_ends = 0;
        let mut events = Vec::new();
        for _ in 0..100 {
            poller
                .poll_into(Some(Duration::from_millis(10)), &mut events)
                .unwrap();
            let batch: Vec<ReadyEvent> = events.clone();
            for ev in batch {
                for sev in stream.handle_event(ev, &mut poller).unwrap() {
                    match sev {
                        StreamEvent::Data(bytes) => data.extend_from_slice(&bytes),
                        StreamEvent::ReadEnd => read_ends += 1,
                        StreamEvent::WriteDrained => {}
                    }
                }
            }
            if read_ends > 0 {
                break;
            }
        }

        assert_eq!(data, b"out");
        assert_eq!(read_ends, 1);
        assert!(!stream.read_open());
        assert!(stream.write_open());
    }

    #[test]
    fn write_after_close_write_is_dropped() {
        let mut registry = CountingRegistry::default();
        let (read_end, write_end) = pipe2(OFlag::O_NONBLOCK | OFlag::O_CLOEXEC).unwrap();
        let mut stream = RwStream::pipes(read_end, write_end, &mut registry).unwrap();

        stream.close_write(&mut registry).unwrap();
        stream.write(b"late", &mut registry).unwrap();
        assert_eq!(stream.pending_out(), 0);
    }

    #[test]
    fn close_is_idempotent_and_balanced() {
        let mut registry = CountingRegistry::default();
        let (read_end, write_end) = pipe2(OFlag::O_NONBLOCK | OFlag::O_CLOEXEC).unwrap();
        let read_raw = read_end.as_raw_fd();
        let write_raw = write_end.as_raw_fd();
        let mut stream = RwStream::pipes(read_end, write_end, &mut registry).unwrap();
        stream.write(b"pending", &mut registry).unwrap();

        stream.close(&mut registry).unwrap();
        stream.close(&mut registry).unwrap();
        stream.close(&mut registry).unwrap();

        // Each descriptor deregistered exactly once despite repeated closes.
        assert_eq!(registry.deregisters.get(&read_raw), Some(&1));
        assert_eq!(registry.deregisters.get(&write_raw), Some(&1));
        assert!(!stream.read_open());
        assert!(!stream.write_open());
    }

    #[test]
    fn socket_fd_closes_once_when_both_sides_done() {
        let mut registry = CountingRegistry::default();
        let (ours, _theirs) = nonblocking_socketpair();
        let raw = ours.as_raw_fd();
        let mut stream = RwStream::socket(ours, &mut registry).unwrap();

        stream.close(&mut registry).unwrap();
        stream.close(&mut registry).unwrap();

        assert_eq!(registry.deregisters.get(&raw), Some(&1));
    }
}
