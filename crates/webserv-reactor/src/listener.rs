//! Listening sockets.
//!
//! One `Listener` per virtual host. The socket is created non-blocking
//! and close-on-exec from the start so accepted descriptors never leak
//! into forked CGI children, and `accept` drains until EAGAIN so a
//! level-triggered poller never starves a burst of connections.

use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use crate::error::EngineError;

#[derive(Debug)]
pub struct Listener {
    fd: OwnedFd,
    port: u16,
}

impl Listener {
    /// Bind `0.0.0.0:port` and start listening. Port 0 asks the kernel
    /// for an ephemeral port; `local_port` reports what was assigned.
    pub fn bind(port: u16) -> Result<Self, EngineError> {
        // SAFETY: plain socket syscalls; the raw fd is wrapped in an
        // OwnedFd immediately so every early return closes it.
        unsafe {
            let raw = libc::socket(
                libc::AF_INET,
                libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                0,
            );
            if raw < 0 {
                return Err(bind_error(port));
            }
            let fd = OwnedFd::from_raw_fd(raw);

            let one: libc::c_int = 1;
            if libc::setsockopt(
                raw,
                libc::SOL_SOCKET,
                libc::SO_REUSEADDR,
                &one as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            ) < 0
            {
                return Err(bind_error(port));
            }

            let mut addr: libc::sockaddr_in = std::mem::zeroed();
            addr.sin_family = libc::AF_INET as libc::sa_family_t;
            addr.sin_port = port.to_be();
            addr.sin_addr.s_addr = libc::INADDR_ANY.to_be();
            if libc::bind(
                raw,
                &addr as *const _ as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            ) < 0
            {
                return Err(bind_error(port));
            }
            if libc::listen(raw, 128) < 0 {
                return Err(bind_error(port));
            }

            let bound = local_port(raw).ok_or_else(|| bind_error(port))?;
            Ok(Listener { fd, port: bound })
        }
    }

    pub fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }

    pub fn raw(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// The port actually bound. Differs from the requested port only
    /// when 0 was requested.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Accept one pending connection. `Ok(None)` means the backlog is
    /// empty; the caller loops until it sees that.
    pub fn accept(&self) -> Result<Option<(OwnedFd, IpAddr)>, EngineError> {
        let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        // SAFETY: addr/len describe a valid sockaddr_in buffer.
        let raw = unsafe {
            libc::accept4(
                self.fd.as_raw_fd(),
                &mut addr as *mut _ as *mut libc::sockaddr,
                &mut len,
                libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            )
        };
        if raw < 0 {
            let err = io::Error::last_os_error();
            return match err.kind() {
                io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => Ok(None),
                _ => Err(EngineError::Io(err)),
            };
        }
        // SAFETY: accept4 returned a fresh descriptor we now own.
        let conn = unsafe { OwnedFd::from_raw_fd(raw) };
        let peer = IpAddr::V4(Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr)));
        Ok(Some((conn, peer)))
    }
}

fn bind_error(port: u16) -> EngineError {
    EngineError::Bind {
        port,
        source: io::Error::last_os_error(),
    }
}

fn local_port(raw: RawFd) -> Option<u16> {
    let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    // SAFETY: addr/len describe a valid sockaddr_in buffer.
    let rc = unsafe {
        libc::getsockname(
            raw,
            &mut addr as *mut _ as *mut libc::sockaddr,
            &mut len,
        )
    };
    if rc < 0 {
        return None;
    }
    Some(u16::from_be(addr.sin_port))
}
