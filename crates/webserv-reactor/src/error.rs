//! Error taxonomy of the reactor.
//!
//! Severity is encoded by where an error is handled, not by the type:
//! `Bind` kills one virtual host, `PipeCreation`/`Spawn` kill one CGI
//! invocation, `Io` kills one connection. Only a failing `poll` brings
//! the loop down.

use std::error::Error;
use std::fmt;
use std::io;
use std::os::unix::io::RawFd;

use nix::errno::Errno;

#[derive(Debug)]
pub enum EngineError {
    /// Invalid descriptor handed to the multiplexer. Programming
    /// error; must not occur in correct use.
    Registration { fd: RawFd, source: Errno },
    /// Address unavailable. Fatal to one virtual host only.
    Bind { port: u16, source: io::Error },
    /// `pipe()` failed; the CGI invocation is aborted.
    PipeCreation(Errno),
    /// `fork()` failed; the CGI invocation is aborted.
    Spawn(Errno),
    /// Per-connection I/O failure; closes that connection.
    Io(io::Error),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Registration { fd, source } => {
                write!(f, "cannot register fd {} with the multiplexer: {}", fd, source)
            }
            EngineError::Bind { port, source } => {
                write!(f, "cannot bind port {}: {}", port, source)
            }
            EngineError::PipeCreation(e) => write!(f, "pipe creation failed: {}", e),
            EngineError::Spawn(e) => write!(f, "fork failed: {}", e),
            EngineError::Io(e) => write!(f, "i/o error: {}", e),
        }
    }
}

impl Error for EngineError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            EngineError::Registration { source, .. } => Some(source),
            EngineError::Bind { source, .. } => Some(source),
            EngineError::PipeCreation(e) | EngineError::Spawn(e) => Some(e),
            EngineError::Io(e) => Some(e),
        }
    }
}

impl From<io::Error> for EngineError {
    fn from(e: io::Error) -> Self {
        EngineError::Io(e)
    }
}
