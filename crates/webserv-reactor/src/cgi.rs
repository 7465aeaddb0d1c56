//! CGI subprocess lifecycle.
//!
//! A `CgiProcess` owns one forked script and the pipe pair that wires
//! the script's stdin/stdout into the event loop. The pipes are driven
//! by the same [`RwStream`] machinery as client sockets; the owning
//! client learns about script output and end-of-stream through the
//! [`CgiOutput`] values returned from `handle_event`.
//!
//! Ownership is strict: a `CgiProcess` cannot be duplicated, and its
//! descriptors are deregistered and closed exactly once on every path
//! out, whether the script finishes or the peer disconnects first.

use std::collections::BTreeMap;
use std::ffi::CString;
use std::net::IpAddr;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;

use nix::fcntl::OFlag;
use nix::sys::signal::{kill, Signal};
use nix::unistd::{pipe2, ForkResult, Pid};
use tracing::debug;

use webserv_core::config::ServerConfig;
use webserv_core::http::request::ParsedRequest;

use crate::error::EngineError;
use crate::poller::{set_nonblocking, ReadyEvent, Registry};
use crate::reap::ReapQueue;
use crate::stream::{RwStream, StreamEvent};

/// What a readiness event on the CGI pipes produced.
#[derive(Debug, PartialEq, Eq)]
pub enum CgiOutput {
    /// Script output bytes, to be relayed to the peer.
    Data(Vec<u8>),
    /// The script closed its stdout. The response body is complete and
    /// the process has been queued for reaping.
    Eof,
}

enum CgiState {
    /// Request body still flowing in both directions.
    Piping,
    /// Input side closed; waiting for the script's stdout to end.
    Draining,
    /// Stdout reached end-of-stream; the process is with the reaper.
    Finished,
}

pub struct CgiProcess {
    pid: Option<Pid>,
    stream: RwStream,
    state: CgiState,
    input_done: bool,
    output_fd: RawFd,
    input_fd: RawFd,
}

impl CgiProcess {
    /// Create the pipes, fork, and exec the script. On return the
    /// parent holds only the two pipe ends it drives; everything the
    /// child needed has been handed over or closed.
    pub fn spawn(
        script: &Path,
        env: &BTreeMap<String, String>,
        registry: &mut dyn Registry,
    ) -> Result<Self, EngineError> {
        // input: us -> script stdin; output: script stdout -> us.
        // O_CLOEXEC keeps the descriptors out of any sibling child.
        let (input_read, input_write) =
            pipe2(OFlag::O_CLOEXEC).map_err(EngineError::PipeCreation)?;
        let (output_read, output_write) =
            pipe2(OFlag::O_CLOEXEC).map_err(EngineError::PipeCreation)?;

        // CString conversion happens before fork: allocating between
        // fork and exec is not async-signal-safe.
        let path_c = cstring_lossy(&script.to_string_lossy());
        let argv = [path_c.clone()];
        let envp: Vec<CString> = env
            .iter()
            .map(|(k, v)| cstring_lossy(&format!("{}={}", k, v)))
            .collect();

        // SAFETY: the child calls only dup2/execve/_exit, all
        // async-signal-safe, before its address space is replaced.
        match unsafe { nix::unistd::fork() }.map_err(EngineError::Spawn)? {
            ForkResult::Child => {
                let ok = unsafe {
                    libc::dup2(input_read.as_raw_fd(), libc::STDIN_FILENO) >= 0
                        && libc::dup2(output_write.as_raw_fd(), libc::STDOUT_FILENO) >= 0
                };
                if ok {
                    // Only returns on failure.
                    let _ = nix::unistd::execve(&path_c, &argv, &envp);
                }
                unsafe { libc::_exit(1) }
            }
            ForkResult::Parent { child } => {
                // Drop the child-side ends; the dup2'd copies live on
                // in the child.
                drop(input_read);
                drop(output_write);

                set_nonblocking(output_read.as_raw_fd())?;
                set_nonblocking(input_write.as_raw_fd())?;
                let output_fd = output_read.as_raw_fd();
                let input_fd = input_write.as_raw_fd();
                let stream = RwStream::pipes(output_read, input_write, registry)?;

                debug!(pid = child.as_raw(), script = %script.display(), "cgi spawned");
                Ok(CgiProcess {
                    pid: Some(child),
                    stream,
                    state: CgiState::Piping,
                    input_done: false,
                    output_fd,
                    input_fd,
                })
            }
        }
    }

    /// Forward request-body bytes to the script's stdin.
    pub fn write(&mut self, bytes: &[u8], registry: &mut dyn Registry) -> Result<(), EngineError> {
        self.stream.write(bytes, registry)
    }

    /// The client has no more body to forward. Closes the script's
    /// stdin once any queued bytes have drained, and queues the pid
    /// for reaping.
    pub fn end_of_input(
        &mut self,
        registry: &mut dyn Registry,
        reaps: &mut ReapQueue,
    ) -> Result<(), EngineError> {
        if self.input_done {
            return Ok(());
        }
        self.input_done = true;
        if self.stream.pending_out() == 0 {
            self.close_input(registry, reaps)?;
        }
        Ok(())
    }

    /// Pump the pipes for one readiness event.
    pub fn handle_event(
        &mut self,
        ev: ReadyEvent,
        registry: &mut dyn Registry,
        reaps: &mut ReapQueue,
    ) -> Result<Vec<CgiOutput>, EngineError> {
        let mut out = Vec::new();
        for sev in self.stream.handle_event(ev, registry)? {
            match sev {
                StreamEvent::Data(bytes) => out.push(CgiOutput::Data(bytes)),
                StreamEvent::ReadEnd => {
                    self.state = CgiState::Finished;
                    // Stdout ended; make sure stdin is closed and the
                    // pid queued even if the client never signalled
                    // end of input.
                    self.input_done = true;
                    self.close_input(registry, reaps)?;
                    out.push(CgiOutput::Eof);
                }
                StreamEvent::WriteDrained => {
                    if self.input_done {
                        self.close_input(registry, reaps)?;
                    }
                }
            }
        }
        Ok(out)
    }

    /// Abort a still-running script: kill it, tear the pipes down, and
    /// queue the pid so the reaper collects the corpse. Idempotent.
    pub fn abort(
        &mut self,
        registry: &mut dyn Registry,
        reaps: &mut ReapQueue,
    ) -> Result<(), EngineError> {
        self.stream.close(registry)?;
        if let Some(pid) = self.pid.take() {
            let _ = kill(pid, Signal::SIGKILL);
            reaps.push(pid);
        }
        self.state = CgiState::Finished;
        Ok(())
    }

    pub fn output_fd(&self) -> RawFd {
        self.output_fd
    }

    pub fn input_fd(&self) -> RawFd {
        self.input_fd
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.state, CgiState::Finished)
    }

    fn close_input(
        &mut self,
        registry: &mut dyn Registry,
        reaps: &mut ReapQueue,
    ) -> Result<(), EngineError> {
        if self.stream.write_open() {
            self.stream.close_write(registry)?;
            if !matches!(self.state, CgiState::Finished) {
                self.state = CgiState::Draining;
            }
            // Stdin closed: the script will now run to completion, so
            // this is the moment its pid joins the reap queue.
            if let Some(pid) = self.pid.take() {
                reaps.push(pid);
            }
        }
        Ok(())
    }
}

fn cstring_lossy(s: &str) -> CString {
    // Interior NUL cannot appear in paths or header values that made
    // it through the parser; truncate defensively if it somehow does.
    match CString::new(s) {
        Ok(c) => c,
        Err(e) => {
            let pos = e.nul_position();
            let mut bytes = e.into_vec();
            bytes.truncate(pos);
            // Truncation removed the NUL, so this cannot fail.
            CString::new(bytes).unwrap_or_default()
        }
    }
}

/// Build the CGI/1.1 environment for one request.
///
/// `CONTENT_LENGTH` and `CONTENT_TYPE` appear if and only if the
/// request carries a body; `UPLOAD_PATH` appears if and only if the
/// matched location defines an upload directory.
pub fn build_env(
    request: &ParsedRequest,
    host: &ServerConfig,
    remote_addr: IpAddr,
    script_path: &Path,
) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    env.insert(
        "AUTH_TYPE".to_string(),
        request.auth_scheme().unwrap_or_default().to_string(),
    );
    if request.has_body() {
        env.insert(
            "CONTENT_LENGTH".to_string(),
            request.header("content-length").unwrap_or_default().to_string(),
        );
        env.insert(
            "CONTENT_TYPE".to_string(),
            request.header("content-type").unwrap_or_default().to_string(),
        );
    }
    env.insert("GATEWAY_INTERFACE".to_string(), "CGI/1.1".to_string());
    env.insert("PATH_INFO".to_string(), request.path.as_str().to_string());
    env.insert(
        "PATH_TRANSLATED".to_string(),
        script_path.to_string_lossy().into_owned(),
    );
    env.insert("QUERY_STRING".to_string(), request.query_string.clone());
    env.insert("REMOTE_ADDR".to_string(), remote_addr.to_string());
    env.insert("REMOTE_HOST".to_string(), remote_addr.to_string());
    // Ident lookup (RFC 1413) is deliberately not implemented.
    env.insert("REMOTE_IDENT".to_string(), String::new());
    env.insert(
        "REQUEST_METHOD".to_string(),
        request.method.as_str().to_string(),
    );
    env.insert("SCRIPT_NAME".to_string(), request.path.as_str().to_string());
    env.insert("SERVER_NAME".to_string(), host.server_name.clone());
    env.insert("SERVER_PORT".to_string(), host.port.to_string());
    env.insert(
        "SERVER_PROTOCOL".to_string(),
        request.version.clone(),
    );
    env.insert("SERVER_SOFTWARE".to_string(), "Webserv/1.0".to_string());
    if let Some(loc) = host.matched_location(request.path.as_str()) {
        if let Some(upload) = &loc.upload_dir {
            env.insert(
                "UPLOAD_PATH".to_string(),
                host.root.join(upload).to_string_lossy().into_owned(),
            );
        }
    }
    env
}

#[cfg(test)]
mod tests {
    use super::*;
    use webserv_core::config::{Config, Location};
    use webserv_core::http::request::parse_request;

    fn host_with_location(upload: Option<&str>) -> ServerConfig {
        let mut host = Config::single_port(8080).servers.remove(0);
        host.locations.push(Location {
            path: "/cgi-bin".to_string(),
            cgi: true,
            upload_dir: upload.map(str::to_string),
        });
        host
    }

    fn parsed(raw: &[u8]) -> ParsedRequest {
        parse_request(raw).unwrap().unwrap().0
    }

    #[test]
    fn body_headers_present_iff_body() {
        let host = host_with_location(None);
        let addr: IpAddr = "127.0.0.1".parse().unwrap();
        let script = Path::new("/srv/www/cgi-bin/echo.py");

        let get = parsed(b"GET /cgi-bin/echo.py HTTP/1.1\r\nHost: x\r\n\r\n");
        let env = build_env(&get, &host, addr, script);
        assert!(!env.contains_key("CONTENT_LENGTH"));
        assert!(!env.contains_key("CONTENT_TYPE"));

        let post = parsed(
            b"POST /cgi-bin/echo.py HTTP/1.1\r\nHost: x\r\nContent-Length: 4\r\nContent-Type: text/plain\r\n\r\n",
        );
        let env = build_env(&post, &host, addr, script);
        assert_eq!(env.get("CONTENT_LENGTH").map(String::as_str), Some("4"));
        assert_eq!(env.get("CONTENT_TYPE").map(String::as_str), Some("text/plain"));
    }

    #[test]
    fn upload_path_present_iff_configured() {
        let addr: IpAddr = "127.0.0.1".parse().unwrap();
        let script = Path::new("/srv/www/cgi-bin/up.py");
        let req = parsed(b"GET /cgi-bin/up.py HTTP/1.1\r\nHost: x\r\n\r\n");

        let env = build_env(&req, &host_with_location(None), addr, script);
        assert!(!env.contains_key("UPLOAD_PATH"));

        let env = build_env(&req, &host_with_location(Some("uploads")), addr, script);
        assert_eq!(
            env.get("UPLOAD_PATH").map(String::as_str),
            Some("./www/uploads")
        );
    }

    #[test]
    fn fixed_variables() {
        let host = host_with_location(None);
        let addr: IpAddr = "10.0.0.7".parse().unwrap();
        let script = Path::new("/srv/www/cgi-bin/q.py");
        let req = parsed(b"GET /cgi-bin/q.py?a=1&b=2 HTTP/1.1\r\nHost: x\r\n\r\n");
        let env = build_env(&req, &host, addr, script);

        assert_eq!(env.get("GATEWAY_INTERFACE").map(String::as_str), Some("CGI/1.1"));
        assert_eq!(env.get("SERVER_SOFTWARE").map(String::as_str), Some("Webserv/1.0"));
        assert_eq!(env.get("REMOTE_IDENT").map(String::as_str), Some(""));
        assert_eq!(env.get("REMOTE_ADDR").map(String::as_str), Some("10.0.0.7"));
        assert_eq!(env.get("QUERY_STRING").map(String::as_str), Some("a=1&b=2"));
        assert_eq!(env.get("SCRIPT_NAME").map(String::as_str), Some("/cgi-bin/q.py"));
        assert_eq!(env.get("PATH_TRANSLATED").map(String::as_str), Some("/srv/www/cgi-bin/q.py"));
        assert_eq!(env.get("REQUEST_METHOD").map(String::as_str), Some("GET"));
        assert_eq!(env.get("SERVER_PORT").map(String::as_str), Some("8080"));
        assert_eq!(env.get("SERVER_PROTOCOL").map(String::as_str), Some("HTTP/1.1"));
    }
}
