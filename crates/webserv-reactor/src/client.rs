//! One accepted connection.
//!
//! The client owns its socket stream, parses the request head out of
//! the inbound bytes, and then either serves a file or wires the body
//! through a CGI process. Responses are close-delimited: no
//! Content-Length, no keep-alive, the connection ends when the
//! response does.

use std::net::IpAddr;
use std::os::unix::io::{OwnedFd, RawFd};

use tracing::{debug, warn};

use webserv_core::config::ServerConfig;
use webserv_core::http::request::{parse_request, ParsedRequest};
use webserv_core::http::response::{FileResponse, Status};

use crate::cgi::{build_env, CgiOutput, CgiProcess};
use crate::error::EngineError;
use crate::poller::{ReadyEvent, Registry};
use crate::reap::ReapQueue;
use crate::stream::{RwStream, StreamEvent};

/// Request heads larger than this are answered 400 and dropped.
const MAX_HEAD: usize = 16 * 1024;

enum ClientState {
    /// Accumulating the request head (and classifying once complete).
    Receiving,
    /// Body flowing to a CGI child, output flowing back.
    Cgi,
    /// Response queued; waiting for the outbound buffer to drain.
    Responding,
}

/// What the event loop must do after a client handled an event.
#[derive(Default)]
pub struct ClientUpdate {
    /// A CGI child was spawned: (stdout-read fd, stdin-write fd) to be
    /// routed back to this client.
    pub spawned: Option<(RawFd, RawFd)>,
    /// The CGI pipes are done; their routes can be dropped.
    pub cgi_finished: bool,
    /// The connection is fully closed; remove the client.
    pub closed: bool,
}

pub struct Client {
    stream: RwStream,
    host: ServerConfig,
    peer: IpAddr,
    state: ClientState,
    inbuf: Vec<u8>,
    cgi: Option<CgiProcess>,
    /// Request-body bytes still expected from the peer.
    body_remaining: usize,
    cgi_status_sent: bool,
    close_when_drained: bool,
    closed: bool,
}

impl Client {
    pub fn accept(
        fd: OwnedFd,
        peer: IpAddr,
        host: ServerConfig,
        registry: &mut dyn Registry,
    ) -> Result<Self, EngineError> {
        let stream = RwStream::socket(fd, registry)?;
        Ok(Client {
            stream,
            host,
            peer,
            state: ClientState::Receiving,
            inbuf: Vec::new(),
            cgi: None,
            body_remaining: 0,
            cgi_status_sent: false,
            close_when_drained: false,
            closed: false,
        })
    }

    pub fn socket_fd(&self) -> RawFd {
        self.stream.read_raw()
    }

    /// Readiness on the connection socket.
    pub fn handle_socket_event(
        &mut self,
        ev: ReadyEvent,
        registry: &mut dyn Registry,
        reaps: &mut ReapQueue,
    ) -> Result<ClientUpdate, EngineError> {
        let mut update = ClientUpdate::default();
        for sev in self.stream.handle_event(ev, registry)? {
            match sev {
                StreamEvent::Data(bytes) => {
                    self.on_data(&bytes, registry, reaps, &mut update)?;
                }
                StreamEvent::ReadEnd => {
                    self.on_peer_eof(registry, reaps, &mut update)?;
                }
                StreamEvent::WriteDrained => {
                    if self.close_when_drained {
                        self.close(registry, reaps)?;
                        update.closed = true;
                    }
                }
            }
            if update.closed {
                break;
            }
        }
        Ok(update)
    }

    /// Readiness on this client's CGI pipes.
    pub fn handle_cgi_event(
        &mut self,
        ev: ReadyEvent,
        registry: &mut dyn Registry,
        reaps: &mut ReapQueue,
    ) -> Result<ClientUpdate, EngineError> {
        let mut update = ClientUpdate::default();
        let outputs = match &mut self.cgi {
            Some(cgi) => cgi.handle_event(ev, registry, reaps)?,
            None => return Ok(update),
        };
        for out in outputs {
            match out {
                CgiOutput::Data(bytes) => {
                    // The script's output is the response entity; only
                    // the status line is ours to add, once.
                    if !self.cgi_status_sent {
                        self.cgi_status_sent = true;
                        self.stream.write(b"HTTP/1.1 200 OK\r\n", registry)?;
                    }
                    self.stream.write(&bytes, registry)?;
                }
                CgiOutput::Eof => {
                    self.cgi = None;
                    update.cgi_finished = true;
                    self.state = ClientState::Responding;
                    self.close_when_drained = true;
                    if self.stream.pending_out() == 0 {
                        // Nothing left to flush (possibly an empty
                        // response from a failed exec).
                        self.close(registry, reaps)?;
                        update.closed = true;
                    }
                }
            }
        }
        Ok(update)
    }

    /// Tear the connection down. Safe to call repeatedly.
    pub fn close(
        &mut self,
        registry: &mut dyn Registry,
        reaps: &mut ReapQueue,
    ) -> Result<(), EngineError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if let Some(mut cgi) = self.cgi.take() {
            cgi.abort(registry, reaps)?;
        }
        self.stream.close(registry)?;
        Ok(())
    }

    // ── Inbound data ─────────────────────────────────────────────────

    fn on_data(
        &mut self,
        bytes: &[u8],
        registry: &mut dyn Registry,
        reaps: &mut ReapQueue,
        update: &mut ClientUpdate,
    ) -> Result<(), EngineError> {
        match self.state {
            ClientState::Receiving => {
                self.inbuf.extend_from_slice(bytes);
                if self.inbuf.len() > MAX_HEAD {
                    self.respond_error(Status::BadRequest, registry)?;
                    return Ok(());
                }
                match parse_request(&self.inbuf) {
                    Ok(None) => {}
                    Ok(Some((request, consumed))) => {
                        self.dispatch(request, consumed, registry, reaps, update)?;
                    }
                    Err(e) => {
                        debug!(peer = %self.peer, error = %e, "rejecting malformed request");
                        self.respond_error(Status::BadRequest, registry)?;
                    }
                }
            }
            ClientState::Cgi => {
                self.forward_body(bytes, registry, reaps)?;
            }
            // Response underway; surplus inbound bytes are discarded.
            ClientState::Responding => {}
        }
        Ok(())
    }

    fn dispatch(
        &mut self,
        request: ParsedRequest,
        consumed: usize,
        registry: &mut dyn Registry,
        reaps: &mut ReapQueue,
        update: &mut ClientUpdate,
    ) -> Result<(), EngineError> {
        let is_cgi = self
            .host
            .matched_location(&request.path)
            .map(|loc| loc.cgi)
            .unwrap_or(false);
        let leftover = self.inbuf.split_off(consumed);
        self.inbuf.clear();

        if !is_cgi {
            debug!(peer = %self.peer, path = %request.path, "serving static");
            let response = FileResponse::resolve(&self.host.root, &request.path);
            self.stream.write(&response.to_bytes(), registry)?;
            self.state = ClientState::Responding;
            self.close_when_drained = true;
            return Ok(());
        }

        let script = self.host.root.join(request.path.trim_start_matches('/'));
        let env = build_env(&request, &self.host, self.peer, &script);
        match CgiProcess::spawn(&script, &env, registry) {
            Ok(cgi) => {
                update.spawned = Some((cgi.output_fd(), cgi.input_fd()));
                self.cgi = Some(cgi);
                self.body_remaining = request.content_length();
                self.state = ClientState::Cgi;
                self.forward_body(&leftover, registry, reaps)?;
            }
            Err(e) => {
                warn!(peer = %self.peer, script = %script.display(), error = %e, "cgi spawn failed");
                self.respond_error(Status::InternalServerError, registry)?;
            }
        }
        Ok(())
    }

    /// Relay request-body bytes into the CGI stdin, clamped to the
    /// declared content length. Trailing surplus is ignored.
    fn forward_body(
        &mut self,
        bytes: &[u8],
        registry: &mut dyn Registry,
        reaps: &mut ReapQueue,
    ) -> Result<(), EngineError> {
        if let Some(cgi) = &mut self.cgi {
            let take = bytes.len().min(self.body_remaining);
            if take > 0 {
                cgi.write(&bytes[..take], registry)?;
                self.body_remaining -= take;
            }
            if self.body_remaining == 0 {
                cgi.end_of_input(registry, reaps)?;
            }
        }
        Ok(())
    }

    fn on_peer_eof(
        &mut self,
        registry: &mut dyn Registry,
        reaps: &mut ReapQueue,
        update: &mut ClientUpdate,
    ) -> Result<(), EngineError> {
        match self.state {
            ClientState::Receiving => {
                // Peer gave up before completing a request.
                self.close(registry, reaps)?;
                update.closed = true;
            }
            ClientState::Cgi => {
                if self.body_remaining > 0 {
                    // Body truncated; the script can never finish its
                    // input, so take it down with the connection.
                    debug!(peer = %self.peer, "peer disconnected mid-body, aborting cgi");
                    self.close(registry, reaps)?;
                    update.closed = true;
                    update.cgi_finished = true;
                }
                // Body complete: keep relaying script output on the
                // still-open write side.
            }
            ClientState::Responding => {
                if self.stream.pending_out() == 0 {
                    self.close(registry, reaps)?;
                    update.closed = true;
                }
                // Otherwise the drain path closes us.
            }
        }
        Ok(())
    }

    fn respond_error(
        &mut self,
        status: Status,
        registry: &mut dyn Registry,
    ) -> Result<(), EngineError> {
        let response = FileResponse::error(status);
        self.stream.write(&response.to_bytes(), registry)?;
        self.state = ClientState::Responding;
        self.close_when_drained = true;
        Ok(())
    }
}
