//! The reactor: one poll cycle at a time.
//!
//! Owns the poller, every listener and client, and the routing table
//! that maps CGI pipe descriptors back to the client driving them. All
//! dispatch is single-threaded; a handler runs to completion before
//! the next event is looked at, and events of one poll cycle are fully
//! dispatched before the next cycle begins.

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{info, warn};

use webserv_core::config::ServerConfig;

use crate::client::{Client, ClientUpdate};
use crate::error::EngineError;
use crate::listener::Listener;
use crate::poller::{Interest, Poller, ReadyEvent, Registry};
use crate::reap::ReapQueue;

/// Poll tick while idle; bounds the latency of noticing a shutdown
/// request.
const IDLE_TICK: Duration = Duration::from_millis(500);
/// Poll tick while unreaped children exist, so exits are collected
/// promptly even with no descriptor activity.
const REAP_TICK: Duration = Duration::from_millis(100);

pub struct EventLoop {
    poller: Poller,
    listeners: HashMap<RawFd, (Listener, ServerConfig)>,
    clients: HashMap<RawFd, Client>,
    /// CGI pipe fd to owning client socket fd.
    routes: HashMap<RawFd, RawFd>,
    reaps: ReapQueue,
    events: Vec<ReadyEvent>,
}

impl EventLoop {
    pub fn new() -> Result<Self, EngineError> {
        Ok(EventLoop {
            poller: Poller::new()?,
            listeners: HashMap::new(),
            clients: HashMap::new(),
            routes: HashMap::new(),
            reaps: ReapQueue::new(),
            events: Vec::new(),
        })
    }

    /// Bind one virtual host and start accepting on it. Returns the
    /// bound port, which differs from the requested one only when the
    /// host asked for port 0.
    pub fn add_host(&mut self, mut host: ServerConfig) -> Result<u16, EngineError> {
        let listener = Listener::bind(host.port)?;
        let port = listener.port();
        host.port = port;
        self.poller.register(listener.as_fd(), Interest::READ)?;
        info!(port, server_name = %host.server_name, "listening");
        self.listeners.insert(listener.raw(), (listener, host));
        Ok(port)
    }

    /// Children queued for reaping. Reaches zero once every finished
    /// CGI process has been collected.
    pub fn pending_reaps(&self) -> usize {
        self.reaps.len()
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// One reactor iteration: reap, poll, dispatch.
    pub fn run_once(&mut self, timeout: Option<Duration>) -> Result<(), EngineError> {
        self.reaps.reap();
        let timeout = if self.reaps.is_empty() {
            timeout
        } else {
            Some(timeout.map_or(REAP_TICK, |t| t.min(REAP_TICK)))
        };

        let mut events = std::mem::take(&mut self.events);
        let result = self.poller.poll_into(timeout, &mut events);
        if let Ok(()) = &result {
            for i in 0..events.len() {
                self.dispatch(events[i]);
            }
        }
        self.events = events;
        result
    }

    /// Run until `running` goes false. Only a failing poll exits with
    /// an error; per-connection failures close that connection only.
    pub fn run(&mut self, running: &AtomicBool) -> Result<(), EngineError> {
        while running.load(Ordering::SeqCst) {
            self.run_once(Some(IDLE_TICK))?;
        }
        info!("shutting down");
        self.shutdown();
        Ok(())
    }

    /// Close every connection and collect every outstanding child.
    pub fn shutdown(&mut self) {
        let fds: Vec<RawFd> = self.clients.keys().copied().collect();
        for fd in fds {
            self.remove_client(fd);
        }
        while !self.reaps.is_empty() {
            self.reaps.reap();
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    fn dispatch(&mut self, ev: ReadyEvent) {
        if self.listeners.contains_key(&ev.fd) {
            self.accept_burst(ev.fd);
        } else if self.clients.contains_key(&ev.fd) {
            let update = {
                let client = match self.clients.get_mut(&ev.fd) {
                    Some(c) => c,
                    None => return,
                };
                client.handle_socket_event(ev, &mut self.poller, &mut self.reaps)
            };
            self.apply(ev.fd, update);
        } else if let Some(&client_fd) = self.routes.get(&ev.fd) {
            let update = {
                let client = match self.clients.get_mut(&client_fd) {
                    Some(c) => c,
                    None => return,
                };
                client.handle_cgi_event(ev, &mut self.poller, &mut self.reaps)
            };
            self.apply(client_fd, update);
        }
        // Anything else is a stale fd whose handler went away earlier
        // in this same cycle; skip it.
    }

    fn accept_burst(&mut self, listener_fd: RawFd) {
        loop {
            let accepted = {
                let (listener, _) = match self.listeners.get(&listener_fd) {
                    Some(entry) => entry,
                    None => return,
                };
                listener.accept()
            };
            match accepted {
                Ok(Some((conn, peer))) => {
                    let host = match self.listeners.get(&listener_fd) {
                        Some((_, host)) => host.clone(),
                        None => return,
                    };
                    match Client::accept(conn, peer, host, &mut self.poller) {
                        Ok(client) => {
                            self.clients.insert(client.socket_fd(), client);
                        }
                        Err(e) => warn!(error = %e, "failed to set up accepted connection"),
                    }
                }
                Ok(None) => return,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    return;
                }
            }
        }
    }

    fn apply(&mut self, client_fd: RawFd, update: Result<ClientUpdate, EngineError>) {
        let update = match update {
            Ok(u) => u,
            Err(e) => {
                warn!(fd = client_fd, error = %e, "connection error, closing");
                self.remove_client(client_fd);
                return;
            }
        };
        if let Some((out_fd, in_fd)) = update.spawned {
            self.routes.insert(out_fd, client_fd);
            self.routes.insert(in_fd, client_fd);
        }
        if update.cgi_finished {
            self.routes.retain(|_, owner| *owner != client_fd);
        }
        if update.closed {
            self.routes.retain(|_, owner| *owner != client_fd);
            self.clients.remove(&client_fd);
        }
    }

    fn remove_client(&mut self, client_fd: RawFd) {
        if let Some(mut client) = self.clients.remove(&client_fd) {
            if let Err(e) = client.close(&mut self.poller, &mut self.reaps) {
                warn!(fd = client_fd, error = %e, "error while closing connection");
            }
        }
        self.routes.retain(|_, owner| *owner != client_fd);
    }
}
