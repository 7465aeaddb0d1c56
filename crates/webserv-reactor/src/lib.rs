//! Readiness-driven HTTP serving core.
//!
//! A single-threaded reactor built directly on epoll: listeners accept
//! connections, each connection is pumped through a non-blocking
//! bidirectional stream, and CGI requests fork a child whose pipes join
//! the same poll set as the sockets. Nothing blocks except the poll
//! call itself; child exits are collected with a non-blocking wait once
//! per iteration.

pub mod cgi;
pub mod client;
pub mod error;
pub mod event_loop;
pub mod listener;
pub mod poller;
pub mod reap;
pub mod stream;

pub use cgi::{build_env, CgiOutput, CgiProcess};
pub use client::{Client, ClientUpdate};
pub use error::EngineError;
pub use event_loop::EventLoop;
pub use listener::Listener;
pub use poller::{Interest, Poller, ReadyEvent, Registry};
pub use reap::ReapQueue;
pub use stream::{RwStream, StreamEvent};
