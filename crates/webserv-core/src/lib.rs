//! # webserv-core
//!
//! The platform-agnostic half of webserv: HTTP request parsing, static
//! file responses, and the server configuration model. Nothing in here
//! touches a file descriptor; the reactor crate consumes these types.

pub mod config;
pub mod http;

pub use config::{Config, ConfigError, Location, ServerConfig};
pub use http::request::{parse_request, Method, ParseError, ParsedRequest};
pub use http::response::{FileResponse, Status};
