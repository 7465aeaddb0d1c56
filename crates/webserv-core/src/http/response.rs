//! Static file responses.
//!
//! Framing is the bare minimum the protocol allows: status line,
//! `Content-Type`, blank line, body. No Content-Length — the connection
//! close delimits the body.

use std::fmt;
use std::fs;
use std::path::{Component, Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    Created,
    NoContent,
    BadRequest,
    NotFound,
    MethodNotAllowed,
    InternalServerError,
}

impl Status {
    pub fn code(&self) -> u16 {
        match self {
            Status::Ok => 200,
            Status::Created => 201,
            Status::NoContent => 204,
            Status::BadRequest => 400,
            Status::NotFound => 404,
            Status::MethodNotAllowed => 405,
            Status::InternalServerError => 500,
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            Status::Ok => "OK",
            Status::Created => "Created",
            Status::NoContent => "No Content",
            Status::BadRequest => "Bad Request",
            Status::NotFound => "Not Found",
            Status::MethodNotAllowed => "Method Not Allowed",
            Status::InternalServerError => "Internal Server Error",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code(), self.reason())
    }
}

/// A fully materialised static response.
#[derive(Debug, Clone)]
pub struct FileResponse {
    pub status: Status,
    pub content_type: &'static str,
    pub body: Vec<u8>,
}

impl FileResponse {
    /// Resolve `request_path` under `root`.
    ///
    /// `/` serves `index.html`; anything unreadable (including `..`
    /// traversal attempts) serves the document root's `notfound.html`
    /// as a 404, falling back to a built-in body when even that file
    /// is missing.
    pub fn resolve(root: &Path, request_path: &str) -> Self {
        if contains_traversal(request_path) {
            return Self::not_found(root);
        }

        let rel = if request_path == "/" {
            "index.html"
        } else {
            request_path.trim_start_matches('/')
        };
        let full: PathBuf = root.join(rel);

        match fs::read(&full) {
            Ok(body) => FileResponse {
                status: Status::Ok,
                content_type: content_type_for(&full),
                body,
            },
            Err(_) => Self::not_found(root),
        }
    }

    fn not_found(root: &Path) -> Self {
        let body = fs::read(root.join("notfound.html"))
            .unwrap_or_else(|_| b"<html><body><h1>404 Not Found</h1></body></html>".to_vec());
        FileResponse {
            status: Status::NotFound,
            content_type: "text/html",
            body,
        }
    }

    /// Minimal failure response used for 400/500 paths (parse errors,
    /// CGI spawn failures).
    pub fn error(status: Status) -> Self {
        let body = format!(
            "<html><body><h1>{} {}</h1></body></html>",
            status.code(),
            status.reason()
        )
        .into_bytes();
        FileResponse {
            status,
            content_type: "text/html",
            body,
        }
    }

    /// Serialise to wire bytes: status line, Content-Type, blank line, body.
    pub fn to_bytes(&self) -> Vec<u8> {
        let head = format!(
            "HTTP/1.1 {} {}\r\nContent-Type: {}\r\n\r\n",
            self.status.code(),
            self.status.reason(),
            self.content_type
        );
        let mut out = head.into_bytes();
        out.extend_from_slice(&self.body);
        out
    }
}

fn contains_traversal(path: &str) -> bool {
    Path::new(path)
        .components()
        .any(|c| matches!(c, Component::ParentDir))
}

fn content_type_for(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("html") | Some("htm") => "text/html",
        Some("css") => "text/css",
        Some("js") => "application/javascript",
        Some("json") => "application/json",
        Some("txt") => "text/plain",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("svg") => "image/svg+xml",
        _ => "application/octet-stream",
    }
}
