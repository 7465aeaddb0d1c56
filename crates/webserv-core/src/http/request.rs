//! Incremental HTTP/1.x request-head parsing.
//!
//! The parser completes as soon as the blank line after the headers has
//! arrived. It deliberately does not buffer the body: for CGI requests
//! the connection streams body bytes straight into the script's stdin,
//! so holding the body here would just duplicate it.

use std::collections::HashMap;
use std::error::Error;
use std::fmt;

/// HTTP request methods, including the ones we only ever answer 405 to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
    Head,
    Connect,
    Options,
    Trace,
    Patch,
}

impl Method {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "GET" => Some(Method::Get),
            "POST" => Some(Method::Post),
            "PUT" => Some(Method::Put),
            "DELETE" => Some(Method::Delete),
            "HEAD" => Some(Method::Head),
            "CONNECT" => Some(Method::Connect),
            "OPTIONS" => Some(Method::Options),
            "TRACE" => Some(Method::Trace),
            "PATCH" => Some(Method::Patch),
            _ => None,
        }
    }

    /// Canonical wire spelling, used for the CGI `REQUEST_METHOD` variable.
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Head => "HEAD",
            Method::Connect => "CONNECT",
            Method::Options => "OPTIONS",
            Method::Trace => "TRACE",
            Method::Patch => "PATCH",
        }
    }
}

/// A parsed request head.
///
/// Header names are lower-cased on insert so lookups are
/// case-insensitive without per-call normalisation.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedRequest {
    pub method: Method,
    /// Raw request target as it appeared on the wire.
    pub target: String,
    /// Target with any query string stripped.
    pub path: String,
    /// Everything after the first `?`, or empty.
    pub query_string: String,
    pub version: String,
    headers: HashMap<String, String>,
}

impl ParsedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(|v| v.as_str())
    }

    pub fn has_header(&self, name: &str) -> bool {
        self.headers.contains_key(&name.to_ascii_lowercase())
    }

    /// Declared body length; 0 when absent or unparseable.
    pub fn content_length(&self) -> usize {
        self.header("content-length")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    /// Whether the request carries a body. The CGI environment only
    /// gets CONTENT_LENGTH/CONTENT_TYPE when this is true.
    pub fn has_body(&self) -> bool {
        self.content_length() > 0
    }

    /// Scheme token of the Authorization header, for CGI's AUTH_TYPE.
    pub fn auth_scheme(&self) -> Option<&str> {
        self.header("authorization")
            .map(|v| v.split_whitespace().next().unwrap_or(""))
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum ParseError {
    InvalidRequestLine,
    InvalidMethod,
    InvalidHeader,
    InvalidContentLength,
    NotUtf8,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            ParseError::InvalidRequestLine => "malformed request line",
            ParseError::InvalidMethod => "unknown request method",
            ParseError::InvalidHeader => "malformed header line",
            ParseError::InvalidContentLength => "unparseable content-length",
            ParseError::NotUtf8 => "request head is not valid UTF-8",
        };
        write!(f, "{}", msg)
    }
}

impl Error for ParseError {}

/// Try to parse a request head out of `buf`.
///
/// Returns `Ok(None)` while the head is still incomplete (no blank line
/// yet), `Ok(Some((request, consumed)))` once the head is fully parsed,
/// where `consumed` counts the header bytes including the blank line.
/// Bytes past `consumed` are the start of the body.
pub fn parse_request(buf: &[u8]) -> Result<Option<(ParsedRequest, usize)>, ParseError> {
    let head_end = match find_head_end(buf) {
        Some(pos) => pos,
        None => return Ok(None),
    };
    let consumed = head_end + 4;

    let head = std::str::from_utf8(&buf[..head_end]).map_err(|_| ParseError::NotUtf8)?;
    let mut lines = head.split("\r\n");

    let request_line = lines.next().ok_or(ParseError::InvalidRequestLine)?;
    let mut parts = request_line.split_whitespace();
    let method_str = parts.next().ok_or(ParseError::InvalidRequestLine)?;
    let target = parts.next().ok_or(ParseError::InvalidRequestLine)?;
    let version = parts.next().ok_or(ParseError::InvalidRequestLine)?;
    if parts.next().is_some() {
        return Err(ParseError::InvalidRequestLine);
    }

    let method = Method::parse(method_str).ok_or(ParseError::InvalidMethod)?;

    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let (name, value) = line.split_once(':').ok_or(ParseError::InvalidHeader)?;
        headers.insert(
            name.trim().to_ascii_lowercase(),
            value.trim().to_string(),
        );
    }

    if let Some(cl) = headers.get("content-length") {
        cl.parse::<usize>().map_err(|_| ParseError::InvalidContentLength)?;
    }

    let (path, query_string) = match target.split_once('?') {
        Some((p, q)) => (p.to_string(), q.to_string()),
        None => (target.to_string(), String::new()),
    };

    Ok(Some((
        ParsedRequest {
            method,
            target: target.to_string(),
            path,
            query_string,
            version: version.to_string(),
            headers,
        },
        consumed,
    )))
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incomplete_head() {
        assert!(parse_request(b"GET / HTTP/1.1\r\nHost: x\r\n").unwrap().is_none());
        assert!(parse_request(b"").unwrap().is_none());
    }

    #[test]
    fn simple_get() {
        let buf = b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n";
        let (req, consumed) = parse_request(buf).unwrap().unwrap();
        assert_eq!(req.method, Method::Get);
        assert_eq!(req.path, "/");
        assert_eq!(req.version, "HTTP/1.1");
        assert_eq!(req.header("host"), Some("example.com"));
        assert_eq!(consumed, buf.len());
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let buf = b"GET / HTTP/1.1\r\nContent-Type: text/plain\r\n\r\n";
        let (req, _) = parse_request(buf).unwrap().unwrap();
        assert_eq!(req.header("content-type"), Some("text/plain"));
        assert_eq!(req.header("CONTENT-TYPE"), Some("text/plain"));
        assert!(req.has_header("Content-Type"));
    }

    #[test]
    fn query_string_split() {
        let buf = b"GET /search?q=rust&x=1 HTTP/1.1\r\n\r\n";
        let (req, _) = parse_request(buf).unwrap().unwrap();
        assert_eq!(req.path, "/search");
        assert_eq!(req.query_string, "q=rust&x=1");
        assert_eq!(req.target, "/search?q=rust&x=1");
    }

    #[test]
    fn body_is_not_consumed() {
        let buf = b"POST /up HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello";
        let (req, consumed) = parse_request(buf).unwrap().unwrap();
        assert_eq!(req.content_length(), 5);
        assert!(req.has_body());
        assert_eq!(&buf[consumed..], b"hello");
    }

    #[test]
    fn unknown_method_rejected() {
        let buf = b"BREW /pot HTTP/1.1\r\n\r\n";
        assert_eq!(parse_request(buf), Err(ParseError::InvalidMethod));
    }

    #[test]
    fn malformed_header_rejected() {
        let buf = b"GET / HTTP/1.1\r\nNoColonHere\r\n\r\n";
        assert_eq!(parse_request(buf), Err(ParseError::InvalidHeader));
    }

    #[test]
    fn bad_content_length_rejected() {
        let buf = b"POST / HTTP/1.1\r\nContent-Length: nope\r\n\r\n";
        assert_eq!(parse_request(buf), Err(ParseError::InvalidContentLength));
    }
}
