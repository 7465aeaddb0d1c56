//! Whole-server scenarios over real sockets.
//!
//! The reactor runs on the test thread, driven one `run_once` at a
//! time; the HTTP client lives on a spawned thread with plain blocking
//! I/O, and responses are close-delimited, so reading to EOF yields the
//! complete response.

use std::fs;
use std::io::{Read, Write};
use std::net::{IpAddr, Ipv4Addr, TcpStream};
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use webserv_core::config::{Config, Location};
use webserv_reactor::{Client, EventLoop, Poller, ReapQueue};

const INDEX_BODY: &[u8] = b"<html><body><h1>it works</h1></body></html>";
const NOTFOUND_BODY: &[u8] = b"<html><body><h1>no such page</h1></body></html>";

/// Lay out a document root with an index page, a 404 page, and an
/// echoing CGI script.
fn temp_site(tag: &str) -> PathBuf {
    let root = std::env::temp_dir().join(format!("webserv-e2e-{}-{}", tag, std::process::id()));
    let _ = fs::remove_dir_all(&root);
    fs::create_dir_all(root.join("cgi-bin")).unwrap();
    fs::write(root.join("index.html"), INDEX_BODY).unwrap();
    fs::write(root.join("notfound.html"), NOTFOUND_BODY).unwrap();

    let script = root.join("cgi-bin/echo.sh");
    fs::write(&script, "#!/bin/sh\ncat\n").unwrap();
    fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
    root
}

fn site_loop(tag: &str) -> (EventLoop, u16) {
    let root = temp_site(tag);
    let mut host = Config::single_port(0).servers.remove(0);
    host.root = root;
    host.locations.push(Location {
        path: "/cgi-bin".to_string(),
        cgi: true,
        upload_dir: None,
    });
    let mut el = EventLoop::new().unwrap();
    let port = el.add_host(host).unwrap();
    (el, port)
}

/// Send raw request bytes from a helper thread, read to EOF, and pump
/// the reactor until the exchange completes.
fn exchange(el: &mut EventLoop, port: u16, request: Vec<u8>) -> Vec<u8> {
    let handle = thread::spawn(move || {
        let mut conn = TcpStream::connect(("127.0.0.1", port)).unwrap();
        conn.write_all(&request).unwrap();
        let mut response = Vec::new();
        conn.read_to_end(&mut response).unwrap();
        response
    });

    let deadline = Instant::now() + Duration::from_secs(10);
    while !handle.is_finished() {
        el.run_once(Some(Duration::from_millis(20))).unwrap();
        assert!(Instant::now() < deadline, "exchange did not complete");
    }
    handle.join().unwrap()
}

fn settle(el: &mut EventLoop) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while el.pending_reaps() > 0 || el.client_count() > 0 {
        el.run_once(Some(Duration::from_millis(20))).unwrap();
        assert!(Instant::now() < deadline, "loop never settled");
    }
}

#[test]
fn get_root_serves_index() {
    let (mut el, port) = site_loop("index");
    let response = exchange(&mut el, port, b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n".to_vec());

    let mut expected = b"HTTP/1.1 200 OK\r\nContent-Type: text/html\r\n\r\n".to_vec();
    expected.extend_from_slice(INDEX_BODY);
    assert_eq!(response, expected);
    settle(&mut el);
}

#[test]
fn missing_path_serves_notfound_page() {
    let (mut el, port) = site_loop("notfound");
    let response = exchange(
        &mut el,
        port,
        b"GET /definitely/not/here HTTP/1.1\r\nHost: localhost\r\n\r\n".to_vec(),
    );

    let mut expected = b"HTTP/1.1 404 Not Found\r\nContent-Type: text/html\r\n\r\n".to_vec();
    expected.extend_from_slice(NOTFOUND_BODY);
    assert_eq!(response, expected);
    settle(&mut el);
}

#[test]
fn post_body_round_trips_through_cgi() {
    let (mut el, port) = site_loop("cgi");
    let response = exchange(
        &mut el,
        port,
        b"POST /cgi-bin/echo.sh HTTP/1.1\r\nHost: localhost\r\nContent-Length: 10\r\n\r\n0123456789"
            .to_vec(),
    );

    // cat produces no headers of its own, so the relayed response is
    // the injected status line followed by exactly the body bytes.
    let mut expected = b"HTTP/1.1 200 OK\r\n".to_vec();
    expected.extend_from_slice(b"0123456789");
    assert_eq!(response, expected);

    // The child must be collected without any further connection
    // activity.
    settle(&mut el);
    assert_eq!(el.pending_reaps(), 0);
    assert_eq!(el.client_count(), 0);
}

#[test]
fn malformed_request_gets_400() {
    let (mut el, port) = site_loop("malformed");
    let response = exchange(
        &mut el,
        port,
        b"BREW /pot HTTP/1.1\r\nHost: localhost\r\n\r\n".to_vec(),
    );
    assert!(response.starts_with(b"HTTP/1.1 400 Bad Request\r\n"));
    settle(&mut el);
}

#[test]
fn client_close_is_idempotent() {
    let mut poller = Poller::new().unwrap();
    let mut reaps = ReapQueue::new();
    let (ours, _theirs) = nix::sys::socket::socketpair(
        nix::sys::socket::AddressFamily::Unix,
        nix::sys::socket::SockType::Stream,
        None,
        nix::sys::socket::SockFlag::SOCK_NONBLOCK | nix::sys::socket::SockFlag::SOCK_CLOEXEC,
    )
    .unwrap();

    let host = Config::single_port(8080).servers.remove(0);
    let peer = IpAddr::V4(Ipv4Addr::LOCALHOST);
    let mut client = Client::accept(ours, peer, host, &mut poller).unwrap();

    client.close(&mut poller, &mut reaps).unwrap();
    client.close(&mut poller, &mut reaps).unwrap();
}
