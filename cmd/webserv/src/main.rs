//! webserv: a single-threaded epoll HTTP server with CGI support.
//!
//! Takes either a bare port number (serving `./www`) or a YAML config
//! file describing one or more virtual hosts. Runs until SIGINT or
//! SIGTERM, then drains connections and reaps outstanding children.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{bail, Context};
use clap::Parser;
use tracing::{error, info};

use webserv_core::config::Config;
use webserv_reactor::EventLoop;

static RUNNING: AtomicBool = AtomicBool::new(true);

extern "C" fn on_shutdown_signal(_sig: libc::c_int) {
    RUNNING.store(false, Ordering::SeqCst);
}

#[derive(Parser)]
#[command(name = "webserv", version, about = "Single-threaded epoll HTTP server with CGI")]
struct Args {
    /// Port number to serve ./www on, or path to a YAML config file.
    /// Defaults to port 8080.
    target: Option<String>,
}

fn load_config(target: Option<&str>) -> anyhow::Result<Config> {
    match target {
        None => Ok(Config::single_port(8080)),
        Some(t) => {
            if let Ok(port) = t.parse::<u16>() {
                Ok(Config::single_port(port))
            } else {
                Config::load(Path::new(t)).with_context(|| format!("loading config file {}", t))
            }
        }
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_target(false).init();
    let args = Args::parse();
    let config = load_config(args.target.as_deref())?;

    // A vanished peer must surface as a write error on that one
    // connection, not as SIGPIPE killing the process.
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
        let handler = on_shutdown_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
        libc::signal(libc::SIGINT, handler);
        libc::signal(libc::SIGTERM, handler);
    }

    let mut el = EventLoop::new()?;
    let mut bound = 0usize;
    for host in config.servers {
        let port = host.port;
        match el.add_host(host) {
            Ok(_) => bound += 1,
            // One unbindable host does not stop the others.
            Err(e) => error!(port, error = %e, "skipping virtual host"),
        }
    }
    if bound == 0 {
        bail!("no virtual host could be bound");
    }

    el.run(&RUNNING)?;
    info!("goodbye");
    Ok(())
}
