//! Non-blocking child reaping.
//!
//! Finished CGI processes are queued here and collected with
//! `waitpid(WNOHANG)` once per loop iteration, so the event loop never
//! blocks in `wait` while connections are live. A pid enters the queue
//! exactly once, after its stdin pipe has been closed, and leaves it
//! once `waitpid` reports an exit.

use nix::errno::Errno;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use tracing::warn;

#[derive(Default)]
pub struct ReapQueue {
    pending: Vec<Pid>,
}

impl ReapQueue {
    pub fn new() -> Self {
        ReapQueue::default()
    }

    pub fn push(&mut self, pid: Pid) {
        self.pending.push(pid);
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// One non-blocking pass over the queue. Children still running
    /// stay queued for the next iteration.
    pub fn reap(&mut self) {
        self.pending.retain(|&pid| {
            match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => true,
                Ok(WaitStatus::Exited(_, 0)) => false,
                Ok(WaitStatus::Exited(_, code)) => {
                    warn!(pid = pid.as_raw(), code, "cgi process exited with error");
                    false
                }
                Ok(WaitStatus::Signaled(_, signal, _)) => {
                    warn!(pid = pid.as_raw(), signal = %signal, "cgi process killed by signal");
                    false
                }
                // Stopped/continued: still our child, keep waiting.
                Ok(_) => true,
                Err(Errno::ECHILD) => {
                    // Already collected elsewhere; nothing to hold.
                    false
                }
                Err(e) => {
                    warn!(pid = pid.as_raw(), error = %e, "waitpid failed");
                    false
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;
    use std::time::{Duration, Instant};

    #[test]
    fn reaps_exited_child_without_blocking() {
        let child = Command::new("true").spawn().unwrap();
        let pid = Pid::from_raw(child.id() as i32);

        let mut queue = ReapQueue::new();
        queue.push(pid);
        assert_eq!(queue.len(), 1);

        let deadline = Instant::now() + Duration::from_secs(5);
        while !queue.is_empty() {
            queue.reap();
            assert!(Instant::now() < deadline, "child never reaped");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn running_child_stays_queued() {
        let mut child = Command::new("sleep").arg("10").spawn().unwrap();
        let pid = Pid::from_raw(child.id() as i32);

        let mut queue = ReapQueue::new();
        queue.push(pid);
        queue.reap();
        assert_eq!(queue.len(), 1);

        child.kill().unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while !queue.is_empty() {
            queue.reap();
            assert!(Instant::now() < deadline, "killed child never reaped");
            std::thread::sleep(Duration::from_millis(5));
        }
    }
}
