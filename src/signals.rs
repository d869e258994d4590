//! Process-wide shutdown flag, signal handlers, and the active-CGI registry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use anyhow::{Context, Result};
use nix::sys::signal::{signal, SigHandler, Signal};
use nix::unistd::Pid;

static RUNNING: AtomicBool = AtomicBool::new(true);

extern "C" fn stop_running(_signal: libc::c_int) {
    RUNNING.store(false, Ordering::Relaxed);
}

// Waking poll() is all this needs to do; reaping happens in the event loop,
// which owns the pid bookkeeping.
extern "C" fn child_exited(_signal: libc::c_int) {}

pub fn is_running() -> bool {
    RUNNING.load(Ordering::Relaxed)
}

/// Install SIGINT/SIGTERM shutdown handlers, ignore SIGPIPE, and let SIGCHLD
/// interrupt the readiness wait.
pub fn install() -> Result<()> {
    unsafe { signal(Signal::SIGPIPE, SigHandler::SigIgn) }
        .context("failed to set SIGPIPE handler")?;
    unsafe { signal(Signal::SIGINT, SigHandler::Handler(stop_running)) }
        .context("failed to set SIGINT handler")?;
    unsafe { signal(Signal::SIGTERM, SigHandler::Handler(stop_running)) }
        .context("failed to set SIGTERM handler")?;
    unsafe { signal(Signal::SIGCHLD, SigHandler::Handler(child_exited)) }
        .context("failed to set SIGCHLD handler")?;
    Ok(())
}

/// Live CGI children, pid to spawn instant. Owned by the event loop; the
/// per-iteration timeout and the deadline sweep both consult it.
#[derive(Debug, Default)]
pub struct CgiRegistry {
    active: HashMap<libc::pid_t, Instant>,
}

impl CgiRegistry {
    pub fn new() -> Self {
        Self {
            active: HashMap::new(),
        }
    }

    pub fn register(&mut self, pid: Pid, started: Instant) {
        self.active.insert(pid.as_raw(), started);
    }

    pub fn unregister(&mut self, pid: Pid) {
        self.active.remove(&pid.as_raw());
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    pub fn pids(&self) -> Vec<Pid> {
        self.active.keys().map(|&pid| Pid::from_raw(pid)).collect()
    }
}
