//! Thin wrapper around a spawned child process's liveness, independent of
//! whatever terminal (PTY or headless pipes) it's attached to.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::core::SessionResult;

/// Tracks whether the CLI child behind a session is still alive.
///
/// The Session Backend only needs a yes/no liveness check
/// (`isChildProcessAlive`, §4.1); the Runtime Exit Monitor polls this
/// independently of PTY/shell state, since a PTY's shell can outlive the
/// CLI process it launched.
#[derive(Clone)]
pub struct ProcessHandle {
    pid: u32,
    alive: Arc<AtomicBool>,
}

impl ProcessHandle {
    pub fn new(pid: u32) -> Self {
        Self {
            pid,
            alive: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn is_alive(&self) -> bool {
        if !self.alive.load(Ordering::Relaxed) {
            return false;
        }
        #[cfg(unix)]
        {
            use nix::sys::signal::kill;
            use nix::unistd::Pid;
            // Signal 0: no-op existence probe, never actually delivered.
            let alive = kill(Pid::from_raw(self.pid as i32), None).is_ok();
            if !alive {
                self.alive.store(false, Ordering::Relaxed);
            }
            alive
        }
        #[cfg(not(unix))]
        {
            self.alive.load(Ordering::Relaxed)
        }
    }

    pub fn mark_dead(&self) {
        self.alive.store(false, Ordering::Relaxed);
    }

    pub fn kill(&self) -> SessionResult<()> {
        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;
            let _ = kill(Pid::from_raw(self.pid as i32), Signal::SIGTERM);
        }
        self.mark_dead();
        Ok(())
    }
}
