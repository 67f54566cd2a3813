//! Unified terminal abstraction over the two backing implementations: a
//! real PTY, or headless piped stdio when the host won't allow one.

use crate::core::headless::HeadlessHandle;
use crate::core::process::ProcessHandle;
use crate::core::pty::PtyHandle;
use crate::core::SessionResult;

pub enum TerminalHandle {
    Pty(PtyHandle),
    Headless(HeadlessHandle),
}

impl TerminalHandle {
    pub fn write(&self, data: &[u8]) -> SessionResult<()> {
        match self {
            TerminalHandle::Pty(h) => h.write(data),
            TerminalHandle::Headless(h) => h.write(data),
        }
    }

    pub fn resize(&self, cols: u16, rows: u16) -> SessionResult<()> {
        match self {
            TerminalHandle::Pty(h) => h.resize(cols, rows),
            TerminalHandle::Headless(h) => h.resize(cols, rows),
        }
    }

    pub fn process(&self) -> ProcessHandle {
        match self {
            TerminalHandle::Pty(h) => h.process(),
            TerminalHandle::Headless(h) => h.process(),
        }
    }

    pub fn kill(&self) -> SessionResult<()> {
        match self {
            TerminalHandle::Pty(h) => h.kill(),
            TerminalHandle::Headless(h) => h.kill(),
        }
    }

    pub fn is_headless(&self) -> bool {
        matches!(self, TerminalHandle::Headless(_))
    }
}
