//! PTY-backed terminal: the normal case, used whenever the host allows
//! opening a pseudo-terminal.

use std::io::{Read, Write};
use std::sync::{Arc, Mutex};

use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};

use crate::core::process::ProcessHandle;
use crate::core::{SessionError, SessionResult, SessionSize};

pub struct PtyHandle {
    master: Box<dyn MasterPty + Send>,
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
    child: Arc<Mutex<Box<dyn Child + Send + Sync>>>,
    process: ProcessHandle,
}

impl PtyHandle {
    /// Spawns `command` inside a fresh PTY sized per `size`, in `cwd`, with
    /// the given extra environment variables. Returns the handle plus a
    /// boxed reader that the caller drives on a dedicated thread (PTY reads
    /// are blocking; see `backend.rs` for the fan-out loop).
    pub fn spawn(
        command: &str,
        args: &[String],
        cwd: &std::path::Path,
        env: &[(String, String)],
        size: SessionSize,
    ) -> SessionResult<(Self, Box<dyn Read + Send>)> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: size.rows,
                cols: size.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SessionError::Pty(e.to_string()))?;

        let mut cmd = CommandBuilder::new(command);
        cmd.args(args);
        cmd.cwd(cwd);
        for (k, v) in env {
            cmd.env(k, v);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| SessionError::Spawn(e.to_string()))?;
        let pid = child.process_id().unwrap_or(0);

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| SessionError::Pty(e.to_string()))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| SessionError::Pty(e.to_string()))?;

        // Drop our handle to the slave end; the child keeps it open.
        drop(pair.slave);

        Ok((
            Self {
                master: pair.master,
                writer: Arc::new(Mutex::new(writer)),
                child: Arc::new(Mutex::new(child)),
                process: ProcessHandle::new(pid),
            },
            reader,
        ))
    }

    /// Large writes must not be split across control-sequence boundaries
    /// (§4.1); writing in a single `write_all` call under the session's
    /// write mutex satisfies that.
    pub fn write(&self, data: &[u8]) -> SessionResult<()> {
        let mut w = self.writer.lock().expect("pty writer poisoned");
        w.write_all(data).map_err(SessionError::Io)?;
        w.flush().map_err(SessionError::Io)
    }

    pub fn resize(&self, cols: u16, rows: u16) -> SessionResult<()> {
        self.master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SessionError::Pty(e.to_string()))
    }

    pub fn process(&self) -> ProcessHandle {
        self.process.clone()
    }

    pub fn kill(&self) -> SessionResult<()> {
        let mut child = self.child.lock().expect("pty child poisoned");
        let _ = child.kill();
        self.process.mark_dead();
        Ok(())
    }

    /// Best-effort blocking wait; used by the backend's reader thread to
    /// notice process exit even if the PTY read loop returns EOF first.
    pub fn try_wait_exited(&self) -> bool {
        let mut child = self.child.lock().expect("pty child poisoned");
        matches!(child.try_wait(), Ok(Some(_)))
    }
}
