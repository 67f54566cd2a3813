//! Spawn-with-fallback: try a real PTY first, and only degrade to headless
//! piped stdio when the host actively refuses PTY allocation and the caller
//! opted into that degradation.

use tokio::io::AsyncRead;

use crate::core::headless::HeadlessHandle;
use crate::core::pty::PtyHandle;
use crate::core::terminal::TerminalHandle;
use crate::core::{SessionError, SessionResult, SessionSize};

pub struct SpawnOutcome {
    pub terminal: TerminalHandle,
    pub reader: Box<dyn AsyncRead + Unpin + Send>,
    pub fell_back_to_headless: bool,
}

pub fn spawn_with_fallback(
    command: &str,
    args: &[String],
    cwd: &std::path::Path,
    env: &[(String, String)],
    size: SessionSize,
    allow_headless_fallback: bool,
) -> SessionResult<SpawnOutcome> {
    match PtyHandle::spawn(command, args, cwd, env, size) {
        Ok((pty, reader)) => Ok(SpawnOutcome {
            terminal: TerminalHandle::Pty(pty),
            reader: Box::new(SyncReadAdapter::new(reader)),
            fell_back_to_headless: false,
        }),
        Err(SessionError::Pty(msg)) | Err(SessionError::Spawn(msg))
            if allow_headless_fallback && looks_permission_denied(&msg) =>
        {
            tracing::warn!(
                command,
                reason = %msg,
                "pty allocation denied, falling back to headless terminal"
            );
            let (headless, reader) = HeadlessHandle::spawn(command, args, cwd, env)?;
            Ok(SpawnOutcome {
                terminal: TerminalHandle::Headless(headless),
                reader: Box::new(reader),
                fell_back_to_headless: true,
            })
        }
        Err(e) => Err(e),
    }
}

fn looks_permission_denied(msg: &str) -> bool {
    let lower = msg.to_lowercase();
    lower.contains("permission denied") || lower.contains("operation not permitted")
}

/// Bridges a blocking `std::io::Read` (the PTY master's reader) into the
/// async world by running reads on a blocking thread pool, matching the
/// headless path's `AsyncRead` interface so the backend's fan-out loop
/// doesn't need to care which terminal kind it's draining.
struct SyncReadAdapter {
    rx: tokio::sync::mpsc::Receiver<std::io::Result<Vec<u8>>>,
    pending: Vec<u8>,
}

impl SyncReadAdapter {
    fn new(reader: Box<dyn std::io::Read + Send>) -> Self {
        let (tx, rx) = tokio::sync::mpsc::channel(64);
        tokio::task::spawn_blocking(move || {
            let mut reader = reader;
            let mut buf = [0u8; 8192];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if tx.blocking_send(Ok(buf[..n].to_vec())).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        let _ = tx.blocking_send(Err(e));
                        break;
                    }
                }
            }
        });
        Self {
            rx,
            pending: Vec::new(),
        }
    }
}

impl AsyncRead for SyncReadAdapter {
    fn poll_read(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        use std::task::Poll;

        if !self.pending.is_empty() {
            let n = self.pending.len().min(buf.remaining());
            buf.put_slice(&self.pending[..n]);
            self.pending.drain(..n);
            return Poll::Ready(Ok(()));
        }

        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                let n = chunk.len().min(buf.remaining());
                buf.put_slice(&chunk[..n]);
                if n < chunk.len() {
                    self.pending = chunk[n..].to_vec();
                }
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Some(Err(e))) => Poll::Ready(Err(e)),
            Poll::Ready(None) => Poll::Ready(Ok(())),
            Poll::Pending => Poll::Pending,
        }
    }
}

pub use crate::core::headless::is_permission_denied as pty_permission_denied;
