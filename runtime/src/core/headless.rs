//! Headless fallback terminal: piped stdin/stdout/stderr instead of a PTY,
//! used when the host denies opening a pseudo-terminal (common inside
//! restrictive sandboxes) and the caller has opted into the degraded mode.

use std::process::Stdio;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};

use crate::core::process::ProcessHandle;
use crate::core::{SessionError, SessionResult};

type WriteRequest = (Vec<u8>, oneshot::Sender<std::io::Result<()>>);

pub struct HeadlessHandle {
    write_tx: mpsc::UnboundedSender<WriteRequest>,
    child: std::sync::Arc<std::sync::Mutex<Child>>,
    process: ProcessHandle,
}

/// True if `err` looks like the sandbox refused to allocate a PTY, the
/// trigger for falling back to headless mode.
pub fn is_permission_denied(err: &std::io::Error) -> bool {
    err.kind() == std::io::ErrorKind::PermissionDenied
        || err
            .to_string()
            .to_lowercase()
            .contains("operation not permitted")
}

impl HeadlessHandle {
    pub fn spawn(
        command: &str,
        args: &[String],
        cwd: &std::path::Path,
        env: &[(String, String)],
    ) -> SessionResult<(Self, impl AsyncRead + Unpin + Send + 'static)> {
        let mut cmd = Command::new(command);
        cmd.args(args)
            .current_dir(cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (k, v) in env {
            cmd.env(k, v);
        }

        let mut child = cmd.spawn().map_err(SessionError::Io)?;
        let pid = child.id().unwrap_or(0);

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| SessionError::Spawn("headless child missing stdin handle".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SessionError::Spawn("headless child missing stdout handle".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| SessionError::Spawn("headless child missing stderr handle".into()))?;

        let (write_tx, mut write_rx) = mpsc::unbounded_channel::<WriteRequest>();
        tokio::spawn(async move {
            while let Some((bytes, reply)) = write_rx.recv().await {
                let result = async {
                    stdin.write_all(&bytes).await?;
                    stdin.flush().await
                }
                .await;
                let _ = reply.send(result);
            }
        });

        Ok((
            Self {
                write_tx,
                child: std::sync::Arc::new(std::sync::Mutex::new(child)),
                process: ProcessHandle::new(pid),
            },
            merge_readers(stdout, stderr),
        ))
    }

    /// Writes are handed to the stdin-owning task and awaited synchronously
    /// from whatever async context the caller is already in, via a
    /// blocking recv on the paired oneshot channel.
    pub fn write(&self, data: &[u8]) -> SessionResult<()> {
        let (tx, rx) = oneshot::channel();
        self.write_tx
            .send((data.to_vec(), tx))
            .map_err(|_| SessionError::Process("headless stdin task gone".into()))?;
        tokio::task::block_in_place(|| rx.blocking_recv())
            .map_err(|_| SessionError::Process("headless stdin task dropped reply".into()))?
            .map_err(SessionError::Io)
    }

    /// Headless mode has no PTY geometry; resize is a no-op accepted for
    /// interface parity with `PtyHandle`.
    pub fn resize(&self, _cols: u16, _rows: u16) -> SessionResult<()> {
        Ok(())
    }

    pub fn process(&self) -> ProcessHandle {
        self.process.clone()
    }

    pub fn kill(&self) -> SessionResult<()> {
        let mut child = self.child.lock().expect("headless child poisoned");
        let _ = child.start_kill();
        self.process.mark_dead();
        Ok(())
    }
}

/// Concurrently drains two async readers into one combined byte stream so
/// headless sessions present the same single-stream interface PTYs do.
/// Mirrors the multi-reader fan-in the teacher uses for stdout+stderr.
fn merge_readers(
    mut stdout: impl AsyncRead + Unpin + Send + 'static,
    mut stderr: impl AsyncRead + Unpin + Send + 'static,
) -> impl AsyncRead + Unpin + Send + 'static {
    let (tx, rx) = mpsc::channel::<std::io::Result<Vec<u8>>>(64);

    let tx_out = tx.clone();
    tokio::spawn(async move {
        let mut buf = [0u8; 8192];
        loop {
            match stdout.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if tx_out.send(Ok(buf[..n].to_vec())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });
    tokio::spawn(async move {
        let mut buf = [0u8; 8192];
        loop {
            match stderr.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if tx.send(Ok(buf[..n].to_vec())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    ChannelReader {
        rx,
        pending: Vec::new(),
    }
}

struct ChannelReader {
    rx: mpsc::Receiver<std::io::Result<Vec<u8>>>,
    pending: Vec<u8>,
}

impl AsyncRead for ChannelReader {
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
