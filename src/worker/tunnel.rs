//! Worker side of reverse tunnels.
//!
//! On a `start_tunnel` command the worker dials a second TCP connection to
//! the master, identifies it with a tunnel hello carrying the session id,
//! and then serves raw bytes over it: either a tailed log file or an
//! interactive shell. The master splices this socket to the waiting
//! operator connection.

use std::io::SeekFrom;
use std::path::PathBuf;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{FleetError, Result};
use crate::protocol::frame::Hello;
use crate::protocol::messages::{TunnelKind, TunnelStartRequest};

/// How much history a log tunnel replays before following.
const LOG_TAIL_BYTES: u64 = 16 * 1024;
const LOG_POLL: Duration = Duration::from_millis(500);

pub struct TunnelTask {
    pub master_addr: String,
    pub secret: String,
    pub request: TunnelStartRequest,
    /// Resolved log path for log tunnels.
    pub log_path: Option<PathBuf>,
}

pub async fn run(task: TunnelTask) {
    let session = task.request.session_id.clone();
    if let Err(e) = serve(task).await {
        warn!(session = %session, error = %e, "tunnel ended with error");
    } else {
        debug!(session = %session, "tunnel closed");
    }
}

async fn serve(task: TunnelTask) -> Result<()> {
    let mut stream = TcpStream::connect(&task.master_addr).await?;
    let hello = Hello::Tunnel {
        secret: task.secret.clone(),
        session_id: task.request.session_id.clone(),
    };
    crate::protocol::frame::write_frame(&mut stream, &serde_json::to_vec(&hello)?).await?;

    info!(
        session = %task.request.session_id,
        kind = ?task.request.kind,
        "tunnel established"
    );
    match task.request.kind {
        TunnelKind::Log => {
            let path = task
                .log_path
                .ok_or_else(|| FleetError::Transport("log tunnel without a log path".into()))?;
            stream_log(stream, path).await
        }
        TunnelKind::Terminal => stream_terminal(stream).await,
    }
}

/// Replay the file tail, then follow appends until the peer hangs up. A file
/// that shrinks (rotation) restarts from its new end.
async fn stream_log(mut stream: TcpStream, path: PathBuf) -> Result<()> {
    // The process may not have created the file yet.
    let mut file = loop {
        match tokio::fs::File::open(&path).await {
            Ok(f) => break f,
            Err(_) => {
                if !peer_alive(&mut stream).await {
                    return Ok(());
                }
                tokio::time::sleep(LOG_POLL).await;
            }
        }
    };

    let len = file.metadata().await?.len();
    let mut pos = len.saturating_sub(LOG_TAIL_BYTES);
    file.seek(SeekFrom::Start(pos)).await?;

    let mut buf = vec![0u8; 8192];
    loop {
        let n = file.read(&mut buf).await?;
        if n > 0 {
            pos += n as u64;
            if stream.write_all(&buf[..n]).await.is_err() {
                return Ok(());
            }
            continue;
        }

        let current = tokio::fs::metadata(&path)
            .await
            .map(|m| m.len())
            .unwrap_or(0);
        if current < pos {
            // Truncated or rotated; re-open and continue from the new end.
            file = tokio::fs::File::open(&path).await?;
            pos = current;
            file.seek(SeekFrom::Start(pos)).await?;
        }
        if !peer_alive(&mut stream).await {
            return Ok(());
        }
        tokio::time::sleep(LOG_POLL).await;
    }
}

/// A zero-byte read on the socket means the operator closed the viewer; any
/// inbound bytes on a log tunnel are ignored.
async fn peer_alive(stream: &mut TcpStream) -> bool {
    let mut scratch = [0u8; 64];
    match tokio::time::timeout(Duration::from_millis(1), stream.read(&mut scratch)).await {
        Ok(Ok(0)) | Ok(Err(_)) => false,
        _ => true,
    }
}

#[cfg(unix)]
const SHELL: &str = "/bin/bash";
#[cfg(windows)]
const SHELL: &str = "cmd.exe";

/// Bridge a PTY-backed shell to the socket. The PTY handles are blocking, so
/// each direction runs its file side on the blocking pool and crosses into
/// async via a channel.
async fn stream_terminal(stream: TcpStream) -> Result<()> {
    use portable_pty::{native_pty_system, CommandBuilder, PtySize};

    let pty = native_pty_system();
    let pair = pty
        .openpty(PtySize {
            rows: 32,
            cols: 120,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(|e| FleetError::Transport(format!("openpty: {e}")))?;

    let mut child = pair
        .slave
        .spawn_command(CommandBuilder::new(SHELL))
        .map_err(|e| FleetError::Transport(format!("spawn shell: {e}")))?;
    let mut pty_reader = pair
        .master
        .try_clone_reader()
        .map_err(|e| FleetError::Transport(format!("pty reader: {e}")))?;
    let mut pty_writer = pair
        .master
        .take_writer()
        .map_err(|e| FleetError::Transport(format!("pty writer: {e}")))?;

    let (mut sock_read, mut sock_write) = stream.into_split();

    // PTY -> socket.
    let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(32);
    let read_task = tokio::task::spawn_blocking(move || {
        use std::io::Read;
        let mut buf = [0u8; 4096];
        while let Ok(n) = pty_reader.read(&mut buf) {
            if n == 0 || out_tx.blocking_send(buf[..n].to_vec()).is_err() {
                break;
            }
        }
    });
    let to_socket = tokio::spawn(async move {
        while let Some(chunk) = out_rx.recv().await {
            if sock_write.write_all(&chunk).await.is_err() {
                break;
            }
        }
    });

    // Socket -> PTY.
    let (in_tx, in_rx) = std::sync::mpsc::channel::<Vec<u8>>();
    let write_task = tokio::task::spawn_blocking(move || {
        use std::io::Write;
        while let Ok(chunk) = in_rx.recv() {
            if pty_writer.write_all(&chunk).is_err() {
                break;
            }
        }
    });

    let mut buf = [0u8; 4096];
    loop {
        match sock_read.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if in_tx.send(buf[..n].to_vec()).is_err() {
                    break;
                }
            }
        }
    }

    // Operator disconnected: tear the shell down.
    let _ = child.kill();
    drop(in_tx);
    drop(pair);
    let _ = write_task.await;
    read_task.abort();
    to_socket.abort();
    Ok(())
}
