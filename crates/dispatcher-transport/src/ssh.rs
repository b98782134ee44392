//! SSH-tunneled transport (`ssh://USER@HOST:PORT`, `ws+ssh://...`).
//!
//! Spawns the system ssh client and executes the dispatcher helper on the
//! remote host; the helper speaks the frame protocol on its stdio, so the
//! tunnel is just the child's stdin/stdout.  A header with
//! [`dispatcher_proto::PERMISSION_DENIED_MAGIC`] from the helper means the
//! remote side refused the session and the connection terminates.

use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dispatcher_proto::{FileDescriptor, FrameError, FrameReader, encode_frame};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, warn};

use crate::{
    CloseReason, ConnectOptions, EVENT_CHANNEL_CAPACITY, ParsedUrl, Transport, TransportError,
    TransportEvent, TransportEvents,
};

/// Connect by spawning `ssh [-p PORT] USER@HOST <helper>`.
pub async fn connect(
    url: &ParsedUrl,
    options: &ConnectOptions,
) -> Result<(Box<dyn Transport>, TransportEvents), TransportError> {
    let host = url
        .host
        .as_deref()
        .ok_or_else(|| TransportError::InvalidUrl("ssh:// requires a host".to_owned()))?;
    let username = url
        .username
        .as_deref()
        .ok_or_else(|| TransportError::InvalidUrl("ssh:// requires a username".to_owned()))?;

    let mut command = Command::new(&options.ssh_command);
    command
        .arg("-oBatchMode=yes")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(port) = url.port {
        command.arg("-p").arg(port.to_string());
    }
    command.arg(format!("{username}@{host}"));
    command.arg(&options.ssh_helper);

    let description = format!("{}://{username}@{host}", url.scheme);
    debug!(target: "dispatcher_transport", endpoint = %description, "spawning ssh tunnel");

    let mut child = command
        .spawn()
        .map_err(|e| TransportError::Connect(format!("{}: {e}", options.ssh_command)))?;
    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| TransportError::Connect("ssh stdin unavailable".to_owned()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| TransportError::Connect("ssh stdout unavailable".to_owned()))?;
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(log_stderr(stderr, description.clone()));
    }

    let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    tx.send(TransportEvent::Open { credentials: None })
        .await
        .map_err(|_| TransportError::Closed)?;

    let transport = SshTransport {
        stdin: Mutex::new(stdin),
        child: Mutex::new(child),
        closed: Arc::new(AtomicBool::new(false)),
        description,
    };
    tokio::spawn(receive_loop(stdout, tx, Arc::clone(&transport.closed)));

    Ok((Box::new(transport), rx))
}

struct SshTransport {
    stdin: Mutex<ChildStdin>,
    child: Mutex<Child>,
    closed: Arc<AtomicBool>,
    description: String,
}

#[async_trait::async_trait]
impl Transport for SshTransport {
    async fn send(&self, payload: Vec<u8>, _fds: Vec<FileDescriptor>) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        let frame = encode_frame(&payload);
        let mut stdin = self.stdin.lock().await;
        stdin.write_all(&frame).await.map_err(|e| {
            self.closed.store(true, Ordering::Release);
            TransportError::Send(e.to_string())
        })?;
        stdin
            .flush()
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let mut child = self.child.lock().await;
            let _ = child.start_kill();
        }
    }

    fn fd_passing(&self) -> bool {
        false
    }

    fn local_description(&self) -> String {
        self.description.clone()
    }
}

async fn receive_loop(
    mut stdout: ChildStdout,
    tx: mpsc::Sender<TransportEvent>,
    closed: Arc<AtomicBool>,
) {
    let mut reader = FrameReader::new();
    let mut buf = vec![0u8; 16 * 1024];

    let reason = loop {
        match stdout.read(&mut buf).await {
            Ok(0) => break CloseReason::Normal,
            Ok(n) => {
                if let Err(err) = reader.feed(&buf[..n], &[]) {
                    warn!(target: "dispatcher_transport", error = %err, "ssh tunnel corrupt");
                    break match err {
                        FrameError::PermissionDenied => CloseReason::PermissionDenied,
                        FrameError::BadMagic(_) => CloseReason::Error(err.to_string()),
                    };
                }
                let mut consumer_gone = false;
                while let Some(frame) = reader.next_frame() {
                    if tx
                        .send(TransportEvent::Message {
                            payload: frame.payload,
                            fds: Vec::new(),
                        })
                        .await
                        .is_err()
                    {
                        consumer_gone = true;
                        break;
                    }
                }
                if consumer_gone {
                    return;
                }
            }
            Err(e) => break CloseReason::Error(e.to_string()),
        }
    };

    closed.store(true, Ordering::Release);
    let _ = tx.send(TransportEvent::Closed { reason }).await;
}

async fn log_stderr(stderr: tokio::process::ChildStderr, endpoint: String) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        warn!(target: "dispatcher_transport", endpoint = %endpoint, "ssh: {line}");
    }
}
