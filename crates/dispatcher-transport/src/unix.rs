//! Local stream-socket transport with descriptor passing.
//!
//! Frames are the 8-byte header plus JSON payload from
//! [`dispatcher_proto::frame`].  Descriptors ride as `SCM_RIGHTS` ancillary
//! data attached to the frame's first byte chunk.  Peer credentials come
//! from `SO_PEERCRED` at connection time and are delivered in the `Open`
//! upcall, before any message.

use std::net::Shutdown;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dispatcher_proto::{FileDescriptor, FrameError, FrameReader, encode_frame};
use sendfd::{RecvWithFd, SendWithFd};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, warn};

use crate::{
    CloseReason, Credentials, EVENT_CHANNEL_CAPACITY, Listener, ParsedUrl, Transport,
    TransportError, TransportEvent, TransportEvents, close_sent_fds,
};

/// Upper bound on descriptors accepted per receive chunk.
const MAX_FDS_PER_CHUNK: usize = 128;

const RECV_BUF_SIZE: usize = 64 * 1024;

/// Connect to `unix://PATH`.
pub async fn connect(
    url: &ParsedUrl,
) -> Result<(Box<dyn Transport>, TransportEvents), TransportError> {
    let path = if url.path.is_empty() {
        "/var/run/dispatcher.sock"
    } else {
        url.path.as_str()
    };
    let stream = std::os::unix::net::UnixStream::connect(path)
        .map_err(|e| TransportError::Connect(format!("{path}: {e}")))?;
    from_std_stream(stream, StreamOptions::unix(path.to_owned())).await
}

/// Bind a `unix://PATH` listener.
pub async fn listen(url: &ParsedUrl) -> Result<Box<dyn Listener>, TransportError> {
    let path = url.path.clone();
    // A stale socket file from a previous run would fail the bind.
    if std::path::Path::new(&path).exists() {
        let _ = std::fs::remove_file(&path);
    }
    let listener =
        UnixListener::bind(&path).map_err(|e| TransportError::Connect(format!("{path}: {e}")))?;
    Ok(Box::new(UnixSocketListener { listener, path }))
}

// ---------------------------------------------------------------------------
// Stream setup
// ---------------------------------------------------------------------------

/// Behavior switches shared between `unix://` and `fd://`.
#[derive(Debug, Clone)]
pub(crate) struct StreamOptions {
    /// Attach/consume SCM_RIGHTS ancillary data.
    pub fd_passing: bool,
    /// Report `SO_PEERCRED` credentials in `Open`.
    pub credentials: bool,
    pub description: String,
}

impl StreamOptions {
    fn unix(path: String) -> Self {
        StreamOptions {
            fd_passing: true,
            credentials: true,
            description: path,
        }
    }

    pub(crate) fn raw_fd(fd: RawFd) -> Self {
        StreamOptions {
            fd_passing: false,
            credentials: false,
            description: format!("fd://{fd}"),
        }
    }

    /// A socketpair end that should speak the full unix contract
    /// (descriptors and credentials).  Used by back-to-back wiring.
    pub(crate) fn socketpair_end(description: String) -> Self {
        StreamOptions {
            fd_passing: true,
            credentials: true,
            description,
        }
    }
}

/// Wrap an already-connected stream socket.
pub(crate) async fn from_std_stream(
    stream: std::os::unix::net::UnixStream,
    options: StreamOptions,
) -> Result<(Box<dyn Transport>, TransportEvents), TransportError> {
    stream
        .set_nonblocking(true)
        .map_err(|e| TransportError::Connect(e.to_string()))?;
    // A duplicated handle lets close() shut the socket down while the
    // reader task owns the tokio registration.
    let shutdown_handle = stream
        .try_clone()
        .map_err(|e| TransportError::Connect(e.to_string()))?;
    let stream = UnixStream::from_std(stream).map_err(|e| TransportError::Connect(e.to_string()))?;

    let credentials = if options.credentials {
        stream.peer_cred().ok().map(|cred| Credentials {
            pid: cred.pid().unwrap_or(0),
            uid: cred.uid(),
            // SO_PEERCRED reports the effective uid
            euid: cred.uid(),
            gid: cred.gid(),
        })
    } else {
        None
    };

    let stream = Arc::new(stream);
    let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    tx.send(TransportEvent::Open { credentials })
        .await
        .map_err(|_| TransportError::Closed)?;

    let transport = Arc::new(UnixTransport {
        stream: Arc::clone(&stream),
        shutdown_handle,
        write_lock: Mutex::new(()),
        closed: AtomicBool::new(false),
        options: options.clone(),
    });

    tokio::spawn(receive_loop(stream, tx, options));

    Ok((Box::new(UnixTransportHandle(transport)), rx))
}

/// Wrap both ends of a connected socketpair for back-to-back use.
pub async fn pair() -> Result<
    (
        (Box<dyn Transport>, TransportEvents),
        (Box<dyn Transport>, TransportEvents),
    ),
    TransportError,
> {
    let (a, b) = std::os::unix::net::UnixStream::pair()
        .map_err(|e| TransportError::Connect(e.to_string()))?;
    let left = from_std_stream(a, StreamOptions::socketpair_end("socketpair:a".to_owned())).await?;
    let right = from_std_stream(b, StreamOptions::socketpair_end("socketpair:b".to_owned())).await?;
    Ok((left, right))
}

// ---------------------------------------------------------------------------
// Transport implementation
// ---------------------------------------------------------------------------

struct UnixTransport {
    stream: Arc<UnixStream>,
    shutdown_handle: std::os::unix::net::UnixStream,
    write_lock: Mutex<()>,
    closed: AtomicBool,
    options: StreamOptions,
}

/// Boxable handle; the inner Arc is shared with nothing else today but
/// keeps clone semantics open for server bookkeeping.
struct UnixTransportHandle(Arc<UnixTransport>);

impl UnixTransport {
    async fn send_frame(&self, payload: Vec<u8>, fds: Vec<FileDescriptor>) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }

        let _guard = self.write_lock.lock().await;
        let frame = encode_frame(&payload);
        let raw_fds: Vec<RawFd> = if self.options.fd_passing {
            fds.iter().map(|f| f.raw).collect()
        } else {
            Vec::new()
        };

        let mut offset = 0;
        let mut fds_sent = false;
        while offset < frame.len() {
            self.stream
                .writable()
                .await
                .map_err(|e| self.send_failed(e))?;
            let ancillary: &[RawFd] = if fds_sent { &[] } else { &raw_fds };
            match self.stream.send_with_fd(&frame[offset..], ancillary) {
                Ok(n) => {
                    offset += n;
                    fds_sent = true;
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(self.send_failed(e)),
            }
        }

        if self.options.fd_passing {
            close_sent_fds(&fds);
        }
        Ok(())
    }

    fn send_failed(&self, err: std::io::Error) -> TransportError {
        debug!(target: "dispatcher_transport", error = %err, "send failed; closing connection");
        self.shutdown();
        TransportError::Send(err.to_string())
    }

    fn shutdown(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let _ = self.shutdown_handle.shutdown(Shutdown::Both);
        }
    }
}

#[async_trait::async_trait]
impl Transport for UnixTransportHandle {
    async fn send(&self, payload: Vec<u8>, fds: Vec<FileDescriptor>) -> Result<(), TransportError> {
        self.0.send_frame(payload, fds).await
    }

    async fn close(&self) {
        self.0.shutdown();
    }

    fn fd_passing(&self) -> bool {
        self.0.options.fd_passing
    }

    fn local_description(&self) -> String {
        self.0.options.description.clone()
    }
}

// ---------------------------------------------------------------------------
// Receive task
// ---------------------------------------------------------------------------

async fn receive_loop(
    stream: Arc<UnixStream>,
    tx: mpsc::Sender<TransportEvent>,
    options: StreamOptions,
) {
    let mut reader = FrameReader::new();
    let mut buf = vec![0u8; RECV_BUF_SIZE];
    let mut fd_buf = [0 as RawFd; MAX_FDS_PER_CHUNK];

    let reason = loop {
        if stream.readable().await.is_err() {
            break CloseReason::Normal;
        }

        let (len, fd_count) = match stream.recv_with_fd(&mut buf, &mut fd_buf) {
            Ok((0, 0)) => break CloseReason::Normal,
            Ok(counts) => counts,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(e) => break CloseReason::Error(e.to_string()),
        };

        let fds: &[RawFd] = if options.fd_passing {
            &fd_buf[..fd_count]
        } else {
            &[]
        };

        if let Err(err) = reader.feed(&buf[..len], fds) {
            warn!(target: "dispatcher_transport", error = %err, "dropping corrupt stream");
            break match err {
                FrameError::PermissionDenied => CloseReason::PermissionDenied,
                FrameError::BadMagic(_) => CloseReason::Error(err.to_string()),
            };
        }

        let mut consumer_gone = false;
        while let Some(frame) = reader.next_frame() {
            debug!(
                target: "dispatcher_transport",
                len = frame.payload.len(),
                fds = frame.fds.len(),
                "frame received"
            );
            if tx
                .send(TransportEvent::Message {
                    payload: frame.payload,
                    fds: frame.fds,
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
    };

    let _ = tx.send(TransportEvent::Closed { reason }).await;
}

// ---------------------------------------------------------------------------
// Listener
// ---------------------------------------------------------------------------

struct UnixSocketListener {
    listener: UnixListener,
    path: String,
}

#[async_trait::async_trait]
impl Listener for UnixSocketListener {
    async fn accept(&mut self) -> Result<(Box<dyn Transport>, TransportEvents), TransportError> {
        let (stream, _addr) = self
            .listener
            .accept()
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let stream = stream
            .into_std()
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        from_std_stream(stream, StreamOptions::unix(self.path.clone())).await
    }

    fn local_description(&self) -> String {
        self.path.clone()
    }
}
