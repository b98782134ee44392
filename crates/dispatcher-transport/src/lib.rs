//! Transport layer: duplex byte channels with an ancillary-data side channel.
//!
//! A transport delivers whole frame payloads upward as [`TransportEvent`]s
//! over an mpsc channel and accepts outbound `(payload, fds)` pairs through
//! the [`Transport`] trait.  Exactly one `Open` is delivered before any
//! `Message`; `Closed` is terminal.
//!
//! # Variants
//! - `unix://PATH` — local stream socket; descriptors via `SCM_RIGHTS`,
//!   peer credentials surfaced in `Open`.
//! - `fd://N` — an already-open local socket descriptor; frame bytes only.
//! - `ws://HOST:PORT/dispatcher/socket` — WebSocket; the WS layer frames,
//!   no descriptors, no credentials.
//! - `ssh://USER@HOST:PORT` and `ws+ssh://USER@HOST:PORT` — frames tunneled
//!   through a helper process on the remote host via an ssh exec channel.

pub mod fd;
pub mod ssh;
pub mod unix;
mod url;
pub mod ws;

pub use url::ParsedUrl;

use std::os::fd::RawFd;

use dispatcher_proto::FileDescriptor;
use tokio::sync::mpsc;

/// Default capacity of the upcall channel between a transport and its
/// connection.  Bounded so a stalled consumer applies backpressure to the
/// socket instead of buffering without limit.
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Peer credentials of a local-socket connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Credentials {
    pub pid: i32,
    pub uid: u32,
    pub euid: u32,
    pub gid: u32,
}

/// Why a transport reported `Closed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Clean shutdown: EOF or an explicit local `close()`.
    Normal,
    /// The peer refused the session (SSH permission sentinel).
    PermissionDenied,
    /// Stream corruption or an I/O failure; the message describes it.
    Error(String),
}

/// Upcalls from a transport to its connection.
#[derive(Debug)]
pub enum TransportEvent {
    /// The channel is up.  Local transports attach the peer's credentials.
    Open { credentials: Option<Credentials> },
    /// One reassembled frame payload with its ancillary descriptors.
    Message { payload: Vec<u8>, fds: Vec<RawFd> },
    /// Terminal.  No further events follow.
    Closed { reason: CloseReason },
}

/// Receiver half of the upcall channel.
pub type TransportEvents = mpsc::Receiver<TransportEvent>;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("unknown transport scheme {0}")]
    UnknownScheme(String),
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("send failed: {0}")]
    Send(String),
    #[error("transport is closed")]
    Closed,
}

/// Outbound half of a duplex framed channel.
///
/// A single frame (bytes plus descriptors) is serialized end-to-end; the
/// implementations hold a write lock so concurrent senders interleave at
/// frame granularity only.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Deliver one frame payload, with descriptors when the transport is
    /// FD-capable.  Descriptors flagged `close_on_send` are closed locally
    /// after a successful transmission.
    async fn send(&self, payload: Vec<u8>, fds: Vec<FileDescriptor>) -> Result<(), TransportError>;

    /// Shut the channel down.  The upcall channel will deliver `Closed`.
    async fn close(&self);

    /// Whether this transport can carry file descriptors out-of-band.
    fn fd_passing(&self) -> bool;

    /// Human-readable endpoint description for logging.
    fn local_description(&self) -> String;
}

/// Accepts inbound connections for a server endpoint.
#[async_trait::async_trait]
pub trait Listener: Send {
    async fn accept(&mut self) -> Result<(Box<dyn Transport>, TransportEvents), TransportError>;

    fn local_description(&self) -> String;
}

/// Options consumed by the ssh transports; the other schemes ignore them.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// The ssh client binary to spawn.
    pub ssh_command: String,
    /// Remote helper command that speaks the frame protocol on its stdio.
    pub ssh_helper: String,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        ConnectOptions {
            ssh_command: "ssh".to_owned(),
            ssh_helper: "sh /usr/local/libexec/dispatcher/ssh_transport_catcher".to_owned(),
        }
    }
}

/// Connect a client transport, dispatching on the URL scheme.
pub async fn connect(
    url: &str,
    options: &ConnectOptions,
) -> Result<(Box<dyn Transport>, TransportEvents), TransportError> {
    let parsed = ParsedUrl::parse(url)?;
    match parsed.scheme.as_str() {
        "unix" => unix::connect(&parsed).await,
        "fd" => fd::connect(&parsed).await,
        "ws" => ws::connect(&parsed).await,
        "ssh" | "ws+ssh" => ssh::connect(&parsed, options).await,
        other => Err(TransportError::UnknownScheme(other.to_owned())),
    }
}

/// Bind a server listener, dispatching on the URL scheme.
pub async fn listen(url: &str) -> Result<Box<dyn Listener>, TransportError> {
    let parsed = ParsedUrl::parse(url)?;
    match parsed.scheme.as_str() {
        "unix" => unix::listen(&parsed).await,
        "ws" => ws::listen(&parsed).await,
        other => Err(TransportError::UnknownScheme(other.to_owned())),
    }
}

/// Close descriptors that were flagged close-on-send, after their frame
/// went out.
pub(crate) fn close_sent_fds(fds: &[FileDescriptor]) {
    use std::os::fd::{FromRawFd, OwnedFd};
    for fd in fds {
        if fd.close_on_send {
            // Take ownership solely to close.
            drop(unsafe { OwnedFd::from_raw_fd(fd.raw) });
        }
    }
}
