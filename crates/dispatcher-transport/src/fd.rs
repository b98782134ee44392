//! Raw file-descriptor transport (`fd://N`).
//!
//! Wraps an already-open local socket descriptor, typically one end of a
//! socketpair handed down by a parent process.  Only frame bytes travel;
//! no ancillary descriptors and no credentials, matching the wire contract
//! of a descriptor whose peer may be any local process.

use std::os::fd::{FromRawFd, RawFd};

use crate::unix::{StreamOptions, from_std_stream};
use crate::{ParsedUrl, Transport, TransportError, TransportEvents};

/// Connect over `fd://N`.
///
/// Takes ownership of the descriptor: it is closed when the transport
/// shuts down.  The descriptor must refer to a connected local stream
/// socket.
pub async fn connect(
    url: &ParsedUrl,
) -> Result<(Box<dyn Transport>, TransportEvents), TransportError> {
    let raw = url.fd_number()?;
    from_raw_fd(raw).await
}

/// Wrap a raw descriptor number directly (the `fd://N` path without URL
/// parsing).
pub async fn from_raw_fd(
    raw: RawFd,
) -> Result<(Box<dyn Transport>, TransportEvents), TransportError> {
    // Ownership of `raw` transfers to the stream.
    let stream = unsafe { std::os::unix::net::UnixStream::from_raw_fd(raw) };
    from_std_stream(stream, StreamOptions::raw_fd(raw)).await
}

/// Wrap an owned socket (used by in-process back-to-back wiring).
pub async fn from_socket(
    stream: std::os::unix::net::UnixStream,
) -> Result<(Box<dyn Transport>, TransportEvents), TransportError> {
    use std::os::fd::AsRawFd;
    let raw = stream.as_raw_fd();
    from_std_stream(stream, StreamOptions::raw_fd(raw)).await
}
