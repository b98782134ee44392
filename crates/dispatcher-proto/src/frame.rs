//! Frame header codec and incremental frame reassembly.
//!
//! A frame is an 8-byte header (two little-endian `u32`s: magic, payload
//! length) followed by `length` bytes of UTF-8 JSON.  File descriptors
//! travel out-of-band as ancillary data and are attached to whichever
//! frame their byte chunk arrived with.
//!
//! A header with the wrong magic means the byte stream is corrupt — frames
//! are length-delimited, so there is no way to resynchronize and the
//! connection must be torn down.  The single exception is
//! [`PERMISSION_DENIED_MAGIC`], which the remote end of an SSH tunnel uses
//! to signal that the helper refused the session.

use std::collections::VecDeque;
use std::os::fd::RawFd;

/// Magic prefix of every valid frame, little-endian on the wire.
pub const FRAME_MAGIC: u32 = 0xdead_beef;

/// Sent instead of [`FRAME_MAGIC`] by the SSH helper when the remote side
/// refuses the session.  Terminal for the connection.
pub const PERMISSION_DENIED_MAGIC: u32 = 0xbadb_eef0;

/// Size of the frame header in bytes.
pub const HEADER_LEN: usize = 8;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// Header magic was neither [`FRAME_MAGIC`] nor the permission sentinel.
    #[error("frame with wrong magic {0:#010x}")]
    BadMagic(u32),
    /// The peer signalled permission denied ([`PERMISSION_DENIED_MAGIC`]).
    #[error("permission denied by peer")]
    PermissionDenied,
}

// ---------------------------------------------------------------------------
// Header
// ---------------------------------------------------------------------------

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub magic: u32,
    pub length: u32,
}

impl FrameHeader {
    /// Decode a header from exactly [`HEADER_LEN`] bytes.
    pub fn parse(buf: &[u8; HEADER_LEN]) -> Self {
        FrameHeader {
            magic: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            length: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
        }
    }

    /// Validate the magic, mapping the permission sentinel to its own error.
    pub fn validate(self) -> Result<Self, FrameError> {
        match self.magic {
            FRAME_MAGIC => Ok(self),
            PERMISSION_DENIED_MAGIC => Err(FrameError::PermissionDenied),
            other => Err(FrameError::BadMagic(other)),
        }
    }

    pub fn encode(self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[..4].copy_from_slice(&self.magic.to_le_bytes());
        out[4..].copy_from_slice(&self.length.to_le_bytes());
        out
    }
}

/// Encode a complete frame: header plus payload, ready for the transport.
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let header = FrameHeader {
        magic: FRAME_MAGIC,
        length: payload.len() as u32,
    };
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(&header.encode());
    out.extend_from_slice(payload);
    out
}

// ---------------------------------------------------------------------------
// Incremental reader
// ---------------------------------------------------------------------------

/// A complete reassembled frame with the descriptors that arrived with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub payload: Vec<u8>,
    pub fds: Vec<RawFd>,
}

/// Accumulates byte chunks (and the ancillary descriptors delivered with
/// them) and yields complete frames.
///
/// Stream transports deliver bytes in arbitrary chunk sizes; descriptors
/// arrive attached to some chunk within their frame.  Pending descriptors
/// are handed to the next frame that completes.
#[derive(Debug, Default)]
pub struct FrameReader {
    buf: Vec<u8>,
    pending_fds: Vec<RawFd>,
    ready: VecDeque<Frame>,
}

impl FrameReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a received chunk.  Completed frames become available through
    /// [`FrameReader::next_frame`].
    pub fn feed(&mut self, bytes: &[u8], fds: &[RawFd]) -> Result<(), FrameError> {
        self.buf.extend_from_slice(bytes);
        self.pending_fds.extend_from_slice(fds);
        self.process_pending()
    }

    /// Pop the next complete frame, if any.
    pub fn next_frame(&mut self) -> Option<Frame> {
        self.ready.pop_front()
    }

    fn process_pending(&mut self) -> Result<(), FrameError> {
        loop {
            if self.buf.len() < HEADER_LEN {
                return Ok(());
            }

            let mut header_bytes = [0u8; HEADER_LEN];
            header_bytes.copy_from_slice(&self.buf[..HEADER_LEN]);
            let header = FrameHeader::parse(&header_bytes).validate()?;

            let total = HEADER_LEN + header.length as usize;
            if self.buf.len() < total {
                return Ok(());
            }

            let payload = self.buf[HEADER_LEN..total].to_vec();
            self.buf.drain(..total);
            self.ready.push_back(Frame {
                payload,
                fds: std::mem::take(&mut self.pending_fds),
            });
        }
    }
}
