//! In-band file-descriptor placeholders.
//!
//! Descriptors cannot travel inside JSON; FD-capable transports carry them
//! as ancillary data next to the frame.  Before a frame is sent, the
//! channel serializer walks the `args` tree depth-first, pops every
//! [`FileDescriptor`] leaf into the outgoing descriptor array and leaves
//! `{"$fd": i}` in its place, where `i` is the array index.  On receive
//! the walk runs in reverse: `{"$fd": i}` becomes the `i`-th received
//! descriptor, or `null` when the index is out of range (a bad index
//! never fails the whole message).
//!
//! The local (pre-send / post-receive) form of a descriptor is
//! `{"$fd": <raw fd>}`, optionally with `"$borrow": true` when the sender
//! keeps ownership.  The `$borrow` key never reaches the wire.

use std::os::fd::RawFd;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value, json};

/// A file descriptor referenced from a message payload.
///
/// `close_on_send` mirrors the sender-side ownership flag: when set, the
/// transport closes the descriptor after it has been transmitted.
/// Descriptors produced by the receive path always own their fd.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileDescriptor {
    pub raw: RawFd,
    pub close_on_send: bool,
}

impl FileDescriptor {
    /// A descriptor the transport closes after sending.
    pub fn owned(raw: RawFd) -> Self {
        FileDescriptor {
            raw,
            close_on_send: true,
        }
    }

    /// A descriptor the caller keeps open after sending.
    pub fn borrowed(raw: RawFd) -> Self {
        FileDescriptor {
            raw,
            close_on_send: false,
        }
    }
}

impl Serialize for FileDescriptor {
    fn serialize<S: Serializer>(&self, ser: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;
        let mut map = ser.serialize_map(None)?;
        map.serialize_entry("$fd", &self.raw)?;
        if !self.close_on_send {
            map.serialize_entry("$borrow", &true)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for FileDescriptor {
    fn deserialize<D: Deserializer<'de>>(de: D) -> Result<Self, D::Error> {
        let map = Map::deserialize(de)?;
        let raw = map
            .get("$fd")
            .and_then(Value::as_i64)
            .ok_or_else(|| D::Error::custom("expected {\"$fd\": N}"))?;
        let borrow = map.get("$borrow").and_then(Value::as_bool).unwrap_or(false);
        Ok(FileDescriptor {
            raw: raw as RawFd,
            close_on_send: !borrow,
        })
    }
}

/// Returns the descriptor if `value` is a local-form placeholder.
fn as_local_fd(value: &Value) -> Option<FileDescriptor> {
    let map = value.as_object()?;
    let raw = map.get("$fd")?.as_i64()?;
    match map.len() {
        1 => Some(FileDescriptor::owned(raw as RawFd)),
        2 if map.contains_key("$borrow") => {
            let borrow = map["$borrow"].as_bool().unwrap_or(false);
            Some(FileDescriptor {
                raw: raw as RawFd,
                close_on_send: !borrow,
            })
        }
        _ => None,
    }
}

/// Returns the placeholder index if `value` is a wire-form `{"$fd": i}`.
fn as_wire_index(value: &Value) -> Option<usize> {
    let map = value.as_object()?;
    if map.len() != 1 {
        return None;
    }
    usize::try_from(map.get("$fd")?.as_i64()?).ok()
}

// ---------------------------------------------------------------------------
// Serializer trait and the two variants
// ---------------------------------------------------------------------------

/// Maps in-band descriptor placeholders to and from the transport's
/// out-of-band representation.
pub trait ChannelSerializer: Send + Sync {
    /// Walk `args` depth-first, extracting descriptors and rewriting each
    /// leaf to the indexed wire form.  Returns the ancillary array for the
    /// outgoing frame.
    fn collect_fds(&self, args: &mut Value) -> Vec<FileDescriptor>;

    /// Walk `args`, substituting wire placeholders with the descriptors
    /// that arrived alongside the frame.
    fn replace_fds(&self, args: &mut Value, fds: &[RawFd]);
}

/// The index-based serializer used by SCM_RIGHTS-capable transports.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnixChannelSerializer;

impl UnixChannelSerializer {
    fn collect_into(value: &mut Value, out: &mut Vec<FileDescriptor>) {
        match value {
            Value::Object(map) => {
                for (_, v) in map.iter_mut() {
                    Self::visit(v, out);
                }
            }
            Value::Array(items) => {
                for v in items.iter_mut() {
                    Self::visit(v, out);
                }
            }
            _ => {}
        }
    }

    fn visit(value: &mut Value, out: &mut Vec<FileDescriptor>) {
        if let Some(fd) = as_local_fd(value) {
            *value = json!({ "$fd": out.len() });
            out.push(fd);
        } else {
            Self::collect_into(value, out);
        }
    }

    fn replace_into(value: &mut Value, fds: &[RawFd]) {
        match value {
            Value::Object(map) => {
                for (_, v) in map.iter_mut() {
                    Self::substitute(v, fds);
                }
            }
            Value::Array(items) => {
                for v in items.iter_mut() {
                    Self::substitute(v, fds);
                }
            }
            _ => {}
        }
    }

    fn substitute(value: &mut Value, fds: &[RawFd]) {
        if let Some(idx) = as_wire_index(value) {
            *value = match fds.get(idx) {
                Some(fd) => json!({ "$fd": fd }),
                None => Value::Null,
            };
        } else {
            Self::replace_into(value, fds);
        }
    }
}

impl ChannelSerializer for UnixChannelSerializer {
    fn collect_fds(&self, args: &mut Value) -> Vec<FileDescriptor> {
        let mut out = Vec::new();
        Self::collect_into(args, &mut out);
        out
    }

    fn replace_fds(&self, args: &mut Value, fds: &[RawFd]) {
        Self::replace_into(args, fds);
    }
}

/// Channel-multiplexed variant: `{"$fd": N}` carries a logical channel id
/// of a multiplexed socket rather than an index into the ancillary array.
///
/// The wire form is identical; only the mapping rule changes, so the
/// mapping itself is injected as a pair of lookups.
pub struct MuxChannelSerializer {
    fd_to_channel: Box<dyn Fn(RawFd) -> i64 + Send + Sync>,
    channel_to_fd: Box<dyn Fn(i64) -> RawFd + Send + Sync>,
}

impl MuxChannelSerializer {
    pub fn new(
        fd_to_channel: impl Fn(RawFd) -> i64 + Send + Sync + 'static,
        channel_to_fd: impl Fn(i64) -> RawFd + Send + Sync + 'static,
    ) -> Self {
        MuxChannelSerializer {
            fd_to_channel: Box::new(fd_to_channel),
            channel_to_fd: Box::new(channel_to_fd),
        }
    }

    fn walk(&self, value: &mut Value, sending: bool, out: &mut Vec<FileDescriptor>) {
        if sending {
            if let Some(fd) = as_local_fd(value) {
                *value = json!({ "$fd": (self.fd_to_channel)(fd.raw) });
                out.push(fd);
                return;
            }
        } else if let Some(channel) = value
            .as_object()
            .filter(|map| map.len() == 1)
            .and_then(|map| map.get("$fd"))
            .and_then(Value::as_i64)
        {
            *value = json!({ "$fd": (self.channel_to_fd)(channel) });
            return;
        }

        match value {
            Value::Object(map) => {
                for (_, v) in map.iter_mut() {
                    self.walk(v, sending, out);
                }
            }
            Value::Array(items) => {
                for v in items.iter_mut() {
                    self.walk(v, sending, out);
                }
            }
            _ => {}
        }
    }
}

impl ChannelSerializer for MuxChannelSerializer {
    fn collect_fds(&self, args: &mut Value) -> Vec<FileDescriptor> {
        let mut out = Vec::new();
        self.walk(args, true, &mut out);
        out
    }

    fn replace_fds(&self, args: &mut Value, _fds: &[RawFd]) {
        let mut unused = Vec::new();
        self.walk(args, false, &mut unused);
    }
}
