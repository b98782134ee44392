// dispatcher-proto: Wire model for the dispatcher message bus.
//
// Every message is a length-prefixed UTF-8 JSON frame.  The JSON object
// carries a `namespace`/`name` pair used for discriminated dispatch, an
// `id` correlating requests with responses, and an `args` payload whose
// shape depends on the message kind.

pub mod encoding;
pub mod fdpass;
pub mod frame;
pub mod message;

pub use encoding::{Binary, Password, RegexPattern, Timestamp};
pub use fdpass::{ChannelSerializer, FileDescriptor, MuxChannelSerializer, UnixChannelSerializer};
pub use frame::{
    FRAME_MAGIC, Frame, FrameError, FrameHeader, FrameReader, HEADER_LEN, PERMISSION_DENIED_MAGIC,
    encode_frame,
};
pub use message::{
    AuthServiceArgs, AuthTokenArgs, AuthUserArgs, CallArgs, Envelope, EventArgs, EventBurstArgs,
    EventsMessage, FragmentArgs, Message, ProtocolError, RpcErrorPayload, RpcMessage, errnos,
};
