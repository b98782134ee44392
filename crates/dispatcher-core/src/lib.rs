// dispatcher-core: Connection state machine, call registry, streaming
// protocol, event machinery and the server wrapper.

pub mod connection;
pub mod error;
pub mod events;
pub mod logging;
pub mod rpc;
pub mod server;
pub mod streaming;

pub use connection::{
    AuthHandler, AuthRequest, CallCallback, CallOptions, CallResult, CallbackEvent, Connection,
    ConnectionBuilder, DEFAULT_CALL_TIMEOUT,
};
pub use error::{ClientError, ErrorCallback, EventCallback};
pub use events::{EventMask, HandlerToken};
pub use rpc::{DispatchContext, RpcContext, RpcError, RpcOutcome, RpcRegistry, ValueStream};
pub use server::{Server, ServerBuilder};
pub use streaming::{StreamingCall, StreamingView};
