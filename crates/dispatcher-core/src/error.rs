//! Connection-level error taxonomy.

use std::sync::Arc;

/// Failure kinds surfaced through the connection's error callback.
///
/// Protocol errors do not tear the connection down unless the byte stream
/// itself is corrupt; RPC domain errors terminate only the affected call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientError {
    /// Peer sent malformed JSON or a message without `namespace`/`name`.
    InvalidJsonResponse,
    ConnectionTimeout,
    ConnectionClosed,
    /// A local call deadline expired.
    RpcCallTimeout,
    /// The peer answered a call with `rpc/error`.
    RpcCallError,
    /// A streaming call was used after `rpc/close`.
    RpcCallClosed,
    /// A response or fragment arrived for an unknown id.
    SpuriousRpcResponse,
    /// The peer terminated the session with `events/logout`.
    Logout,
    Other,
}

/// Callback invoked on connection-level failures.
pub type ErrorCallback = Arc<dyn Fn(ClientError) + Send + Sync>;

/// Callback invoked for every delivered event, after registered handlers.
pub type EventCallback = Arc<dyn Fn(&str, &serde_json::Value) + Send + Sync>;
