//! Message envelope and the typed message sum.
//!
//! Every frame payload is one JSON object:
//!
//! ```json
//! { "namespace": "rpc", "name": "call", "id": "<uuid>", "args": { ... } }
//! ```
//!
//! `namespace`/`name` discriminate the kind; `args` shapes are per-kind.
//! The discriminator is a pair rather than a single tag, so packing is
//! explicit (`Message::into_envelope` / `Message::from_envelope`) and the
//! payload structs are plain serde types.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Error codes carried in `rpc/error` payloads (errno convention).
pub mod errnos {
    pub const ENOENT: i64 = 2;
    pub const EBADF: i64 = 9;
    pub const EBUSY: i64 = 16;
    pub const EINVAL: i64 = 22;
    pub const ECONNABORTED: i64 = 103;
    pub const ETIMEDOUT: i64 = 110;
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// The outer JSON object of every frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub namespace: String,
    pub name: String,
    pub id: String,
    #[serde(default)]
    pub args: Value,
}

impl Envelope {
    /// Parse a frame payload.  Anything that is valid JSON but lacks
    /// `namespace` or `name` (or is not an object) is a protocol error.
    pub fn parse(payload: &[u8]) -> Result<Self, ProtocolError> {
        let value: Value =
            serde_json::from_slice(payload).map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;
        let obj = value.as_object().ok_or(ProtocolError::NotAnObject)?;
        if !obj.contains_key("namespace") || !obj.contains_key("name") {
            return Err(ProtocolError::MissingDiscriminator);
        }
        serde_json::from_value(value).map_err(|e| ProtocolError::InvalidShape(e.to_string()))
    }

    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("envelope serialization is infallible")
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("request is not valid JSON: {0}")]
    InvalidJson(String),
    #[error("request is not a JSON object")]
    NotAnObject,
    #[error("request is missing namespace or name")]
    MissingDiscriminator,
    #[error("malformed request: {0}")]
    InvalidShape(String),
    #[error("unknown message {namespace}/{name}")]
    UnknownMessage { namespace: String, name: String },
}

// ---------------------------------------------------------------------------
// Payload shapes
// ---------------------------------------------------------------------------

/// `rpc/call` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallArgs {
    pub method: String,
    #[serde(default)]
    pub args: Value,
    #[serde(default)]
    pub view: bool,
}

/// `rpc/error` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcErrorPayload {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<Value>,
}

/// `rpc/fragment` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FragmentArgs {
    pub seqno: u64,
    pub fragment: Value,
}

/// `rpc/auth` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthUserArgs {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub check_password: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
}

/// `rpc/auth_service` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthServiceArgs {
    pub name: String,
}

/// `rpc/auth_token` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthTokenArgs {
    pub token: String,
}

/// One event inside `events/event` and `events/event_burst`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventArgs {
    pub name: String,
    #[serde(default)]
    pub args: Value,
}

/// `events/event_burst` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventBurstArgs {
    pub events: Vec<EventArgs>,
}

// ---------------------------------------------------------------------------
// Typed sum
// ---------------------------------------------------------------------------

/// All messages in the `rpc` namespace.
#[derive(Debug, Clone, PartialEq)]
pub enum RpcMessage {
    Call(CallArgs),
    Response(Value),
    Error(RpcErrorPayload),
    Fragment(FragmentArgs),
    /// `args` is the final seqno (count + 1).
    End(u64),
    /// `args` is the requested seqno.
    Continue(u64),
    Abort,
    Close,
    Auth(AuthUserArgs),
    AuthService(AuthServiceArgs),
    AuthToken(AuthTokenArgs),
}

/// All messages in the `events` namespace.
#[derive(Debug, Clone, PartialEq)]
pub enum EventsMessage {
    Event(EventArgs),
    EventBurst(EventBurstArgs),
    /// Masks are wildcard strings or `{"$regex": pattern}` objects.
    Subscribe(Vec<Value>),
    Unsubscribe(Vec<Value>),
    Logout,
}

/// A decoded message with its correlation id.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Rpc(RpcMessage),
    Events(EventsMessage),
}

impl Message {
    /// Decode a typed message from an envelope.
    pub fn from_envelope(env: &Envelope) -> Result<Message, ProtocolError> {
        let args = env.args.clone();
        let shape = |e: serde_json::Error| ProtocolError::InvalidShape(e.to_string());

        let msg = match (env.namespace.as_str(), env.name.as_str()) {
            ("rpc", "call") => Message::Rpc(RpcMessage::Call(serde_json::from_value(args).map_err(shape)?)),
            ("rpc", "response") => Message::Rpc(RpcMessage::Response(args)),
            ("rpc", "error") => Message::Rpc(RpcMessage::Error(serde_json::from_value(args).map_err(shape)?)),
            ("rpc", "fragment") => {
                Message::Rpc(RpcMessage::Fragment(serde_json::from_value(args).map_err(shape)?))
            }
            ("rpc", "end") => Message::Rpc(RpcMessage::End(serde_json::from_value(args).map_err(shape)?)),
            ("rpc", "continue") => {
                Message::Rpc(RpcMessage::Continue(serde_json::from_value(args).map_err(shape)?))
            }
            ("rpc", "abort") => Message::Rpc(RpcMessage::Abort),
            ("rpc", "close") => Message::Rpc(RpcMessage::Close),
            ("rpc", "auth") => Message::Rpc(RpcMessage::Auth(serde_json::from_value(args).map_err(shape)?)),
            ("rpc", "auth_service") => {
                Message::Rpc(RpcMessage::AuthService(serde_json::from_value(args).map_err(shape)?))
            }
            ("rpc", "auth_token") => {
                Message::Rpc(RpcMessage::AuthToken(serde_json::from_value(args).map_err(shape)?))
            }
            ("events", "event") => {
                Message::Events(EventsMessage::Event(serde_json::from_value(args).map_err(shape)?))
            }
            ("events", "event_burst") => {
                Message::Events(EventsMessage::EventBurst(serde_json::from_value(args).map_err(shape)?))
            }
            ("events", "subscribe") => {
                Message::Events(EventsMessage::Subscribe(serde_json::from_value(args).map_err(shape)?))
            }
            ("events", "unsubscribe") => {
                Message::Events(EventsMessage::Unsubscribe(serde_json::from_value(args).map_err(shape)?))
            }
            ("events", "logout") => Message::Events(EventsMessage::Logout),
            (namespace, name) => {
                return Err(ProtocolError::UnknownMessage {
                    namespace: namespace.to_owned(),
                    name: name.to_owned(),
                });
            }
        };
        Ok(msg)
    }

    /// Pack a typed message into an envelope with the given id.
    pub fn into_envelope(self, id: String) -> Envelope {
        let (namespace, name, args) = match self {
            Message::Rpc(rpc) => {
                let (name, args) = match rpc {
                    RpcMessage::Call(a) => ("call", to_value(&a)),
                    RpcMessage::Response(v) => ("response", v),
                    RpcMessage::Error(a) => ("error", to_value(&a)),
                    RpcMessage::Fragment(a) => ("fragment", to_value(&a)),
                    RpcMessage::End(seqno) => ("end", Value::from(seqno)),
                    RpcMessage::Continue(seqno) => ("continue", Value::from(seqno)),
                    RpcMessage::Abort => ("abort", Value::Null),
                    RpcMessage::Close => ("close", Value::Null),
                    RpcMessage::Auth(a) => ("auth", to_value(&a)),
                    RpcMessage::AuthService(a) => ("auth_service", to_value(&a)),
                    RpcMessage::AuthToken(a) => ("auth_token", to_value(&a)),
                };
                ("rpc", name, args)
            }
            Message::Events(events) => {
                let (name, args) = match events {
                    EventsMessage::Event(a) => ("event", to_value(&a)),
                    EventsMessage::EventBurst(a) => ("event_burst", to_value(&a)),
                    EventsMessage::Subscribe(masks) => ("subscribe", Value::Array(masks)),
                    EventsMessage::Unsubscribe(masks) => ("unsubscribe", Value::Array(masks)),
                    EventsMessage::Logout => ("logout", Value::Null),
                };
                ("events", name, args)
            }
        };

        Envelope {
            namespace: namespace.to_owned(),
            name: name.to_owned(),
            id,
            args,
        }
    }
}

fn to_value<T: Serialize>(payload: &T) -> Value {
    serde_json::to_value(payload).expect("payload serialization is infallible")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn round_trip(msg: Message) -> Message {
        let env = msg.into_envelope("abc-123".to_owned());
        let parsed = Envelope::parse(&env.encode()).unwrap();
        assert_eq!(parsed.id, "abc-123");
        Message::from_envelope(&parsed).unwrap()
    }

    #[test]
    fn call_round_trip() {
        let msg = Message::Rpc(RpcMessage::Call(CallArgs {
            method: "test.hello".to_owned(),
            args: json!(["freenas"]),
            view: false,
        }));
        assert_eq!(round_trip(msg.clone()), msg);
    }

    #[test]
    fn error_round_trip_keeps_extra() {
        let msg = Message::Rpc(RpcMessage::Error(RpcErrorPayload {
            code: errnos::EINVAL,
            message: "Invalid request".to_owned(),
            extra: Some(json!({"field": "method"})),
        }));
        assert_eq!(round_trip(msg.clone()), msg);
    }

    #[test]
    fn end_and_continue_carry_bare_seqno() {
        let env = Message::Rpc(RpcMessage::End(11)).into_envelope("x".to_owned());
        assert_eq!(env.args, json!(11));
        let env = Message::Rpc(RpcMessage::Continue(4)).into_envelope("x".to_owned());
        assert_eq!(env.name, "continue");
        assert_eq!(env.args, json!(4));
    }

    #[test]
    fn abort_and_close_have_null_args() {
        for msg in [
            Message::Rpc(RpcMessage::Abort),
            Message::Rpc(RpcMessage::Close),
            Message::Events(EventsMessage::Logout),
        ] {
            let env = msg.clone().into_envelope("x".to_owned());
            assert_eq!(env.args, Value::Null);
            assert_eq!(round_trip(msg.clone()), msg);
        }
    }

    #[test]
    fn event_burst_round_trip() {
        let msg = Message::Events(EventsMessage::EventBurst(EventBurstArgs {
            events: vec![
                EventArgs {
                    name: "server.started".to_owned(),
                    args: json!({}),
                },
                EventArgs {
                    name: "client.ping".to_owned(),
                    args: json!({"n": 1}),
                },
            ],
        }));
        assert_eq!(round_trip(msg.clone()), msg);
    }

    #[test]
    fn subscribe_accepts_regex_masks() {
        let env = Envelope {
            namespace: "events".to_owned(),
            name: "subscribe".to_owned(),
            id: "x".to_owned(),
            args: json!(["server.*", {"$regex": "task\\.[0-9]+"}]),
        };
        match Message::from_envelope(&env).unwrap() {
            Message::Events(EventsMessage::Subscribe(masks)) => assert_eq!(masks.len(), 2),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn missing_discriminator_is_rejected() {
        assert!(matches!(
            Envelope::parse(br#"{"name": "call", "id": "x"}"#),
            Err(ProtocolError::MissingDiscriminator)
        ));
        assert!(matches!(
            Envelope::parse(b"[1, 2]"),
            Err(ProtocolError::NotAnObject)
        ));
        assert!(matches!(
            Envelope::parse(b"not json"),
            Err(ProtocolError::InvalidJson(_))
        ));
    }

    #[test]
    fn unknown_message_is_rejected() {
        let env = Envelope {
            namespace: "rpc".to_owned(),
            name: "bogus".to_owned(),
            id: "x".to_owned(),
            args: Value::Null,
        };
        assert!(matches!(
            Message::from_envelope(&env),
            Err(ProtocolError::UnknownMessage { .. })
        ));
    }

    #[test]
    fn call_defaults_view_to_false() {
        let env = Envelope {
            namespace: "rpc".to_owned(),
            name: "call".to_owned(),
            id: "x".to_owned(),
            args: json!({"method": "m", "args": null}),
        };
        match Message::from_envelope(&env).unwrap() {
            Message::Rpc(RpcMessage::Call(call)) => assert!(!call.view),
            other => panic!("unexpected {other:?}"),
        }
    }
}
