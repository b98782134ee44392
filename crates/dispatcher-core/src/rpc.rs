//! The RPC dispatch seam.
//!
//! The connection never interprets method names itself; inbound calls go
//! to a pluggable [`RpcContext`].  Method registration, argument
//! validation and schema discovery belong to the context implementation.
//! [`RpcRegistry`] is a minimal closure-based implementation sufficient
//! for servers and peer-to-peer endpoints.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use dispatcher_proto::RpcErrorPayload;
use dispatcher_proto::errnos;
use dispatcher_transport::Credentials;
use serde_json::Value;

/// A domain RPC failure: the `rpc/error` payload in native form.
///
/// `extra` carries structured details the peer attached, if any.
#[derive(Debug, Clone, thiserror::Error)]
#[error("rpc error {code}: {message}")]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    pub extra: Option<Value>,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        RpcError {
            code,
            message: message.into(),
            extra: None,
        }
    }

    pub fn with_extra(code: i64, message: impl Into<String>, extra: Value) -> Self {
        RpcError {
            code,
            message: message.into(),
            extra: Some(extra),
        }
    }

    pub(crate) fn from_payload(payload: RpcErrorPayload) -> Self {
        RpcError {
            code: payload.code,
            message: payload.message,
            extra: payload.extra,
        }
    }

    pub(crate) fn into_payload(self) -> RpcErrorPayload {
        RpcErrorPayload {
            code: self.code,
            message: self.message,
            extra: self.extra,
        }
    }
}

/// A lazy sequence of values produced by a streaming method.
///
/// Items are pulled one `continue` at a time on a dispatch worker; a
/// mid-stream `Err` is forwarded to the caller as `rpc/error`.
pub type ValueStream = Box<dyn Iterator<Item = Result<Value, RpcError>> + Send>;

/// What a dispatch produced: a plain value or a lazy sequence.
pub enum RpcOutcome {
    Value(Value),
    Stream(ValueStream),
}

/// Call metadata handed to [`RpcContext::dispatch`].
#[derive(Debug, Clone)]
pub struct DispatchContext {
    /// Whether the connection may answer with a streaming response.  When
    /// false, contexts must materialize lazy sequences into one value.
    pub streaming: bool,
    /// Credentials of the calling peer, on transports that provide them.
    pub credentials: Option<Credentials>,
}

/// Dispatch target for inbound `rpc/call` messages.
#[async_trait::async_trait]
pub trait RpcContext: Send + Sync {
    async fn dispatch(
        &self,
        method: &str,
        args: Value,
        ctx: DispatchContext,
    ) -> Result<RpcOutcome, RpcError>;
}

// ---------------------------------------------------------------------------
// RpcRegistry
// ---------------------------------------------------------------------------

type UnaryFn = Arc<dyn Fn(Value) -> Result<Value, RpcError> + Send + Sync>;
type StreamFn = Arc<dyn Fn(Value) -> Result<ValueStream, RpcError> + Send + Sync>;

#[derive(Clone)]
enum Method {
    Unary(UnaryFn),
    Streaming(StreamFn),
}

/// Closure-based method table keyed by `service.method` names.
#[derive(Default)]
pub struct RpcRegistry {
    methods: RwLock<HashMap<String, Method>>,
}

impl RpcRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(RpcRegistry::default())
    }

    /// Register a unary method.
    pub fn register(
        &self,
        name: impl Into<String>,
        f: impl Fn(Value) -> Result<Value, RpcError> + Send + Sync + 'static,
    ) {
        self.methods
            .write()
            .expect("method table lock")
            .insert(name.into(), Method::Unary(Arc::new(f)));
    }

    /// Register a streaming method returning a lazy sequence.
    pub fn register_streaming(
        &self,
        name: impl Into<String>,
        f: impl Fn(Value) -> Result<ValueStream, RpcError> + Send + Sync + 'static,
    ) {
        self.methods
            .write()
            .expect("method table lock")
            .insert(name.into(), Method::Streaming(Arc::new(f)));
    }

    /// Remove every method of `service`.
    pub fn unregister_service(&self, service: &str) {
        let prefix = format!("{service}.");
        self.methods
            .write()
            .expect("method table lock")
            .retain(|name, _| !name.starts_with(&prefix));
    }

    fn lookup(&self, method: &str) -> Option<Method> {
        self.methods
            .read()
            .expect("method table lock")
            .get(method)
            .cloned()
    }
}

#[async_trait::async_trait]
impl RpcContext for RpcRegistry {
    async fn dispatch(
        &self,
        method: &str,
        args: Value,
        ctx: DispatchContext,
    ) -> Result<RpcOutcome, RpcError> {
        let Some(entry) = self.lookup(method) else {
            return Err(RpcError::new(
                errnos::ENOENT,
                format!("Method {method} not found"),
            ));
        };

        match entry {
            Method::Unary(f) => Ok(RpcOutcome::Value(f(args)?)),
            Method::Streaming(f) => {
                let stream = f(args)?;
                if ctx.streaming {
                    Ok(RpcOutcome::Stream(stream))
                } else {
                    // Compatibility: materialize the sequence for peers
                    // that did not negotiate streaming.
                    let values: Result<Vec<Value>, RpcError> = stream.collect();
                    Ok(RpcOutcome::Value(Value::Array(values?)))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(streaming: bool) -> DispatchContext {
        DispatchContext {
            streaming,
            credentials: None,
        }
    }

    #[tokio::test]
    async fn dispatches_unary_method() {
        let registry = RpcRegistry::new();
        registry.register("test.hello", |args| {
            let arg = args[0].as_str().unwrap_or_default().to_owned();
            Ok(Value::String(format!("Hello World, {arg}")))
        });

        let out = registry
            .dispatch("test.hello", json!(["freenas"]), ctx(false))
            .await
            .unwrap();
        match out {
            RpcOutcome::Value(v) => assert_eq!(v, "Hello World, freenas"),
            RpcOutcome::Stream(_) => panic!("expected a value"),
        }
    }

    #[tokio::test]
    async fn unknown_method_is_enoent() {
        let registry = RpcRegistry::new();
        let err = registry
            .dispatch("nope.nothing", Value::Null, ctx(false))
            .await
            .err()
            .unwrap();
        assert_eq!(err.code, errnos::ENOENT);
    }

    #[tokio::test]
    async fn streaming_method_materializes_without_streaming() {
        let registry = RpcRegistry::new();
        registry.register_streaming("test.iterator", |args| {
            let count = args[0].as_u64().unwrap_or(0);
            Ok(Box::new((0..count).map(|i| Ok(Value::from(i * 2)))) as ValueStream)
        });

        let out = registry
            .dispatch("test.iterator", json!([5]), ctx(false))
            .await
            .unwrap();
        match out {
            RpcOutcome::Value(v) => assert_eq!(v, json!([0, 2, 4, 6, 8])),
            RpcOutcome::Stream(_) => panic!("expected materialized list"),
        }
    }

    #[tokio::test]
    async fn streaming_method_streams_when_negotiated() {
        let registry = RpcRegistry::new();
        registry.register_streaming("test.iterator", |args| {
            let count = args[0].as_u64().unwrap_or(0);
            Ok(Box::new((0..count).map(|i| Ok(Value::from(i * 2)))) as ValueStream)
        });

        let out = registry
            .dispatch("test.iterator", json!([3]), ctx(true))
            .await
            .unwrap();
        assert!(matches!(out, RpcOutcome::Stream(_)));
    }

    #[tokio::test]
    async fn unregister_service_removes_methods() {
        let registry = RpcRegistry::new();
        registry.register("test.hello", |_| Ok(Value::Null));
        registry.register("other.kept", |_| Ok(Value::Null));
        registry.unregister_service("test");
        assert!(
            registry
                .dispatch("test.hello", Value::Null, ctx(false))
                .await
                .is_err()
        );
        assert!(
            registry
                .dispatch("other.kept", Value::Null, ctx(false))
                .await
                .is_ok()
        );
    }
}
