// dispatcher-test-utils: Back-to-back wiring helpers and the canned test
// service used by the integration suites.
//
// A back-to-back pair is two connections over a connected socketpair, one
// of them with the test service bound.  The socketpair ends speak the full
// unix contract (descriptor passing, peer credentials), so FD-passing
// scenarios work without a listening socket.

use std::os::fd::RawFd;
use std::sync::Arc;

use serde_json::{Value, json};

use dispatcher_core::connection::{Connection, ConnectionBuilder};
use dispatcher_core::rpc::{
    DispatchContext, RpcContext, RpcError, RpcOutcome, RpcRegistry, ValueStream,
};
use dispatcher_proto::errnos;

/// A wired pair of connections: `server` has the test service bound,
/// `client` is a plain streaming-capable peer.
pub struct BackToBackPair {
    pub server: Connection,
    pub client: Connection,
}

/// Wire a back-to-back pair with the canned [`test_context`] service.
///
/// `streaming` controls whether the serving side answers generator
/// methods with streaming responses or materialized lists.
pub async fn back_to_back(streaming: bool) -> BackToBackPair {
    back_to_back_with(test_context(), streaming).await
}

/// Wire a back-to-back pair around an arbitrary RPC context.
pub async fn back_to_back_with(context: Arc<dyn RpcContext>, streaming: bool) -> BackToBackPair {
    let ((server_transport, server_events), (client_transport, client_events)) =
        dispatcher_transport::unix::pair()
            .await
            .expect("socketpair wiring");

    let server = ConnectionBuilder::new()
        .rpc(context)
        .streaming(streaming)
        .standalone(true)
        .wire(server_transport, server_events);
    let client = ConnectionBuilder::new()
        .streaming(true)
        .wire(client_transport, client_events);

    BackToBackPair { server, client }
}

/// The canned test service:
///
/// - `test.hello(arg)` → `"Hello World, <arg>"`
/// - `test.iterator(count)` → `0, 2, …, (count-1)*2` (generator)
/// - `test.echo(args)` → args unchanged
/// - `test.never(…)` → never responds
/// - `fs.hand_off(fd)` → `{fd, dev, ino}` of the received descriptor
pub fn test_context() -> Arc<TestContext> {
    let registry = RpcRegistry::new();

    registry.register("test.hello", |args| {
        let arg = args
            .get(0)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned();
        Ok(Value::String(format!("Hello World, {arg}")))
    });

    registry.register_streaming("test.iterator", |args| {
        let count = args.get(0).and_then(Value::as_u64).unwrap_or(0);
        Ok(Box::new((0..count).map(|i| Ok(Value::from(i * 2)))) as ValueStream)
    });

    registry.register("test.echo", Ok);

    registry.register("fs.hand_off", |args| {
        let fd = args
            .get(0)
            .and_then(|v| v.get("$fd"))
            .and_then(Value::as_i64)
            .ok_or_else(|| RpcError::new(errnos::EINVAL, "expected a file descriptor"))? as RawFd;
        let (dev, ino) = stat_fd(fd)?;
        Ok(json!({ "fd": fd, "dev": dev, "ino": ino }))
    });

    Arc::new(TestContext { registry })
}

/// Wraps the registry to add `test.never`, a method that accepts the call
/// and never produces a reply (for timeout scenarios).
pub struct TestContext {
    registry: Arc<RpcRegistry>,
}

impl TestContext {
    pub fn registry(&self) -> &Arc<RpcRegistry> {
        &self.registry
    }
}

#[async_trait::async_trait]
impl RpcContext for TestContext {
    async fn dispatch(
        &self,
        method: &str,
        args: Value,
        ctx: DispatchContext,
    ) -> Result<RpcOutcome, RpcError> {
        if method == "test.never" {
            std::future::pending::<()>().await;
            unreachable!("pending future never resolves");
        }
        self.registry.dispatch(method, args, ctx).await
    }
}

/// `st_dev`/`st_ino` of an open descriptor, without closing it.
pub fn stat_fd(fd: RawFd) -> Result<(u64, u64), RpcError> {
    use std::os::fd::{FromRawFd, IntoRawFd};
    use std::os::unix::fs::MetadataExt;

    let file = unsafe { std::fs::File::from_raw_fd(fd) };
    let meta = file.metadata();
    // Hand the descriptor back before inspecting the result.
    let _ = file.into_raw_fd();
    let meta = meta.map_err(|e| RpcError::new(errnos::EBADF, format!("fstat failed: {e}")))?;
    Ok((meta.dev(), meta.ino()))
}
