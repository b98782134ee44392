//! Server: accepts transport connections and fans events out.
//!
//! Each accepted connection gets its own [`Connection`] in server mode
//! (standalone, shared `RpcContext`).  Broadcasts go through every live
//! connection's mask filter, so subscribers only see what they asked for.

use std::sync::{Arc, Mutex as StdMutex};

use serde_json::Value;
use tracing::{info, warn};

use dispatcher_transport::{Listener, TransportError};

use crate::connection::{AuthHandler, Connection, ConnectionBuilder};
use crate::rpc::RpcContext;

/// Configures a [`Server`].
pub struct ServerBuilder {
    rpc: Arc<dyn RpcContext>,
    streaming: bool,
    auth_handler: Option<AuthHandler>,
}

impl ServerBuilder {
    pub fn new(rpc: Arc<dyn RpcContext>) -> Self {
        ServerBuilder {
            rpc,
            streaming: false,
            auth_handler: None,
        }
    }

    /// Allow streaming responses on accepted connections.
    pub fn streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }

    pub fn auth_handler(mut self, handler: AuthHandler) -> Self {
        self.auth_handler = Some(handler);
        self
    }

    /// Bind the listening endpoint (`unix://PATH` or `ws://HOST:PORT`).
    pub async fn bind(self, url: &str) -> Result<Server, TransportError> {
        let listener = dispatcher_transport::listen(url).await?;
        Ok(Server {
            inner: Arc::new(ServerInner {
                rpc: self.rpc,
                streaming: self.streaming,
                auth_handler: self.auth_handler,
                connections: StdMutex::new(Vec::new()),
                listener: tokio::sync::Mutex::new(Some(listener)),
            }),
        })
    }
}

/// A listening dispatcher endpoint.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    rpc: Arc<dyn RpcContext>,
    streaming: bool,
    auth_handler: Option<AuthHandler>,
    connections: StdMutex<Vec<Connection>>,
    listener: tokio::sync::Mutex<Option<Box<dyn Listener>>>,
}

impl Server {
    /// The bound endpoint (useful after binding port 0).
    pub async fn local_description(&self) -> Option<String> {
        self.inner
            .listener
            .lock()
            .await
            .as_ref()
            .map(|l| l.local_description())
    }

    /// Run the accept loop.  Consumes the listener; typically spawned.
    pub async fn serve(&self) -> Result<(), TransportError> {
        let mut listener = self
            .inner
            .listener
            .lock()
            .await
            .take()
            .ok_or(TransportError::Closed)?;
        info!(
            target: "dispatcher_core",
            endpoint = %listener.local_description(),
            "server listening"
        );

        loop {
            match listener.accept().await {
                Ok((transport, events)) => {
                    let mut builder = ConnectionBuilder::new()
                        .rpc(Arc::clone(&self.inner.rpc))
                        .streaming(self.inner.streaming)
                        .standalone(true);
                    if let Some(handler) = &self.inner.auth_handler {
                        builder = builder.auth_handler(Arc::clone(handler));
                    }
                    let conn = builder.wire(transport, events);
                    info!(
                        target: "dispatcher_core",
                        peer = %conn.local_description(),
                        "connection accepted"
                    );
                    self.track(conn);
                }
                Err(err) => {
                    warn!(target: "dispatcher_core", error = %err, "accept failed");
                    return Err(err);
                }
            }
        }
    }

    fn track(&self, conn: Connection) {
        self.inner
            .connections
            .lock()
            .expect("connection list lock")
            .push(conn.clone());

        // Drop the connection from the list once it closes.
        let inner = Arc::clone(&self.inner);
        let mut closed = conn.closed_watch();
        tokio::spawn(async move {
            let _ = closed.wait_for(|closed| *closed).await;
            inner
                .connections
                .lock()
                .expect("connection list lock")
                .retain(Connection::connected);
        });
    }

    /// Emit an event to every connection whose subscription masks match.
    pub async fn broadcast_event(&self, name: &str, args: Value) {
        let connections: Vec<Connection> = self
            .inner
            .connections
            .lock()
            .expect("connection list lock")
            .clone();
        for conn in connections {
            if let Err(err) = conn.emit_event_filtered(name, args.clone()).await {
                warn!(target: "dispatcher_core", error = %err, "broadcast emit failed");
            }
        }
    }

    pub fn connection_count(&self) -> usize {
        self.inner
            .connections
            .lock()
            .expect("connection list lock")
            .len()
    }
}
