//! WebSocket transport.
//!
//! The WS layer supplies its own framing, so payloads travel as one text
//! message each — no magic header.  Descriptors and credentials are not
//! available on this transport.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::tungstenite::protocol::Message as WsFrame;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, warn};

use dispatcher_proto::FileDescriptor;

use crate::{
    CloseReason, EVENT_CHANNEL_CAPACITY, Listener, ParsedUrl, Transport, TransportError,
    TransportEvent, TransportEvents,
};

/// Path served by a dispatcher WS endpoint.
pub const DEFAULT_SOCKET_PATH: &str = "/dispatcher/socket";

const DEFAULT_WS_PORT: u16 = 80;

/// Connect to `ws://HOST:PORT/dispatcher/socket`.
pub async fn connect(
    url: &ParsedUrl,
) -> Result<(Box<dyn Transport>, TransportEvents), TransportError> {
    let host = url.host.as_deref().unwrap_or("127.0.0.1");
    let port = url.port.unwrap_or(DEFAULT_WS_PORT);
    let path = if url.path.is_empty() {
        DEFAULT_SOCKET_PATH
    } else {
        url.path.as_str()
    };
    let ws_url = format!("ws://{host}:{port}{path}");

    let (stream, _response) = tokio_tungstenite::connect_async(&ws_url)
        .await
        .map_err(|e| TransportError::Connect(format!("{ws_url}: {e}")))?;
    from_ws_stream(stream, ws_url).await
}

/// Bind a `ws://HOST:PORT` listener.
pub async fn listen(url: &ParsedUrl) -> Result<Box<dyn Listener>, TransportError> {
    let host = url.host.as_deref().unwrap_or("127.0.0.1");
    let port = url.port.unwrap_or(DEFAULT_WS_PORT);
    let addr = format!("{host}:{port}");
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| TransportError::Connect(format!("{addr}: {e}")))?;
    Ok(Box::new(WsListener { listener }))
}

// ---------------------------------------------------------------------------
// Transport over any WS stream (client or accepted server side)
// ---------------------------------------------------------------------------

pub(crate) async fn from_ws_stream<S>(
    stream: WebSocketStream<S>,
    description: String,
) -> Result<(Box<dyn Transport>, TransportEvents), TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, source) = stream.split();
    let sink = Arc::new(Mutex::new(sink));
    let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    tx.send(TransportEvent::Open { credentials: None })
        .await
        .map_err(|_| TransportError::Closed)?;

    let transport = WsTransport {
        sink: Arc::clone(&sink),
        closed: Arc::new(AtomicBool::new(false)),
        description,
    };
    tokio::spawn(receive_loop(source, sink, tx));
    Ok((Box::new(transport), rx))
}

struct WsTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    sink: Arc<Mutex<SplitSink<WebSocketStream<S>, WsFrame>>>,
    closed: Arc<AtomicBool>,
    description: String,
}

#[async_trait::async_trait]
impl<S> Transport for WsTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send(&self, payload: Vec<u8>, _fds: Vec<FileDescriptor>) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        let text = String::from_utf8(payload).map_err(|e| TransportError::Send(e.to_string()))?;
        let mut sink = self.sink.lock().await;
        sink.send(WsFrame::Text(text.into()))
            .await
            .map_err(|e| {
                self.closed.store(true, Ordering::Release);
                TransportError::Send(e.to_string())
            })
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let mut sink = self.sink.lock().await;
            let _ = sink.send(WsFrame::Close(None)).await;
            let _ = sink.close().await;
        }
    }

    fn fd_passing(&self) -> bool {
        false
    }

    fn local_description(&self) -> String {
        self.description.clone()
    }
}

async fn receive_loop<S>(
    mut source: SplitStream<WebSocketStream<S>>,
    sink: Arc<Mutex<SplitSink<WebSocketStream<S>, WsFrame>>>,
    tx: mpsc::Sender<TransportEvent>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let reason = loop {
        match source.next().await {
            None => break CloseReason::Normal,
            Some(Err(e)) => break CloseReason::Error(e.to_string()),
            Some(Ok(frame)) => match frame {
                WsFrame::Text(text) => {
                    if tx
                        .send(TransportEvent::Message {
                            payload: text.as_bytes().to_vec(),
                            fds: Vec::new(),
                        })
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
                WsFrame::Binary(bytes) => {
                    if tx
                        .send(TransportEvent::Message {
                            payload: bytes.to_vec(),
                            fds: Vec::new(),
                        })
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
                WsFrame::Ping(data) => {
                    debug!(target: "dispatcher_transport", "ws ping");
                    let mut sink = sink.lock().await;
                    let _ = sink.send(WsFrame::Pong(data)).await;
                }
                WsFrame::Close(_) => break CloseReason::Normal,
                _ => {}
            },
        }
    };

    let _ = tx.send(TransportEvent::Closed { reason }).await;
}

// ---------------------------------------------------------------------------
// Listener
// ---------------------------------------------------------------------------

struct WsListener {
    listener: TcpListener,
}

#[async_trait::async_trait]
impl Listener for WsListener {
    async fn accept(&mut self) -> Result<(Box<dyn Transport>, TransportEvents), TransportError> {
        let (stream, peer) = self
            .listener
            .accept()
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let ws = tokio_tungstenite::accept_async(stream)
            .await
            .map_err(|e| {
                warn!(target: "dispatcher_transport", error = %e, "ws handshake failed");
                TransportError::Connect(e.to_string())
            })?;
        from_ws_stream(ws, format!("ws://{peer}")).await
    }

    fn local_description(&self) -> String {
        self.listener
            .local_addr()
            .map(|a| format!("ws://{a}"))
            .unwrap_or_else(|_| "ws://?".to_owned())
    }
}
