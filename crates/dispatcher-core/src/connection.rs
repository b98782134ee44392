//! The connection state machine and its multiplexed call registry.
//!
//! One `Connection` is a duplex session over a framed transport.  It acts
//! as client and server at once: outbound calls are correlated through the
//! pending-call table, inbound calls are dispatched to the bound
//! [`RpcContext`], and events flow through a single ordered delivery
//! queue.  Back-to-back wiring (two connections over a socketpair) needs
//! nothing special.
//!
//! # Tasks
//! Each connection owns a transport-receive task (frame decode, descriptor
//! substitution, routing by id) and one event-delivery worker.  Inbound
//! dispatches and async event handlers run on spawned workers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};
use uuid::Uuid;

use dispatcher_proto::{
    AuthServiceArgs, AuthTokenArgs, AuthUserArgs, CallArgs, ChannelSerializer, Envelope, EventArgs,
    EventBurstArgs, EventsMessage, FragmentArgs, Message, ProtocolError, RpcMessage,
    UnixChannelSerializer, errnos,
};
use dispatcher_transport::{
    CloseReason, ConnectOptions, Credentials, Transport, TransportError, TransportEvent,
    TransportEvents,
};

use crate::error::{ClientError, ErrorCallback, EventCallback};
use crate::events::{EventMachinery, HandlerToken, MaskEntry};
use crate::rpc::{DispatchContext, RpcContext, RpcError, RpcOutcome};
use crate::streaming::{IterStep, PendingIterator, StreamingCall, StreamingView};

/// Default deadline for synchronous calls.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(60);

// ---------------------------------------------------------------------------
// Public call surface types
// ---------------------------------------------------------------------------

/// Per-call knobs for [`Connection::call_with`].
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Deadline override; `None` uses the connection default.
    pub timeout: Option<Duration>,
    /// Request a random-access streaming view instead of an ordered
    /// iterator.
    pub view: bool,
}

/// What a completed call produced.
pub enum CallResult {
    Value(Value),
    Stream(StreamingCall),
    View(StreamingView),
}

impl CallResult {
    /// The plain value, failing on streaming results.
    pub fn into_value(self) -> Result<Value, RpcError> {
        match self {
            CallResult::Value(value) => Ok(value),
            CallResult::Stream(_) | CallResult::View(_) => Err(RpcError::new(
                errnos::EINVAL,
                "call returned a streaming response",
            )),
        }
    }

    pub fn into_stream(self) -> Result<StreamingCall, RpcError> {
        match self {
            CallResult::Stream(stream) => Ok(stream),
            _ => Err(RpcError::new(errnos::EINVAL, "call did not stream")),
        }
    }

    pub fn into_view(self) -> Result<StreamingView, RpcError> {
        match self {
            CallResult::View(view) => Ok(view),
            _ => Err(RpcError::new(errnos::EINVAL, "call did not return a view")),
        }
    }
}

/// Progress reports delivered to a [`Connection::call_async`] callback.
#[derive(Debug, Clone)]
pub enum CallbackEvent {
    Response(Value),
    Fragment(Value),
    End,
    Error(RpcError),
}

/// Async-call callback.  Returning `true` from a fragment report requests
/// the next fragment automatically.
pub type CallCallback = Arc<dyn Fn(CallbackEvent) -> bool + Send + Sync>;

/// An inbound authentication request.
#[derive(Debug, Clone)]
pub enum AuthRequest {
    User(AuthUserArgs),
    Service(AuthServiceArgs),
    Token(AuthTokenArgs),
}

/// Server-side authentication hook.  The returned value becomes the
/// `rpc/response` payload; by convention its first element is the session
/// token.
pub type AuthHandler = Arc<dyn Fn(AuthRequest) -> Result<Value, RpcError> + Send + Sync>;

// ---------------------------------------------------------------------------
// Pending call
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default)]
struct StreamProgress {
    seqno: u64,
    closed: bool,
}

#[derive(Default)]
struct CallOutcome {
    result: Option<Value>,
    error: Option<RpcError>,
}

/// State of one outstanding outbound request.
struct PendingCall {
    id: String,
    method: String,
    view: bool,
    outcome: StdMutex<CallOutcome>,
    /// Completion signal: set by response, error, first fragment or end.
    ready: watch::Sender<bool>,
    /// Stream condition variable: highest seqno seen plus the closed flag.
    progress: watch::Sender<StreamProgress>,
    /// Non-view FIFO; `None` is the end sentinel.
    fifo_tx: mpsc::UnboundedSender<Option<Value>>,
    fifo_rx: StdMutex<Option<mpsc::UnboundedReceiver<Option<Value>>>>,
    /// View-mode fragment cache, keyed by seqno, kept until close.
    cache: StdMutex<HashMap<u64, Value>>,
    callback: Option<CallCallback>,
    /// Set once a fragment or end arrived: the result is a stream.
    streamed: AtomicBool,
}

impl PendingCall {
    fn new(method: &str, view: bool, callback: Option<CallCallback>) -> Arc<Self> {
        let (fifo_tx, fifo_rx) = mpsc::unbounded_channel();
        Arc::new(PendingCall {
            id: Uuid::new_v4().to_string(),
            method: method.to_owned(),
            view,
            outcome: StdMutex::new(CallOutcome::default()),
            ready: watch::Sender::new(false),
            progress: watch::Sender::new(StreamProgress::default()),
            fifo_tx,
            fifo_rx: StdMutex::new(Some(fifo_rx)),
            cache: StdMutex::new(HashMap::new()),
            callback,
            streamed: AtomicBool::new(false),
        })
    }

    fn set_error(&self, error: RpcError) {
        self.outcome.lock().expect("call outcome lock").error = Some(error);
        self.progress.send_modify(|p| p.closed = true);
        let _ = self.fifo_tx.send(None);
        self.ready.send_replace(true);
    }
}

/// Shared view of a pending call handed to streaming handles.
#[derive(Clone)]
pub struct PendingCallHandle(Arc<PendingCall>);

impl PendingCallHandle {
    pub(crate) fn id(&self) -> &str {
        &self.0.id
    }

    pub(crate) fn cached_fragment(&self, seqno: u64) -> Option<Value> {
        self.0.cache.lock().expect("fragment cache lock").get(&seqno).cloned()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.0.progress.borrow().closed
    }

    pub(crate) fn take_error(&self) -> Option<RpcError> {
        self.0.outcome.lock().expect("call outcome lock").error.clone()
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Configures and wires a [`Connection`].
pub struct ConnectionBuilder {
    rpc: Option<Arc<dyn RpcContext>>,
    auth_handler: Option<AuthHandler>,
    streaming: bool,
    standalone: bool,
    default_timeout: Duration,
    call_queue_limit: Option<usize>,
    error_callback: Option<ErrorCallback>,
    event_callback: Option<EventCallback>,
    serializer: Arc<dyn ChannelSerializer>,
    connect_options: ConnectOptions,
}

impl Default for ConnectionBuilder {
    fn default() -> Self {
        ConnectionBuilder {
            rpc: None,
            auth_handler: None,
            streaming: false,
            standalone: false,
            default_timeout: DEFAULT_CALL_TIMEOUT,
            call_queue_limit: None,
            error_callback: None,
            event_callback: None,
            serializer: Arc::new(UnixChannelSerializer),
            connect_options: ConnectOptions::default(),
        }
    }
}

impl ConnectionBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind an RPC context, enabling server functionality.
    pub fn rpc(mut self, context: Arc<dyn RpcContext>) -> Self {
        self.rpc = Some(context);
        self
    }

    pub fn auth_handler(mut self, handler: AuthHandler) -> Self {
        self.auth_handler = Some(handler);
        self
    }

    /// Allow streaming responses for inbound dispatches.
    pub fn streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }

    /// Standalone endpoints skip the `plugin.register_service` upcall.
    pub fn standalone(mut self, standalone: bool) -> Self {
        self.standalone = standalone;
        self
    }

    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Cap on simultaneous inbound dispatches; excess calls get `EBUSY`.
    pub fn call_queue_limit(mut self, limit: usize) -> Self {
        self.call_queue_limit = Some(limit);
        self
    }

    pub fn on_error(mut self, callback: ErrorCallback) -> Self {
        self.error_callback = Some(callback);
        self
    }

    pub fn on_event(mut self, callback: EventCallback) -> Self {
        self.event_callback = Some(callback);
        self
    }

    /// Replace the descriptor serializer (channel-multiplexed sockets).
    pub fn serializer(mut self, serializer: Arc<dyn ChannelSerializer>) -> Self {
        self.serializer = serializer;
        self
    }

    pub fn connect_options(mut self, options: ConnectOptions) -> Self {
        self.connect_options = options;
        self
    }

    /// Connect to a `unix://`, `fd://`, `ws://`, `ws+ssh://` or `ssh://`
    /// endpoint.
    pub async fn connect(self, url: &str) -> Result<Connection, TransportError> {
        let options = self.connect_options.clone();
        let (transport, events) = dispatcher_transport::connect(url, &options).await?;
        Ok(self.wire(transport, events))
    }

    /// Wire a pre-built transport (accepted server connections,
    /// socketpair back-to-back pairs).
    pub fn wire(self, transport: Box<dyn Transport>, events: TransportEvents) -> Connection {
        let (machinery, queue_rx) = EventMachinery::new();
        if let Some(callback) = self.event_callback {
            machinery.set_event_callback(callback);
        }

        let inner = Arc::new(ConnectionInner {
            transport,
            serializer: self.serializer,
            pending_calls: StdMutex::new(HashMap::new()),
            pending_iterators: StdMutex::new(HashMap::new()),
            inbound_active: AtomicUsize::new(0),
            rpc: RwLock::new(self.rpc),
            auth_handler: RwLock::new(self.auth_handler),
            streaming: AtomicBool::new(self.streaming),
            standalone: AtomicBool::new(self.standalone),
            default_timeout: RwLock::new(self.default_timeout),
            call_queue_limit: self.call_queue_limit,
            token: StdMutex::new(None),
            credentials: StdMutex::new(None),
            error_callback: RwLock::new(self.error_callback),
            events: machinery,
            masks: StdMutex::new(Vec::new()),
            burst: StdMutex::new(None),
            closed: AtomicBool::new(false),
            closed_tx: watch::Sender::new(false),
            disconnecting: AtomicBool::new(false),
        });

        tokio::spawn(Arc::clone(&inner.events).delivery_loop(queue_rx));
        tokio::spawn(receive_task(Arc::clone(&inner), events));

        Connection { inner }
    }
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

/// A peer-to-peer duplex session carrying framed JSON messages.
///
/// Cheap to clone; all clones share the underlying session.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    transport: Box<dyn Transport>,
    serializer: Arc<dyn ChannelSerializer>,
    pending_calls: StdMutex<HashMap<String, Arc<PendingCall>>>,
    pending_iterators: StdMutex<HashMap<String, Arc<PendingIterator>>>,
    /// In-flight inbound dispatches, for the EBUSY cap.
    inbound_active: AtomicUsize,
    rpc: RwLock<Option<Arc<dyn RpcContext>>>,
    auth_handler: RwLock<Option<AuthHandler>>,
    streaming: AtomicBool,
    standalone: AtomicBool,
    default_timeout: RwLock<Duration>,
    call_queue_limit: Option<usize>,
    token: StdMutex<Option<String>>,
    credentials: StdMutex<Option<Credentials>>,
    error_callback: RwLock<Option<ErrorCallback>>,
    events: Arc<EventMachinery>,
    /// Peer's subscription masks, maintained from inbound
    /// subscribe/unsubscribe messages; consulted by the filtered emit.
    masks: StdMutex<Vec<MaskEntry>>,
    burst: StdMutex<Option<BurstBuffer>>,
    closed: AtomicBool,
    closed_tx: watch::Sender<bool>,
    disconnecting: AtomicBool,
}

#[derive(Default)]
struct BurstBuffer {
    events: Vec<EventArgs>,
    max_events: usize,
}

impl Connection {
    /// Shorthand for a default-configured client connection.
    pub async fn connect(url: &str) -> Result<Connection, TransportError> {
        ConnectionBuilder::new().connect(url).await
    }

    pub fn connected(&self) -> bool {
        !self.inner.closed.load(Ordering::Acquire)
    }

    /// Peer credentials, on transports that deliver them.
    pub fn credentials(&self) -> Option<Credentials> {
        *self.inner.credentials.lock().expect("credentials lock")
    }

    /// The session token stored by a successful login.
    pub fn token(&self) -> Option<String> {
        self.inner.token.lock().expect("token lock").clone()
    }

    pub fn local_description(&self) -> String {
        self.inner.transport.local_description()
    }

    /// Observer that flips to `true` when the connection closes.
    pub fn closed_watch(&self) -> watch::Receiver<bool> {
        self.inner.closed_tx.subscribe()
    }

    /// Bind an RPC context after construction.
    pub fn enable_server(&self, context: Arc<dyn RpcContext>) {
        *self.inner.rpc.write().expect("rpc context lock") = Some(context);
    }

    pub fn set_streaming(&self, streaming: bool) {
        self.inner.streaming.store(streaming, Ordering::Release);
    }

    pub fn on_error(&self, callback: ErrorCallback) {
        *self.inner.error_callback.write().expect("error callback lock") = Some(callback);
    }

    pub fn on_event(&self, callback: EventCallback) {
        self.inner.events.set_event_callback(callback);
    }

    pub fn set_default_timeout(&self, timeout: Duration) {
        *self.inner.default_timeout.write().expect("timeout lock") = timeout;
    }

    // -- outbound calls ----------------------------------------------------

    /// Call a peer method and wait for the result with the default
    /// timeout.
    pub async fn call(&self, method: &str, args: Value) -> Result<CallResult, RpcError> {
        self.call_with(method, args, CallOptions::default()).await
    }

    /// Call with explicit options (timeout, view mode).
    pub async fn call_with(
        &self,
        method: &str,
        args: Value,
        options: CallOptions,
    ) -> Result<CallResult, RpcError> {
        let inner = &self.inner;
        let timeout = options
            .timeout
            .unwrap_or(*inner.default_timeout.read().expect("timeout lock"));

        let call = PendingCall::new(method, options.view, None);
        inner.install_call(&call);
        let mut ready = call.ready.subscribe();

        inner
            .send_message(
                Message::Rpc(RpcMessage::Call(CallArgs {
                    method: method.to_owned(),
                    args,
                    view: options.view,
                })),
                call.id.clone(),
            )
            .await?;

        match tokio::time::timeout(timeout, ready.wait_for(|ready| *ready)).await {
            Err(_elapsed) => {
                // The entry stays; the id is freed by a late terminal
                // message or by connection teardown.
                debug!(target: "dispatcher_core", id = %call.id, method = %call.method, "call timed out");
                inner.notify_error(ClientError::RpcCallTimeout);
                return Err(RpcError::new(errnos::ETIMEDOUT, "Call timed out"));
            }
            Ok(result) => {
                result.map_err(|_| RpcError::new(errnos::ECONNABORTED, "Connection closed"))?;
            }
        }

        self.materialize_result(&call)
    }

    /// Fire a call whose responses are reported through `callback` as they
    /// arrive.  Returns the request id (usable with [`Connection::abort_call`]).
    pub async fn call_async(
        &self,
        method: &str,
        args: Value,
        callback: CallCallback,
    ) -> Result<String, RpcError> {
        let call = PendingCall::new(method, false, Some(callback));
        self.inner.install_call(&call);
        self.inner
            .send_message(
                Message::Rpc(RpcMessage::Call(CallArgs {
                    method: method.to_owned(),
                    args,
                    view: false,
                })),
                call.id.clone(),
            )
            .await?;
        Ok(call.id.clone())
    }

    /// Request the fragment after the last seen one (or an explicit
    /// seqno); with `sync` set, wait until it arrived or the call closed.
    pub async fn call_continue(
        &self,
        id: &str,
        sync: bool,
        seqno: Option<u64>,
    ) -> Result<u64, RpcError> {
        let call = self
            .inner
            .lookup_call(id)
            .ok_or_else(|| RpcError::new(errnos::ENOENT, "Unknown call"))?;
        let target = seqno.unwrap_or_else(|| call.progress.borrow().seqno + 1);
        let mut progress = call.progress.subscribe();
        self.inner
            .send_message(Message::Rpc(RpcMessage::Continue(target)), id.to_owned())
            .await?;
        if sync {
            // Equality, not >=: replayed fragments carry seqnos below the
            // highest one seen.
            let _ = progress.wait_for(|p| p.seqno == target || p.closed).await;
        }
        Ok(target)
    }

    /// Cancel a streaming call: the peer closes its iterator and answers
    /// `rpc/close`, after which the id is freed on both sides.
    pub async fn abort_call(&self, id: &str) -> Result<(), RpcError> {
        let call = self
            .inner
            .lookup_call(id)
            .ok_or_else(|| RpcError::new(errnos::ENOENT, "Unknown call"))?;
        let mut progress = call.progress.subscribe();
        self.inner
            .send_message(Message::Rpc(RpcMessage::Abort), id.to_owned())
            .await?;
        let _ = progress.wait_for(|p| p.closed).await;
        Ok(())
    }

    fn materialize_result(&self, call: &Arc<PendingCall>) -> Result<CallResult, RpcError> {
        {
            let outcome = call.outcome.lock().expect("call outcome lock");
            if let Some(error) = outcome.error.clone() {
                return Err(error);
            }
            if !call.streamed.load(Ordering::Acquire) {
                return Ok(CallResult::Value(outcome.result.clone().unwrap_or(Value::Null)));
            }
        }

        let handle = PendingCallHandle(Arc::clone(call));
        if call.view {
            Ok(CallResult::View(StreamingView::new(self.clone(), handle)))
        } else {
            let rx = call
                .fifo_rx
                .lock()
                .expect("stream receiver lock")
                .take()
                .ok_or_else(|| RpcError::new(errnos::EINVAL, "stream already consumed"))?;
            Ok(CallResult::Stream(StreamingCall::new(self.clone(), handle, rx)))
        }
    }

    // -- auth --------------------------------------------------------------

    /// Authenticate with username and password; stores and returns the
    /// session token.
    pub async fn login_user(
        &self,
        username: &str,
        password: &str,
        check_password: bool,
        resource: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<String, RpcError> {
        let message = Message::Rpc(RpcMessage::Auth(AuthUserArgs {
            username: username.to_owned(),
            password: password.to_owned(),
            check_password,
            resource: resource.map(str::to_owned),
        }));
        let result = self.auth_round_trip(message, timeout).await?;
        let token = token_from_response(&result)?;
        *self.inner.token.lock().expect("token lock") = Some(token.clone());
        Ok(token)
    }

    /// Authenticate as a named service.
    pub async fn login_service(
        &self,
        name: &str,
        timeout: Option<Duration>,
    ) -> Result<(), RpcError> {
        let message = Message::Rpc(RpcMessage::AuthService(AuthServiceArgs {
            name: name.to_owned(),
        }));
        self.auth_round_trip(message, timeout).await.map(|_| ())
    }

    /// Re-authenticate with a previously issued token.
    pub async fn login_token(
        &self,
        token: &str,
        timeout: Option<Duration>,
    ) -> Result<String, RpcError> {
        let message = Message::Rpc(RpcMessage::AuthToken(AuthTokenArgs {
            token: token.to_owned(),
        }));
        let result = self.auth_round_trip(message, timeout).await?;
        let token = token_from_response(&result)?;
        *self.inner.token.lock().expect("token lock") = Some(token.clone());
        Ok(token)
    }

    async fn auth_round_trip(
        &self,
        message: Message,
        timeout: Option<Duration>,
    ) -> Result<Value, RpcError> {
        let call = PendingCall::new("auth", false, None);
        self.inner.install_call(&call);
        let mut ready = call.ready.subscribe();
        self.inner.send_message(message, call.id.clone()).await?;

        let wait = ready.wait_for(|ready| *ready);
        let completed = match timeout {
            Some(timeout) => tokio::time::timeout(timeout, wait).await.map_err(|_| {
                self.inner.notify_error(ClientError::RpcCallTimeout);
                RpcError::new(errnos::ETIMEDOUT, "Call timed out")
            })?,
            None => wait.await,
        };
        completed.map_err(|_| RpcError::new(errnos::ECONNABORTED, "Connection closed"))?;

        let outcome = call.outcome.lock().expect("call outcome lock");
        match outcome.error.clone() {
            Some(error) => Err(error),
            None => Ok(outcome.result.clone().unwrap_or(Value::Null)),
        }
    }

    // -- events ------------------------------------------------------------

    /// Emit one event to the peer (or into the burst buffer when burst
    /// mode is enabled).
    pub async fn emit_event(&self, name: &str, args: Value) -> Result<(), RpcError> {
        enum Action {
            Send(Value),
            Flush,
            Buffered,
        }

        let action = {
            let mut burst = self.inner.burst.lock().expect("burst buffer lock");
            match burst.as_mut() {
                None => Action::Send(args),
                Some(buffer) => {
                    buffer.events.push(EventArgs {
                        name: name.to_owned(),
                        args,
                    });
                    if buffer.events.len() >= buffer.max_events {
                        Action::Flush
                    } else {
                        Action::Buffered
                    }
                }
            }
        };

        match action {
            Action::Send(args) => {
                self.inner
                    .send_message(
                        Message::Events(EventsMessage::Event(EventArgs {
                            name: name.to_owned(),
                            args,
                        })),
                        Uuid::new_v4().to_string(),
                    )
                    .await
            }
            Action::Flush => self.flush_events().await,
            Action::Buffered => Ok(()),
        }
    }

    /// Emit only when the peer's subscription masks match (server egress).
    pub async fn emit_event_filtered(&self, name: &str, args: Value) -> Result<(), RpcError> {
        let matched = {
            let masks = self.inner.masks.lock().expect("mask set lock");
            masks.iter().any(|entry| entry.mask.matches(name))
        };
        if matched {
            self.emit_event(name, args).await
        } else {
            Ok(())
        }
    }

    /// Switch event emission to burst accumulation.  Bursts flush when
    /// `max_events` accumulate, on [`Connection::flush_events`], and every
    /// `flush_interval` when one is given.
    pub fn enable_event_burst(&self, max_events: usize, flush_interval: Option<Duration>) {
        *self.inner.burst.lock().expect("burst buffer lock") = Some(BurstBuffer {
            events: Vec::new(),
            max_events: max_events.max(1),
        });

        if let Some(interval) = flush_interval {
            let conn = self.clone();
            let mut closed = self.closed_watch();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            if conn.flush_events().await.is_err() {
                                break;
                            }
                        }
                        _ = closed.changed() => break,
                    }
                }
            });
        }
    }

    /// Send the accumulated burst as one `events/event_burst`, preserving
    /// emission order.
    pub async fn flush_events(&self) -> Result<(), RpcError> {
        let events = {
            let mut burst = self.inner.burst.lock().expect("burst buffer lock");
            match burst.as_mut() {
                None => return Ok(()),
                Some(buffer) => std::mem::take(&mut buffer.events),
            }
        };
        if events.is_empty() {
            return Ok(());
        }
        self.inner
            .send_message(
                Message::Events(EventsMessage::EventBurst(EventBurstArgs { events })),
                Uuid::new_v4().to_string(),
            )
            .await
    }

    pub async fn subscribe_events(&self, masks: &[&str]) -> Result<(), RpcError> {
        let masks = masks.iter().map(|m| Value::from(*m)).collect();
        self.inner
            .send_message(
                Message::Events(EventsMessage::Subscribe(masks)),
                Uuid::new_v4().to_string(),
            )
            .await
    }

    /// Terminate the peer's session (`events/logout`); the peer surfaces
    /// it through its error callback.
    pub async fn send_logout(&self) -> Result<(), RpcError> {
        self.inner
            .send_message(
                Message::Events(EventsMessage::Logout),
                Uuid::new_v4().to_string(),
            )
            .await
    }

    pub async fn unsubscribe_events(&self, masks: &[&str]) -> Result<(), RpcError> {
        let masks = masks.iter().map(|m| Value::from(*m)).collect();
        self.inner
            .send_message(
                Message::Events(EventsMessage::Unsubscribe(masks)),
                Uuid::new_v4().to_string(),
            )
            .await
    }

    /// Register a handler for `name` and subscribe the peer to it.
    ///
    /// `sync` handlers run serially on the delivery worker in emission
    /// order; others run on spawned workers.
    pub async fn register_event_handler(
        &self,
        name: &str,
        sync: bool,
        handler: impl Fn(&Value) + Send + Sync + 'static,
    ) -> Result<HandlerToken, RpcError> {
        let token = self.inner.events.register(name, sync, handler);
        self.subscribe_events(&[name]).await?;
        Ok(token)
    }

    pub fn unregister_event_handler(&self, token: &HandlerToken) {
        self.inner.events.unregister(token);
    }

    /// Run `operation` and wait until an event arrives whose args satisfy
    /// `matches`.  Registration happens under the event-distribution lock,
    /// so events delivered while `operation` runs are not missed.
    ///
    /// Returns whether the event arrived before the timeout.
    pub async fn exec_and_wait_for_event<Fut>(
        &self,
        event: &str,
        matches: impl Fn(&Value) -> bool + Send + Sync + 'static,
        operation: impl FnOnce() -> Fut,
        timeout: Option<Duration>,
    ) -> Result<bool, RpcError>
    where
        Fut: Future<Output = Result<(), RpcError>>,
    {
        let done = Arc::new(tokio::sync::Notify::new());
        self.subscribe_events(&[event]).await?;

        let token = {
            let lock = Arc::clone(&self.inner.events.distribution_lock);
            let _guard = lock.lock().await;
            operation().await?;
            let done = Arc::clone(&done);
            self.inner.events.register(event, false, move |args| {
                if matches(args) {
                    done.notify_one();
                }
            })
        };

        let signalled = wait_with_timeout(timeout, done.notified()).await;
        self.inner.events.unregister(&token);
        Ok(signalled)
    }

    /// Like [`Connection::exec_and_wait_for_event`], but returns
    /// immediately when `initial_condition` already holds.
    pub async fn test_or_wait_for_event(
        &self,
        event: &str,
        matches: impl Fn(&Value) -> bool + Send + Sync + 'static,
        initial_condition: impl FnOnce() -> bool,
        timeout: Option<Duration>,
    ) -> Result<bool, RpcError> {
        let done = Arc::new(tokio::sync::Notify::new());
        self.subscribe_events(&[event]).await?;

        let token = {
            let lock = Arc::clone(&self.inner.events.distribution_lock);
            let _guard = lock.lock().await;
            if initial_condition() {
                return Ok(true);
            }
            let done = Arc::clone(&done);
            self.inner.events.register(event, false, move |args| {
                if matches(args) {
                    done.notify_one();
                }
            })
        };

        let signalled = wait_with_timeout(timeout, done.notified()).await;
        self.inner.events.unregister(&token);
        Ok(signalled)
    }

    // -- tasks and service registration ------------------------------------

    /// Submit a task and return its id.
    pub async fn submit_task(&self, name: &str, args: Vec<Value>) -> Result<Value, RpcError> {
        self.call("task.submit", json!([name, args]))
            .await?
            .into_value()
    }

    /// Submit a task, wait for completion, return its final status.
    pub async fn call_task_sync(
        &self,
        name: &str,
        args: Vec<Value>,
        timeout: Duration,
    ) -> Result<Value, RpcError> {
        let tid = self.submit_task(name, args).await?;
        self.call_with(
            "task.wait",
            json!([tid]),
            CallOptions {
                timeout: Some(timeout),
                ..CallOptions::default()
            },
        )
        .await?
        .into_value()?;
        self.call("task.status", json!([tid])).await?.into_value()
    }

    /// Announce a locally registered service to the parent dispatcher
    /// (skipped for standalone endpoints).
    pub async fn register_service(&self, name: &str) -> Result<(), RpcError> {
        if self.inner.standalone.load(Ordering::Acquire) {
            return Ok(());
        }
        self.call("plugin.register_service", json!([name]))
            .await?
            .into_value()
            .map(|_| ())
    }

    /// Withdraw a service registration (skipped for standalone endpoints).
    pub async fn unregister_service(&self, name: &str) -> Result<(), RpcError> {
        if self.inner.standalone.load(Ordering::Acquire) {
            return Ok(());
        }
        self.call("plugin.unregister_service", json!([name]))
            .await?
            .into_value()
            .map(|_| ())
    }

    // -- lifecycle ---------------------------------------------------------

    /// Close the connection deliberately; the error callback is not
    /// invoked for a local disconnect.
    pub async fn disconnect(&self) {
        self.inner.disconnecting.store(true, Ordering::Release);
        self.inner.transport.close().await;
    }
}

fn token_from_response(result: &Value) -> Result<String, RpcError> {
    result
        .as_array()
        .and_then(|items| items.first())
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or_else(|| RpcError::new(errnos::EINVAL, "unexpected auth response shape"))
}

async fn wait_with_timeout(timeout: Option<Duration>, fut: impl Future<Output = ()>) -> bool {
    match timeout {
        Some(timeout) => tokio::time::timeout(timeout, fut).await.is_ok(),
        None => {
            fut.await;
            true
        }
    }
}

// ---------------------------------------------------------------------------
// Inner: send path and teardown
// ---------------------------------------------------------------------------

impl ConnectionInner {
    fn install_call(&self, call: &Arc<PendingCall>) {
        self.pending_calls
            .lock()
            .expect("pending call table lock")
            .insert(call.id.clone(), Arc::clone(call));
    }

    fn lookup_call(&self, id: &str) -> Option<Arc<PendingCall>> {
        self.pending_calls
            .lock()
            .expect("pending call table lock")
            .get(id)
            .cloned()
    }

    fn remove_call(&self, id: &str) -> Option<Arc<PendingCall>> {
        self.pending_calls
            .lock()
            .expect("pending call table lock")
            .remove(id)
    }

    async fn send_message(&self, message: Message, id: String) -> Result<(), RpcError> {
        let mut envelope = message.into_envelope(id);
        let fds = if self.transport.fd_passing() {
            self.serializer.collect_fds(&mut envelope.args)
        } else {
            Vec::new()
        };
        let payload = envelope.encode();
        debug!(
            target: "dispatcher_core",
            namespace = %envelope.namespace,
            name = %envelope.name,
            id = %envelope.id,
            fds = fds.len(),
            "sending message"
        );
        self.transport.send(payload, fds).await.map_err(|err| {
            // The transport shuts itself down on send failure; teardown
            // arrives through the Closed upcall.
            RpcError::new(errnos::ECONNABORTED, format!("send failed: {err}"))
        })
    }

    async fn send_error(&self, id: &str, error: RpcError) {
        let message = Message::Rpc(RpcMessage::Error(error.into_payload()));
        if let Err(err) = self.send_message(message, id.to_owned()).await {
            debug!(target: "dispatcher_core", error = %err, "error reply failed");
        }
    }

    fn notify_error(&self, kind: ClientError) {
        let callback = self
            .error_callback
            .read()
            .expect("error callback lock")
            .clone();
        if let Some(callback) = callback {
            callback(kind);
        }
    }

    /// Fail every outstanding outbound call with `ECONNABORTED` and empty
    /// the table.
    fn drop_pending_calls(&self) {
        let calls: Vec<Arc<PendingCall>> = {
            let mut table = self.pending_calls.lock().expect("pending call table lock");
            table.drain().map(|(_, call)| call).collect()
        };
        for call in calls {
            call.set_error(RpcError::new(errnos::ECONNABORTED, "Connection closed"));
        }
    }

    fn handle_close(&self, reason: &CloseReason) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(target: "dispatcher_core", ?reason, "connection closed");
        let _ = self.closed_tx.send(true);
        self.drop_pending_calls();
        self.pending_iterators
            .lock()
            .expect("pending iterator table lock")
            .clear();
        self.events.shutdown();
        if !self.disconnecting.load(Ordering::Acquire) {
            self.notify_error(ClientError::ConnectionClosed);
        }
    }
}

// ---------------------------------------------------------------------------
// Receive task and message routing
// ---------------------------------------------------------------------------

async fn receive_task(inner: Arc<ConnectionInner>, mut events: TransportEvents) {
    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::Open { credentials } => {
                *inner.credentials.lock().expect("credentials lock") = credentials;
            }
            TransportEvent::Message { payload, fds } => {
                handle_frame(&inner, payload, fds).await;
            }
            TransportEvent::Closed { reason } => {
                inner.handle_close(&reason);
                break;
            }
        }
    }
}

async fn handle_frame(inner: &Arc<ConnectionInner>, payload: Vec<u8>, fds: Vec<std::os::fd::RawFd>) {
    let mut envelope = match Envelope::parse(&payload) {
        Ok(envelope) => envelope,
        Err(err @ (ProtocolError::InvalidJson(_) | ProtocolError::NotAnObject)) => {
            debug!(target: "dispatcher_core", error = %err, "unparseable frame");
            inner.notify_error(ClientError::InvalidJsonResponse);
            inner
                .send_error(
                    &Uuid::new_v4().to_string(),
                    RpcError::new(errnos::EINVAL, "Request is not valid JSON"),
                )
                .await;
            return;
        }
        Err(err) => {
            debug!(target: "dispatcher_core", error = %err, "invalid frame");
            inner.notify_error(ClientError::InvalidJsonResponse);
            inner
                .send_error(
                    &Uuid::new_v4().to_string(),
                    RpcError::new(errnos::EINVAL, "Invalid request"),
                )
                .await;
            return;
        }
    };

    inner.serializer.replace_fds(&mut envelope.args, &fds);

    let message = match Message::from_envelope(&envelope) {
        Ok(message) => message,
        Err(err) => {
            debug!(target: "dispatcher_core", error = %err, "unknown or malformed message");
            inner
                .send_error(&envelope.id, RpcError::new(errnos::EINVAL, "Invalid request"))
                .await;
            return;
        }
    };

    debug!(
        target: "dispatcher_core",
        namespace = %envelope.namespace,
        name = %envelope.name,
        id = %envelope.id,
        "message received"
    );

    let id = envelope.id;
    match message {
        Message::Rpc(rpc) => match rpc {
            RpcMessage::Response(value) => on_rpc_response(inner, &id, value),
            RpcMessage::Error(payload) => on_rpc_error(inner, &id, RpcError::from_payload(payload)),
            RpcMessage::Fragment(fragment) => on_rpc_fragment(inner, &id, fragment).await,
            RpcMessage::End(seqno) => on_rpc_end(inner, &id, seqno),
            RpcMessage::Close => on_rpc_close(inner, &id),
            RpcMessage::Call(call) => on_rpc_call(inner, id, call).await,
            RpcMessage::Continue(seqno) => on_rpc_continue(inner, id, seqno).await,
            RpcMessage::Abort => on_rpc_abort(inner, &id).await,
            RpcMessage::Auth(args) => on_rpc_auth(inner, &id, AuthRequest::User(args)).await,
            RpcMessage::AuthService(args) => {
                on_rpc_auth(inner, &id, AuthRequest::Service(args)).await;
            }
            RpcMessage::AuthToken(args) => on_rpc_auth(inner, &id, AuthRequest::Token(args)).await,
        },
        Message::Events(events) => match events {
            EventsMessage::Event(event) => inner.events.enqueue(event.name, event.args),
            EventsMessage::EventBurst(burst) => {
                for event in burst.events {
                    inner.events.enqueue(event.name, event.args);
                }
            }
            EventsMessage::Subscribe(masks) => {
                let mut table = inner.masks.lock().expect("mask set lock");
                for source in masks {
                    if table.iter().any(|entry| entry.source == source) {
                        continue;
                    }
                    if let Some(mask) = crate::events::EventMask::parse(&source) {
                        table.push(MaskEntry { source, mask });
                    }
                }
            }
            EventsMessage::Unsubscribe(masks) => {
                let mut table = inner.masks.lock().expect("mask set lock");
                table.retain(|entry| !masks.contains(&entry.source));
            }
            EventsMessage::Logout => inner.notify_error(ClientError::Logout),
        },
    }
}

// -- responses to our own calls ---------------------------------------------

fn on_rpc_response(inner: &Arc<ConnectionInner>, id: &str, value: Value) {
    let Some(call) = inner.remove_call(id) else {
        inner.notify_error(ClientError::SpuriousRpcResponse);
        return;
    };
    call.outcome.lock().expect("call outcome lock").result = Some(value.clone());
    call.ready.send_replace(true);
    if let Some(callback) = &call.callback {
        callback(CallbackEvent::Response(value));
    }
}

fn on_rpc_error(inner: &Arc<ConnectionInner>, id: &str, error: RpcError) {
    let Some(call) = inner.remove_call(id) else {
        inner.notify_error(ClientError::SpuriousRpcResponse);
        return;
    };
    call.set_error(error.clone());
    if let Some(callback) = &call.callback {
        callback(CallbackEvent::Error(error));
    }
    inner.notify_error(ClientError::RpcCallError);
}

async fn on_rpc_fragment(inner: &Arc<ConnectionInner>, id: &str, fragment: FragmentArgs) {
    let Some(call) = inner.lookup_call(id) else {
        inner.notify_error(ClientError::SpuriousRpcResponse);
        return;
    };

    call.streamed.store(true, Ordering::Release);
    if call.view {
        call.cache
            .lock()
            .expect("fragment cache lock")
            .insert(fragment.seqno, fragment.fragment.clone());
    } else {
        // Fragments may carry one value or a batch of them.
        match &fragment.fragment {
            Value::Array(items) => {
                for item in items {
                    let _ = call.fifo_tx.send(Some(item.clone()));
                }
            }
            other => {
                let _ = call.fifo_tx.send(Some(other.clone()));
            }
        }
    }
    call.progress.send_modify(|p| p.seqno = fragment.seqno);
    call.ready.send_replace(true);

    if let Some(callback) = &call.callback
        && callback(CallbackEvent::Fragment(fragment.fragment))
    {
        let inner = Arc::clone(inner);
        let id = id.to_owned();
        let next = fragment.seqno + 1;
        tokio::spawn(async move {
            let _ = inner
                .send_message(Message::Rpc(RpcMessage::Continue(next)), id)
                .await;
        });
    }
}

fn on_rpc_end(inner: &Arc<ConnectionInner>, id: &str, seqno: u64) {
    let Some(call) = inner.lookup_call(id) else {
        inner.notify_error(ClientError::SpuriousRpcResponse);
        return;
    };
    call.streamed.store(true, Ordering::Release);
    if !call.view {
        let _ = call.fifo_tx.send(None);
    }
    call.progress.send_modify(|p| p.seqno = seqno);
    call.ready.send_replace(true);
    if let Some(callback) = &call.callback {
        callback(CallbackEvent::End);
    }
}

fn on_rpc_close(inner: &Arc<ConnectionInner>, id: &str) {
    let Some(call) = inner.remove_call(id) else {
        return;
    };
    call.progress.send_modify(|p| p.closed = true);
    let _ = call.fifo_tx.send(None);
}

// -- peer-initiated calls -----------------------------------------------------

async fn on_rpc_call(inner: &Arc<ConnectionInner>, id: String, call: CallArgs) {
    let context = inner.rpc.read().expect("rpc context lock").clone();
    let Some(context) = context else {
        inner
            .send_error(
                &id,
                RpcError::new(errnos::EINVAL, "Server functionality is not supported"),
            )
            .await;
        return;
    };

    if let Some(limit) = inner.call_queue_limit {
        let outstanding = inner.inbound_active.load(Ordering::Acquire)
            + inner
                .pending_iterators
                .lock()
                .expect("pending iterator table lock")
                .len();
        if outstanding >= limit {
            inner
                .send_error(
                    &id,
                    RpcError::new(errnos::EBUSY, "Number of simultaneous requests exceeded"),
                )
                .await;
            return;
        }
    }

    inner.inbound_active.fetch_add(1, Ordering::AcqRel);
    let inner = Arc::clone(inner);
    tokio::spawn(async move {
        let ctx = DispatchContext {
            streaming: inner.streaming.load(Ordering::Acquire),
            credentials: *inner.credentials.lock().expect("credentials lock"),
        };
        debug!(
            target: "dispatcher_core",
            id = %id,
            method = %call.method,
            view = call.view,
            "dispatching inbound call"
        );

        match context.dispatch(&call.method, call.args, ctx).await {
            Err(error) => {
                debug!(
                    target: "dispatcher_core",
                    id = %id,
                    code = error.code,
                    message = %error.message,
                    "dispatch failed"
                );
                inner.send_error(&id, error).await;
            }
            Ok(RpcOutcome::Value(value)) => {
                let _ = inner
                    .send_message(Message::Rpc(RpcMessage::Response(value)), id.clone())
                    .await;
            }
            Ok(RpcOutcome::Stream(stream)) => {
                let iterator = Arc::new(PendingIterator::new(stream, call.view));
                inner
                    .pending_iterators
                    .lock()
                    .expect("pending iterator table lock")
                    .insert(id.clone(), Arc::clone(&iterator));
                send_iterator_step(&inner, &id, &iterator, None).await;
            }
        }
        inner.inbound_active.fetch_sub(1, Ordering::AcqRel);
    });
}

async fn on_rpc_continue(inner: &Arc<ConnectionInner>, id: String, seqno: u64) {
    let iterator = inner
        .pending_iterators
        .lock()
        .expect("pending iterator table lock")
        .get(&id)
        .cloned();
    let Some(iterator) = iterator else {
        inner
            .send_error(&id, RpcError::new(errnos::ENOENT, "Invalid call"))
            .await;
        return;
    };

    let inner = Arc::clone(inner);
    tokio::spawn(async move {
        send_iterator_step(&inner, &id, &iterator, Some(seqno)).await;
    });
}

/// Produce and send the next protocol step of a pending iterator: the
/// first fragment (`wanted == None`), a requested fragment, the end
/// marker, or an error.
async fn send_iterator_step(
    inner: &Arc<ConnectionInner>,
    id: &str,
    iterator: &Arc<PendingIterator>,
    wanted: Option<u64>,
) {
    let step = match wanted {
        None => iterator.advance().await,
        Some(seqno) => iterator.request_chunk(seqno).await,
    };

    match step {
        Ok(IterStep::Fragment { seqno, value }) => {
            let _ = inner
                .send_message(
                    Message::Rpc(RpcMessage::Fragment(FragmentArgs {
                        seqno,
                        fragment: value,
                    })),
                    id.to_owned(),
                )
                .await;
        }
        Ok(IterStep::End { seqno }) => {
            let _ = inner
                .send_message(Message::Rpc(RpcMessage::End(seqno)), id.to_owned())
                .await;
            if !iterator.view() {
                let _ = inner
                    .send_message(Message::Rpc(RpcMessage::Close), id.to_owned())
                    .await;
                inner
                    .pending_iterators
                    .lock()
                    .expect("pending iterator table lock")
                    .remove(id);
            }
        }
        Err(error) => {
            inner.send_error(id, error).await;
            inner
                .pending_iterators
                .lock()
                .expect("pending iterator table lock")
                .remove(id);
        }
    }
}

async fn on_rpc_abort(inner: &Arc<ConnectionInner>, id: &str) {
    let removed = inner
        .pending_iterators
        .lock()
        .expect("pending iterator table lock")
        .remove(id);
    if removed.is_none() {
        inner
            .send_error(id, RpcError::new(errnos::ENOENT, "Invalid call"))
            .await;
        return;
    }
    // Dropping the iterator disposes the source sequence.
    let _ = inner
        .send_message(Message::Rpc(RpcMessage::Close), id.to_owned())
        .await;
}

async fn on_rpc_auth(inner: &Arc<ConnectionInner>, id: &str, request: AuthRequest) {
    let handler = inner.auth_handler.read().expect("auth handler lock").clone();
    let Some(handler) = handler else {
        warn!(target: "dispatcher_core", id = %id, "auth request without auth handler");
        inner
            .send_error(id, RpcError::new(errnos::EINVAL, "Invalid request"))
            .await;
        return;
    };
    match handler(request) {
        Ok(value) => {
            let _ = inner
                .send_message(Message::Rpc(RpcMessage::Response(value)), id.to_owned())
                .await;
        }
        Err(error) => inner.send_error(id, error).await,
    }
}
