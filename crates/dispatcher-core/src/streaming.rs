//! Streaming-response machinery.
//!
//! The protocol is pull-based with one outstanding fragment per call: the
//! peer sends the first fragment right after the call and each further
//! fragment only in response to a `continue` carrying the wanted seqno.
//!
//! Receiver side: [`StreamingCall`] consumes values strictly in order from
//! a FIFO; [`StreamingView`] addresses values by index and replays from a
//! local cache without another round-trip.  Sender side:
//! [`PendingIterator`] wraps the source sequence, tracks the monotonic
//! seqno and, in view mode, retains every emitted value for replay.

use std::collections::HashMap;

use serde_json::Value;
use tokio::sync::Mutex;
use tokio::sync::mpsc;

use dispatcher_proto::errnos;

use crate::connection::{Connection, PendingCallHandle};
use crate::rpc::{RpcError, ValueStream};

// ---------------------------------------------------------------------------
// Sender side
// ---------------------------------------------------------------------------

/// One step of iterator advancement.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum IterStep {
    Fragment { seqno: u64, value: Value },
    /// The sequence is exhausted; `seqno` is what goes into `rpc/end`.
    End { seqno: u64 },
}

struct IterState {
    source: ValueStream,
    seqno: u64,
    cache: HashMap<u64, Value>,
    exhausted: bool,
}

/// Sender-side state for a lazy sequence being streamed to the peer.
pub(crate) struct PendingIterator {
    view: bool,
    state: Mutex<IterState>,
}

impl PendingIterator {
    pub fn new(source: ValueStream, view: bool) -> Self {
        PendingIterator {
            view,
            state: Mutex::new(IterState {
                source,
                seqno: 0,
                cache: HashMap::new(),
                exhausted: false,
            }),
        }
    }

    pub fn view(&self) -> bool {
        self.view
    }

    /// Advance by one value; used for the implicit first fragment.
    ///
    /// On natural exhaustion the end seqno is `count + 1`.
    pub async fn advance(&self) -> Result<IterStep, RpcError> {
        let mut state = self.state.lock().await;
        if state.exhausted {
            return Ok(IterStep::End {
                seqno: state.seqno + 1,
            });
        }
        match state.source.next() {
            None => {
                state.exhausted = true;
                Ok(IterStep::End {
                    seqno: state.seqno + 1,
                })
            }
            Some(Err(err)) => Err(err),
            Some(Ok(value)) => {
                state.seqno += 1;
                if self.view {
                    let seqno = state.seqno;
                    state.cache.insert(seqno, value.clone());
                }
                Ok(IterStep::Fragment {
                    seqno: state.seqno,
                    value,
                })
            }
        }
    }

    /// Produce the fragment with the given seqno: replayed from the view
    /// cache when available, otherwise by advancing the source.
    ///
    /// On exhaustion the requested seqno is echoed in the end step.
    pub async fn request_chunk(&self, seqno: u64) -> Result<IterStep, RpcError> {
        let mut state = self.state.lock().await;
        if let Some(value) = state.cache.get(&seqno) {
            return Ok(IterStep::Fragment {
                seqno,
                value: value.clone(),
            });
        }
        while state.seqno < seqno {
            match state.source.next() {
                None => {
                    state.exhausted = true;
                    return Ok(IterStep::End { seqno });
                }
                Some(Err(err)) => return Err(err),
                Some(Ok(value)) => {
                    state.seqno += 1;
                    if self.view {
                        let seqno = state.seqno;
                        state.cache.insert(seqno, value.clone());
                    }
                    if state.seqno == seqno {
                        return Ok(IterStep::Fragment { seqno, value });
                    }
                }
            }
        }
        // seqno was already emitted but is not cached (non-view replay)
        Err(RpcError::new(errnos::EINVAL, "fragment is not replayable"))
    }
}

/// Connection teardown removes a call from the pending table before
/// writing `ECONNABORTED` into it, so a concurrent `continue`/`abort` can
/// race the removal and fail its lookup.  The handle still reaches the
/// call object, so prefer the stored terminal error over the bare
/// `ENOENT`.
fn terminal_error(call: &PendingCallHandle, err: RpcError) -> RpcError {
    if err.code == errnos::ENOENT
        && let Some(stored) = call.take_error()
    {
        return stored;
    }
    err
}

// ---------------------------------------------------------------------------
// Receiver side: ordered iterator
// ---------------------------------------------------------------------------

/// Ordered pull iterator over a streaming response.
///
/// When the local FIFO runs dry, the next lookup issues
/// `continue seqno + 1` and waits for the peer, which is the protocol's
/// one-outstanding-fragment flow control.
pub struct StreamingCall {
    conn: Connection,
    call: PendingCallHandle,
    rx: mpsc::UnboundedReceiver<Option<Value>>,
    finished: bool,
}

impl StreamingCall {
    pub(crate) fn new(
        conn: Connection,
        call: PendingCallHandle,
        rx: mpsc::UnboundedReceiver<Option<Value>>,
    ) -> Self {
        StreamingCall {
            conn,
            call,
            rx,
            finished: false,
        }
    }

    /// The request id this stream belongs to.
    pub fn id(&self) -> &str {
        self.call.id()
    }

    /// Next value, `Ok(None)` at the end of the sequence.
    pub async fn next(&mut self) -> Result<Option<Value>, RpcError> {
        if self.finished {
            return Ok(None);
        }
        match self.rx.try_recv() {
            Ok(Some(value)) => Ok(Some(value)),
            Ok(None) => self.finish(),
            Err(mpsc::error::TryRecvError::Disconnected) => self.finish(),
            Err(mpsc::error::TryRecvError::Empty) => {
                if let Err(err) = self.conn.call_continue(self.call.id(), false, None).await {
                    self.finished = true;
                    return Err(terminal_error(&self.call, err));
                }
                match self.rx.recv().await {
                    Some(Some(value)) => Ok(Some(value)),
                    Some(None) | None => self.finish(),
                }
            }
        }
    }

    /// Drain the remaining values into a vector.
    pub async fn collect(mut self) -> Result<Vec<Value>, RpcError> {
        let mut out = Vec::new();
        while let Some(value) = self.next().await? {
            out.push(value);
        }
        Ok(out)
    }

    /// Cancel the stream; the peer closes its iterator and replies
    /// `rpc/close`.
    pub async fn abort(mut self) -> Result<(), RpcError> {
        self.finished = true;
        self.conn
            .abort_call(self.call.id())
            .await
            .map_err(|err| terminal_error(&self.call, err))
    }

    fn finish(&mut self) -> Result<Option<Value>, RpcError> {
        self.finished = true;
        match self.call.take_error() {
            Some(err) => Err(err),
            None => Ok(None),
        }
    }
}

impl std::fmt::Debug for StreamingCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingCall")
            .field("id", &self.call.id())
            .field("finished", &self.finished)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Receiver side: random-access view
// ---------------------------------------------------------------------------

/// Random-access view over a streaming response.
///
/// `get(k)` maps to seqno `k + 1`.  Values already fetched are answered
/// from the local cache without a round-trip; the sender retains all
/// emitted fragments for replay until the view is closed.  Over an
/// unbounded source both caches grow without limit — close the view when
/// done.
pub struct StreamingView {
    conn: Connection,
    call: PendingCallHandle,
}

impl StreamingView {
    pub(crate) fn new(conn: Connection, call: PendingCallHandle) -> Self {
        StreamingView { conn, call }
    }

    pub fn id(&self) -> &str {
        self.call.id()
    }

    /// Fetch the value at `index`, blocking on the peer when it is not
    /// cached yet.
    pub async fn get(&self, index: u64) -> Result<Value, RpcError> {
        if self.call.is_closed() {
            return Err(RpcError::new(errnos::EBADF, "Call is closed"));
        }
        let seqno = index + 1;
        if let Some(value) = self.call.cached_fragment(seqno) {
            return Ok(value);
        }

        self.conn
            .call_continue(self.call.id(), true, Some(seqno))
            .await
            .map_err(|err| terminal_error(&self.call, err))?;

        match self.call.cached_fragment(seqno) {
            Some(value) => Ok(value),
            None if self.call.is_closed() => Err(RpcError::new(errnos::EBADF, "Call is closed")),
            None => Err(RpcError::new(errnos::ENOENT, "stream exhausted")),
        }
    }

    /// Cancel the stream and free the caches on both sides.
    pub async fn close(&self) -> Result<(), RpcError> {
        if self.call.is_closed() {
            return Err(RpcError::new(errnos::EBADF, "Call is closed"));
        }
        self.conn
            .abort_call(self.call.id())
            .await
            .map_err(|err| terminal_error(&self.call, err))
    }
}

impl std::fmt::Debug for StreamingView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingView")
            .field("id", &self.call.id())
            .finish()
    }
}
