//! Event delivery machinery.
//!
//! Inbound events land in a single per-connection queue drained by one
//! delivery worker, which preserves emission order end-to-end.  Handlers
//! registered `sync` run inline on the worker under a per-handler lock;
//! the rest are spawned onto the runtime.  The distribution lock makes
//! handler registration atomic with respect to deliveries, which is what
//! `exec_and_wait_for_event` relies on.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock};

use regex::Regex;
use serde_json::Value;
use tokio::sync::{Mutex, mpsc};
use tracing::debug;

use crate::error::EventCallback;

// ---------------------------------------------------------------------------
// Masks
// ---------------------------------------------------------------------------

/// A subscription filter: fnmatch-style wildcard or compiled regex.
#[derive(Debug, Clone)]
pub enum EventMask {
    Wildcard(Regex),
    Regex(Regex),
}

impl EventMask {
    /// Parse a wire mask: a wildcard string or a `{"$regex": pattern}`
    /// object.  Unparseable masks are dropped.
    pub fn parse(value: &Value) -> Option<EventMask> {
        if let Some(pattern) = value.as_str() {
            return fnmatch_to_regex(pattern).ok().map(EventMask::Wildcard);
        }
        let obj = value.as_object()?;
        if obj.len() == 1
            && let Some(pattern) = obj.get("$regex").and_then(Value::as_str)
        {
            return Regex::new(pattern).ok().map(EventMask::Regex);
        }
        None
    }

    pub fn matches(&self, name: &str) -> bool {
        match self {
            EventMask::Wildcard(re) => re.is_match(name),
            EventMask::Regex(re) => re.is_match(name),
        }
    }
}

/// A parsed mask paired with its wire form, so unsubscribe can remove by
/// value equality.
#[derive(Debug, Clone)]
pub(crate) struct MaskEntry {
    pub source: Value,
    pub mask: EventMask,
}

/// Translate an fnmatch-style pattern (`*`, `?`) into an anchored regex.
fn fnmatch_to_regex(pattern: &str) -> Result<Regex, regex::Error> {
    let mut out = String::with_capacity(pattern.len() + 8);
    out.push('^');
    for ch in pattern.chars() {
        match ch {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }
    out.push('$');
    Regex::new(&out)
}

// ---------------------------------------------------------------------------
// Handler registry and delivery queue
// ---------------------------------------------------------------------------

/// An event handler; receives the event's `args`.
pub type EventHandler = Arc<dyn Fn(&Value) + Send + Sync>;

#[derive(Clone)]
struct HandlerEntry {
    id: u64,
    sync: bool,
    handler: EventHandler,
    /// Serializes invocations of one sync handler across deliveries.
    lock: Arc<Mutex<()>>,
}

/// Returned by handler registration; identifies the handler for removal.
#[derive(Debug, Clone)]
pub struct HandlerToken {
    name: String,
    id: u64,
}

impl HandlerToken {
    pub fn event_name(&self) -> &str {
        &self.name
    }
}

pub(crate) enum QueueItem {
    Deliver { name: String, args: Value },
    Shutdown,
}

/// Per-connection event state: handler registry plus the delivery queue.
pub(crate) struct EventMachinery {
    handlers: StdMutex<HashMap<String, Vec<HandlerEntry>>>,
    next_id: AtomicU64,
    pub(crate) distribution_lock: Arc<Mutex<()>>,
    event_callback: RwLock<Option<EventCallback>>,
    tx: mpsc::UnboundedSender<QueueItem>,
}

impl EventMachinery {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<QueueItem>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let machinery = Arc::new(EventMachinery {
            handlers: StdMutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            distribution_lock: Arc::new(Mutex::new(())),
            event_callback: RwLock::new(None),
            tx,
        });
        (machinery, rx)
    }

    pub fn set_event_callback(&self, callback: EventCallback) {
        *self.event_callback.write().expect("event callback lock") = Some(callback);
    }

    pub fn enqueue(&self, name: String, args: Value) {
        let _ = self.tx.send(QueueItem::Deliver { name, args });
    }

    /// Push the termination sentinel; the delivery worker exits after
    /// draining everything queued before it.
    pub fn shutdown(&self) {
        let _ = self.tx.send(QueueItem::Shutdown);
    }

    pub fn register(
        &self,
        name: &str,
        sync: bool,
        handler: impl Fn(&Value) + Send + Sync + 'static,
    ) -> HandlerToken {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let entry = HandlerEntry {
            id,
            sync,
            handler: Arc::new(handler),
            lock: Arc::new(Mutex::new(())),
        };
        self.handlers
            .lock()
            .expect("handler registry lock")
            .entry(name.to_owned())
            .or_default()
            .push(entry);
        HandlerToken {
            name: name.to_owned(),
            id,
        }
    }

    pub fn unregister(&self, token: &HandlerToken) {
        let mut handlers = self.handlers.lock().expect("handler registry lock");
        if let Some(entries) = handlers.get_mut(&token.name) {
            entries.retain(|e| e.id != token.id);
            if entries.is_empty() {
                handlers.remove(&token.name);
            }
        }
    }

    fn handlers_for(&self, name: &str) -> Vec<HandlerEntry> {
        self.handlers
            .lock()
            .expect("handler registry lock")
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    /// The delivery worker.  One per connection; exits on the sentinel.
    pub(crate) async fn delivery_loop(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<QueueItem>) {
        while let Some(item) = rx.recv().await {
            let (name, args) = match item {
                QueueItem::Shutdown => break,
                QueueItem::Deliver { name, args } => (name, args),
            };

            // Registration and delivery exclude each other here.
            let _guard = self.distribution_lock.lock().await;
            debug!(target: "dispatcher_core", event = %name, "delivering event");

            for entry in self.handlers_for(&name) {
                if entry.sync {
                    let _serial = entry.lock.lock().await;
                    (entry.handler)(&args);
                } else {
                    let handler = Arc::clone(&entry.handler);
                    let args = args.clone();
                    tokio::spawn(async move {
                        handler(&args);
                    });
                }
            }

            let callback = self
                .event_callback
                .read()
                .expect("event callback lock")
                .clone();
            if let Some(callback) = callback {
                callback(&name, &args);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn wildcard_masks_match_fnmatch_style() {
        let mask = EventMask::parse(&json!("server.*")).unwrap();
        assert!(mask.matches("server.started"));
        assert!(mask.matches("server."));
        assert!(!mask.matches("client.ping"));
        // '.' in the pattern is literal, not "any char"
        assert!(!mask.matches("serverXstarted"));

        let single = EventMask::parse(&json!("task.?")).unwrap();
        assert!(single.matches("task.1"));
        assert!(!single.matches("task.12"));
    }

    #[test]
    fn regex_masks_compile_from_wire_form() {
        let mask = EventMask::parse(&json!({"$regex": "task\\.[0-9]+"})).unwrap();
        assert!(mask.matches("task.42"));
        assert!(!mask.matches("task.none"));
        assert!(EventMask::parse(&json!({"$regex": "("})).is_none());
        assert!(EventMask::parse(&json!(12)).is_none());
    }

    #[tokio::test]
    async fn delivery_preserves_order_for_sync_handlers() {
        let (machinery, rx) = EventMachinery::new();
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let seen2 = Arc::clone(&seen);
        machinery.register("counter", true, move |args| {
            seen2.lock().unwrap().push(args["n"].as_u64().unwrap());
        });

        for n in 0..10u64 {
            machinery.enqueue("counter".to_owned(), json!({"n": n}));
        }
        machinery.shutdown();
        Arc::clone(&machinery).delivery_loop(rx).await;

        assert_eq!(*seen.lock().unwrap(), (0..10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn unregistered_handler_is_not_invoked() {
        let (machinery, rx) = EventMachinery::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = Arc::clone(&calls);
        let token = machinery.register("ev", true, move |_| {
            calls2.fetch_add(1, Ordering::SeqCst);
        });
        machinery.enqueue("ev".to_owned(), Value::Null);
        machinery.unregister(&token);
        machinery.enqueue("ev".to_owned(), Value::Null);
        machinery.shutdown();
        Arc::clone(&machinery).delivery_loop(rx).await;
        // Registry mutations apply to deliveries that have not run yet
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn event_callback_sees_every_event() {
        let (machinery, rx) = EventMachinery::new();
        let names = Arc::new(StdMutex::new(Vec::new()));
        let names2 = Arc::clone(&names);
        machinery.set_event_callback(Arc::new(move |name, _args| {
            names2.lock().unwrap().push(name.to_owned());
        }));
        machinery.enqueue("a".to_owned(), Value::Null);
        machinery.enqueue("b".to_owned(), Value::Null);
        machinery.shutdown();
        Arc::clone(&machinery).delivery_loop(rx).await;
        assert_eq!(*names.lock().unwrap(), vec!["a", "b"]);
    }
}
