//! # Topic-based message bus.
//!
//! [`Bus`] decouples producers (transport frames, reconciliation tasks, local
//! callers) from consumers through named [`Topic`]s.
//!
//! ## Architecture
//! ```text
//! Publishers (many):                       Handlers (per topic, registration order):
//!   Connection loop ──┐                      ┌──► Reconciler      (entity-updated)
//!   ReconcileTask   ──┼──► Bus::dispatch ────┼──► Timeline        (converged)
//!   local caller    ──┘    (synchronous)     ├──► LogView         (build, log)
//!                                            └──► TraceWriter     (every topic)
//! ```
//!
//! ## Rules
//! - **Fan-out**: every handler subscribed to a topic receives every message on it.
//! - **Order**: handlers run in registration order, on the caller's task; a
//!   handler sees messages from one publisher in publish order.
//! - **Isolation**: a panicking handler does not stop the others.
//! - **No history**: a handler registered after a dispatch never sees it.
//!   Consumers that care about current state subscribe first, then read the
//!   [`EntityRegistry`](crate::EntityRegistry).
//! - **Re-entrancy**: handlers may publish, subscribe or unsubscribe; the
//!   subscription list is snapshotted before handlers run.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use super::message::Message;
use super::subscribe::{HandlerFn, Subscribe};
use super::topic::Topic;

/// Opaque handle returned by [`Bus::subscribe`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

/// One registered handler.
struct Subscription {
    id: SubscriptionId,
    /// `None` = every topic.
    topic: Option<Topic>,
    handler: Arc<dyn Subscribe>,
}

#[derive(Default)]
struct Inner {
    subs: RwLock<Vec<Subscription>>,
    next_id: AtomicU64,
    panics: AtomicU64,
}

/// Synchronous publish/subscribe dispatcher.
///
/// Cheap to clone; clones share the same subscription table.
#[derive(Clone, Default)]
pub struct Bus {
    inner: Arc<Inner>,
}

impl Bus {
    /// Creates an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `topic` and returns its subscription id.
    pub fn subscribe(&self, topic: impl Into<Topic>, handler: Arc<dyn Subscribe>) -> SubscriptionId {
        self.insert(Some(topic.into()), handler)
    }

    /// Registers `handler` for every topic.
    pub fn subscribe_all(&self, handler: Arc<dyn Subscribe>) -> SubscriptionId {
        self.insert(None, handler)
    }

    /// Shorthand for subscribing a closure.
    pub fn subscribe_fn<F>(&self, topic: impl Into<Topic>, f: F) -> SubscriptionId
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        let topic = topic.into();
        let name = format!("fn:{topic}");
        self.subscribe(topic, HandlerFn::arc(name, f))
    }

    /// Removes exactly that registration.
    ///
    /// Returns `false` (and does nothing) for unknown or already-removed ids.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = self.inner.subs.write();
        match subs.iter().position(|s| s.id == id) {
            Some(idx) => {
                let sub = subs.remove(idx);
                tracing::debug!(
                    subscription = id.0,
                    handler = sub.handler.name(),
                    "unsubscribed"
                );
                true
            }
            None => false,
        }
    }

    /// Invokes every handler registered for the message's topic.
    ///
    /// Returns the number of handlers that were invoked (including ones that panicked).
    pub fn dispatch(&self, message: &Message) -> usize {
        let topic = message.topic();
        let handlers: Vec<Arc<dyn Subscribe>> = {
            let subs = self.inner.subs.read();
            subs.iter()
                .filter(|s| s.topic.as_ref().map_or(true, |t| *t == topic))
                .map(|s| Arc::clone(&s.handler))
                .collect()
        };

        for handler in &handlers {
            let res = panic::catch_unwind(AssertUnwindSafe(|| handler.on_message(message)));
            if let Err(payload) = res {
                self.inner.panics.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    handler = handler.name(),
                    topic = %topic,
                    panic = %panic_message(payload.as_ref()),
                    "bus handler panicked"
                );
            }
        }
        handlers.len()
    }

    /// Dispatches an owned message.
    pub fn publish(&self, message: Message) -> usize {
        self.dispatch(&message)
    }

    /// Number of handlers that would receive a message on `topic`.
    pub fn subscriber_count(&self, topic: &Topic) -> usize {
        self.inner
            .subs
            .read()
            .iter()
            .filter(|s| s.topic.as_ref().map_or(true, |t| t == topic))
            .count()
    }

    /// Total number of handler panics caught so far.
    pub fn handler_panics(&self) -> u64 {
        self.inner.panics.load(Ordering::Relaxed)
    }

    fn insert(&self, topic: Option<Topic>, handler: Arc<dyn Subscribe>) -> SubscriptionId {
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        tracing::debug!(
            subscription = id.0,
            handler = handler.name(),
            topic = topic.as_ref().map_or("*", Topic::as_str),
            "subscribed"
        );
        self.inner.subs.write().push(Subscription { id, topic, handler });
        id
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    fn log_line(text: &str) -> Message {
        Message::from_parts("log", json!({ "text": text })).unwrap()
    }

    fn recorder(bus: &Bus, topic: Topic, tag: &'static str, out: &Arc<Mutex<Vec<String>>>) -> SubscriptionId {
        let out = Arc::clone(out);
        bus.subscribe_fn(topic, move |msg| {
            if let Message::Other { body, .. } = msg {
                out.lock().push(format!("{tag}:{}", body["text"].as_str().unwrap_or("")));
            }
        })
    }

    #[test]
    fn test_fan_out_in_publish_order() {
        let bus = Bus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        recorder(&bus, Topic::Log, "a", &seen);
        recorder(&bus, Topic::Log, "b", &seen);
        recorder(&bus, Topic::Echo, "c", &seen);

        bus.publish(log_line("1"));
        bus.publish(log_line("2"));

        assert_eq!(*seen.lock(), vec!["a:1", "b:1", "a:2", "b:2"]);
    }

    #[test]
    fn test_unsubscribe_leaves_others_untouched() {
        let bus = Bus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let a = recorder(&bus, Topic::Log, "a", &seen);
        recorder(&bus, Topic::Log, "b", &seen);

        assert!(bus.unsubscribe(a));
        assert!(!bus.unsubscribe(a));
        bus.publish(log_line("x"));

        assert_eq!(*seen.lock(), vec!["b:x"]);
        assert_eq!(bus.subscriber_count(&Topic::Log), 1);
    }

    #[test]
    fn test_panicking_handler_is_isolated() {
        let bus = Bus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe_fn(Topic::Log, |_| panic!("boom"));
        recorder(&bus, Topic::Log, "ok", &seen);

        assert_eq!(bus.publish(log_line("1")), 2);
        assert_eq!(*seen.lock(), vec!["ok:1"]);
        assert_eq!(bus.handler_panics(), 1);
    }

    #[test]
    fn test_no_history_for_late_subscribers() {
        let bus = Bus::new();
        bus.publish(log_line("early"));

        let seen = Arc::new(Mutex::new(Vec::new()));
        recorder(&bus, Topic::Log, "late", &seen);
        bus.publish(log_line("after"));

        assert_eq!(*seen.lock(), vec!["late:after"]);
    }

    #[test]
    fn test_wildcard_and_reentrant_unsubscribe() {
        let bus = Bus::new();
        let hits = Arc::new(Mutex::new(0usize));
        let hits_w = Arc::clone(&hits);
        bus.subscribe_all(HandlerFn::arc("all", move |_: &Message| *hits_w.lock() += 1));

        let bus_inner = bus.clone();
        let own_id = Arc::new(Mutex::new(None));
        let own_id_w = Arc::clone(&own_id);
        let id = bus.subscribe_fn(Topic::Echo, move |_| {
            if let Some(id) = *own_id_w.lock() {
                bus_inner.unsubscribe(id);
            }
        });
        *own_id.lock() = Some(id);

        let echo = Message::from_parts("echo", json!({"text": "hi"})).unwrap();
        assert_eq!(bus.publish(echo.clone()), 2);
        assert_eq!(bus.publish(echo), 1);
        assert_eq!(*hits.lock(), 2);
    }
}
