//! In-process publish/subscribe with a bounded history.

use std::collections::{HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use dccrpc_common::protocol::error::Result;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Subscribers under this type receive every event.
pub const WILDCARD: &str = "*";

pub const DEFAULT_HISTORY_SIZE: usize = 100;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: Value,
    pub source: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(event_type: impl Into<String>, data: Value, source: Option<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            event_type: event_type.into(),
            data,
            source,
            timestamp: Utc::now(),
        }
    }
}

type EventHandler = Arc<dyn Fn(&Event) -> Result<()> + Send + Sync>;

struct BusInner {
    subscribers: Mutex<HashMap<String, Vec<(u64, EventHandler)>>>,
    history: Mutex<VecDeque<Event>>,
    history_size: usize,
    next_id: AtomicU64,
}

/// Event bus. Clones share the same subscribers and history.
///
/// Handlers run on the publishing thread, after the bus locks are released,
/// so a handler may itself publish or subscribe. A failing or panicking
/// handler is logged and does not affect other handlers.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_SIZE)
    }
}

impl EventBus {
    pub fn new(history_size: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                subscribers: Mutex::new(HashMap::new()),
                history: Mutex::new(VecDeque::with_capacity(history_size.min(1024))),
                history_size,
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Subscribes to one event type, or to all of them with [`WILDCARD`].
    pub fn subscribe<F>(&self, event_type: &str, handler: F) -> Subscription
    where
        F: Fn(&Event) -> Result<()> + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .subscribers
            .lock()
            .entry(event_type.to_string())
            .or_default()
            .push((id, Arc::new(handler)));

        Subscription {
            bus: Arc::downgrade(&self.inner),
            event_type: event_type.to_string(),
            id,
        }
    }

    /// Records the event and delivers it. Returns the event id.
    pub fn publish(&self, event: Event) -> String {
        {
            let mut history = self.inner.history.lock();
            history.push_back(event.clone());
            while history.len() > self.inner.history_size {
                history.pop_front();
            }
        }

        let handlers: Vec<EventHandler> = {
            let subscribers = self.inner.subscribers.lock();
            [event.event_type.as_str(), WILDCARD]
                .iter()
                .filter_map(|t| subscribers.get(*t))
                .flatten()
                .map(|(_, handler)| handler.clone())
                .collect()
        };

        for handler in handlers {
            match panic::catch_unwind(AssertUnwindSafe(|| handler(&event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::error!(event_type = %event.event_type, error = %e, "Event handler failed");
                }
                Err(_) => {
                    tracing::error!(event_type = %event.event_type, "Event handler panicked");
                }
            }
        }

        event.id
    }

    /// Shorthand for publishing a new event.
    pub fn emit(&self, event_type: &str, data: Value, source: Option<&str>) -> String {
        self.publish(Event::new(event_type, data, source.map(str::to_string)))
    }

    /// The last `limit` events, optionally of one type, oldest first.
    pub fn get_history(&self, event_type: Option<&str>, limit: usize) -> Vec<Event> {
        let history = self.inner.history.lock();
        let mut events: Vec<Event> = history
            .iter()
            .rev()
            .filter(|e| event_type.map_or(true, |t| e.event_type == t))
            .take(limit)
            .cloned()
            .collect();
        events.reverse();
        events
    }

    pub fn subscriber_count(&self, event_type: &str) -> usize {
        self.inner
            .subscribers
            .lock()
            .get(event_type)
            .map_or(0, Vec::len)
    }

    pub fn clear_history(&self) {
        self.inner.history.lock().clear();
    }
}

/// Handle returned by [`EventBus::subscribe`].
///
/// Dropping it keeps the subscription alive.
#[derive(Debug)]
pub struct Subscription {
    bus: Weak<BusInner>,
    event_type: String,
    id: u64,
}

impl Subscription {
    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    /// Removes the handler. Returns false when it was already gone.
    pub fn unsubscribe(self) -> bool {
        let Some(bus) = self.bus.upgrade() else {
            return false;
        };
        let mut subscribers = bus.subscribers.lock();
        let Some(handlers) = subscribers.get_mut(&self.event_type) else {
            return false;
        };

        let before = handlers.len();
        handlers.retain(|(id, _)| *id != self.id);
        let removed = handlers.len() != before;
        if handlers.is_empty() {
            subscribers.remove(&self.event_type);
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dccrpc_common::protocol::error::RpcError;
    use serde_json::json;

    #[test]
    fn test_exact_and_wildcard_delivery() {
        let bus = EventBus::default();
        let exact = Arc::new(Mutex::new(Vec::new()));
        let all = Arc::new(Mutex::new(Vec::new()));

        let sink = exact.clone();
        bus.subscribe("scene_saved", move |e| {
            sink.lock().push(e.data.clone());
            Ok(())
        });
        let sink = all.clone();
        bus.subscribe(WILDCARD, move |e| {
            sink.lock().push(e.event_type.clone());
            Ok(())
        });

        bus.emit("scene_saved", json!({"path": "a.ma"}), None);
        bus.emit("render_done", json!(null), Some("farm"));

        assert_eq!(*exact.lock(), vec![json!({"path": "a.ma"})]);
        assert_eq!(*all.lock(), vec!["scene_saved", "render_done"]);
    }

    #[test]
    fn test_failing_handlers_do_not_stop_delivery() {
        let bus = EventBus::default();
        let delivered = Arc::new(AtomicU64::new(0));

        bus.subscribe("tick", |_| Err(RpcError::Validation("nope".into())));
        bus.subscribe("tick", |_| panic!("handler bug"));
        let counter = delivered.clone();
        bus.subscribe("tick", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        bus.emit("tick", json!(1), None);
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_handler_can_publish() {
        let bus = EventBus::default();
        let inner_bus = bus.clone();
        bus.subscribe("outer", move |_| {
            inner_bus.emit("inner", json!(null), None);
            Ok(())
        });

        bus.emit("outer", json!(null), None);
        let types: Vec<String> = bus.get_history(None, 10).into_iter().map(|e| e.event_type).collect();
        assert_eq!(types, vec!["outer", "inner"]);
    }

    #[test]
    fn test_history_is_bounded_and_filtered() {
        let bus = EventBus::new(5);
        for i in 0..8 {
            let kind = if i % 2 == 0 { "even" } else { "odd" };
            bus.emit(kind, json!(i), None);
        }

        let all = bus.get_history(None, 100);
        let data: Vec<Value> = all.iter().map(|e| e.data.clone()).collect();
        assert_eq!(data, vec![json!(3), json!(4), json!(5), json!(6), json!(7)]);

        let odd = bus.get_history(Some("odd"), 1);
        assert_eq!(odd.len(), 1);
        assert_eq!(odd[0].data, json!(7));

        bus.clear_history();
        assert!(bus.get_history(None, 10).is_empty());
    }

    #[test]
    fn test_default_history_keeps_last_hundred() {
        let bus = EventBus::default();
        for i in 0..105 {
            bus.emit("frame_changed", json!({ "frame": i }), None);
        }

        let history = bus.get_history(None, usize::MAX);
        assert_eq!(history.len(), DEFAULT_HISTORY_SIZE);
        let frames: Vec<Value> = history.iter().map(|e| e.data["frame"].clone()).collect();
        let expected: Vec<Value> = (5..105).map(|i| json!(i)).collect();
        assert_eq!(frames, expected);
    }

    #[test]
    fn test_unsubscribe() {
        let bus = EventBus::default();
        let count = Arc::new(AtomicU64::new(0));
        let counter = count.clone();
        let subscription = bus.subscribe("ping", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        bus.emit("ping", json!(null), None);
        assert_eq!(bus.subscriber_count("ping"), 1);
        assert!(subscription.unsubscribe());
        assert_eq!(bus.subscriber_count("ping"), 0);

        bus.emit("ping", json!(null), None);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_event_serializes_type_field() {
        let event = Event::new("saved", json!(1), Some("maya".into()));
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], json!("saved"));
        assert_eq!(value["source"], json!("maya"));
        assert_eq!(value["id"].as_str().unwrap().len(), 36);
    }
}
