// Event outbox: an append-only log plus synchronous listeners.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use log::warn;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventProvenance {
    pub content_hash: String,
    pub ir_hash: String,
    pub compiler_version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmittedEvent {
    pub name: String,
    pub channel: String,
    pub payload: serde_json::Value,
    /// Milliseconds since the Unix epoch, from the engine clock.
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provenance: Option<EventProvenance>,
}

pub type ListenerError = Box<dyn std::error::Error + Send + Sync>;
pub type EventListener = Arc<dyn Fn(&EmittedEvent) -> Result<(), ListenerError> + Send + Sync>;

type ListenerList = Mutex<Vec<(u64, EventListener)>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Default)]
pub struct EventBus {
    log: Mutex<Vec<EmittedEvent>>,
    listeners: Arc<ListenerList>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("events", &lock(&self.log).len())
            .field("listeners", &lock(&self.listeners).len())
            .finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener. Listeners run in registration order.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&EmittedEvent) -> Result<(), ListenerError> + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let listener: EventListener = Arc::new(listener);
        lock(&self.listeners).push((id, listener));
        Subscription {
            id,
            listeners: Arc::downgrade(&self.listeners),
        }
    }

    /// Append to the log, then notify every listener on the caller's stack.
    /// A listener that fails or panics is logged and skipped.
    pub fn publish(&self, event: &EmittedEvent) {
        lock(&self.log).push(event.clone());
        let listeners: Vec<EventListener> = lock(&self.listeners)
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in listeners {
            match catch_unwind(AssertUnwindSafe(|| listener(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("event listener failed on '{}': {}", event.name, e),
                Err(_) => warn!("event listener panicked on '{}'", event.name),
            }
        }
    }

    pub fn log(&self) -> Vec<EmittedEvent> {
        lock(&self.log).clone()
    }

    pub fn clear(&self) {
        lock(&self.log).clear();
    }
}

/// Handle returned by [`EventBus::subscribe`].
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    listeners: Weak<ListenerList>,
}

impl Subscription {
    pub fn unregister(self) {
        if let Some(listeners) = self.listeners.upgrade() {
            lock(&listeners).retain(|(id, _)| *id != self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(name: &str) -> EmittedEvent {
        EmittedEvent {
            name: name.to_string(),
            channel: name.to_string(),
            payload: json!({}),
            timestamp: 0,
            provenance: None,
        }
    }

    #[test]
    fn failing_listeners_do_not_stop_later_ones() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe(|_| Err("boom".into()));
        bus.subscribe(|_| panic!("listener panic"));
        let sink = Arc::clone(&seen);
        bus.subscribe(move |e| {
            sink.lock().unwrap().push(e.name.clone());
            Ok(())
        });

        bus.publish(&event("A"));
        bus.publish(&event("B"));
        assert_eq!(*seen.lock().unwrap(), vec!["A".to_string(), "B".to_string()]);
        assert_eq!(bus.log().len(), 2);
    }

    #[test]
    fn unregister_stops_delivery() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&count);
        let subscription = bus.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        bus.publish(&event("A"));
        subscription.unregister();
        bus.publish(&event("B"));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        bus.clear();
        assert!(bus.log().is_empty());
    }
}
