//! Change-event fan-out.
//!
//! Every CRUD mutation yields an [`Event`] delivered to all registered
//! [`Publisher`]s after the originating transaction releases its locks.
//! Payloads are deep-cloned into the event at enqueue time, so later
//! mutations of the live object never leak into subscribers.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub time: chrono::DateTime<chrono::Utc>,
    /// The object prefix this event concerns.
    #[serde(rename = "type")]
    pub kind: String,
    pub action: String,
    pub key: String,
    #[serde(default)]
    pub principal: String,
    #[serde(default)]
    pub object: serde_json::Value,
}

impl Event {
    pub fn new(
        kind: &str,
        action: &str,
        key: &str,
        principal: &str,
        object: serde_json::Value,
    ) -> Self {
        Self {
            time: chrono::Utc::now(),
            kind: kind.to_owned(),
            action: action.to_owned(),
            key: key.to_owned(),
            principal: principal.to_owned(),
            object,
        }
    }
}

pub trait Publisher: Send + Sync {
    fn publish(&self, event: &Event);
    fn name(&self) -> &str;
}

/// Registry of publishers. Delivery is sequential in registration
/// order; a panicking or slow publisher is a subscriber bug, not an
/// engine concern.
#[derive(Default)]
pub struct Publishers {
    subs: Mutex<Vec<Arc<dyn Publisher>>>,
}

impl Publishers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, p: Arc<dyn Publisher>) {
        self.subs.lock().expect("publisher registry poisoned").push(p);
    }

    pub fn remove(&self, name: &str) {
        self.subs
            .lock()
            .expect("publisher registry poisoned")
            .retain(|p| p.name() != name);
    }

    pub fn publish(&self, event: &Event) {
        let subs: Vec<Arc<dyn Publisher>> = self
            .subs
            .lock()
            .expect("publisher registry poisoned")
            .clone();
        if subs.is_empty() {
            return;
        }
        for sub in subs {
            sub.publish(event);
        }
    }

    pub fn count(&self) -> usize {
        self.subs.lock().expect("publisher registry poisoned").len()
    }
}

/// Publisher that logs events at debug level; handy default subscriber.
pub struct LogPublisher;

impl Publisher for LogPublisher {
    fn publish(&self, event: &Event) {
        tracing::debug!(
            "event {} {} {}:{}",
            event.action,
            event.principal,
            event.kind,
            event.key
        );
    }

    fn name(&self) -> &str {
        "log"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter {
        hits: AtomicUsize,
    }

    impl Publisher for Counter {
        fn publish(&self, _event: &Event) {
            self.hits.fetch_add(1, Ordering::SeqCst);
        }
        fn name(&self) -> &str {
            "counter"
        }
    }

    #[test]
    fn fan_out_reaches_all_subscribers() {
        let pubs = Publishers::new();
        let a = Arc::new(Counter { hits: AtomicUsize::new(0) });
        let b = Arc::new(Counter { hits: AtomicUsize::new(0) });
        pubs.add(a.clone());
        pubs.add(b.clone());
        pubs.publish(&Event::new("bootenvs", "create", "x", "test", serde_json::Value::Null));
        assert_eq!(a.hits.load(Ordering::SeqCst), 1);
        assert_eq!(b.hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn remove_unsubscribes() {
        let pubs = Publishers::new();
        let a = Arc::new(Counter { hits: AtomicUsize::new(0) });
        pubs.add(a.clone());
        pubs.remove("counter");
        pubs.publish(&Event::new("bootenvs", "save", "x", "test", serde_json::Value::Null));
        assert_eq!(a.hits.load(Ordering::SeqCst), 0);
        assert_eq!(pubs.count(), 0);
    }
}
