//! In-process publish/subscribe fan-out.

use super::Event;

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

struct Subscriber {
    patterns: Vec<String>,
    tx: mpsc::Sender<Arc<Event>>,
}

/// Receiving side of a subscription.
pub struct Subscription {
    pub id: u64,
    rx: mpsc::Receiver<Arc<Event>>,
}

impl Subscription {
    /// `None` once the bus has dropped this subscriber.
    pub async fn recv(&mut self) -> Option<Arc<Event>> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Arc<Event>> {
        self.rx.try_recv().ok()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BusStats {
    pub subscribers: usize,
    pub published: u64,
    pub dropped_subscribers: u64,
}

/// Fans events out to subscribers by subject pattern.
///
/// Publishing never waits: a subscriber whose buffer is full is removed and
/// counted, and its receiver sees the end of the stream.
pub struct EventBus {
    subscribers: Mutex<HashMap<u64, Subscriber>>,
    next_id: AtomicU64,
    published: AtomicU64,
    dropped: AtomicU64,
    buffer: usize,
}

impl EventBus {
    pub fn new(buffer: usize) -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            published: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            buffer: buffer.max(1),
        }
    }

    /// Subscribe to every subject matching any of `patterns`.
    ///
    /// Patterns are dot-separated; `*` matches one token and a trailing `>`
    /// matches one or more.
    pub fn subscribe<S: AsRef<str>>(&self, patterns: &[S]) -> Subscription {
        let (tx, rx) = mpsc::channel(self.buffer);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let patterns = patterns.iter().map(|p| p.as_ref().to_string()).collect();

        self.subscribers.lock().insert(id, Subscriber { patterns, tx });
        Subscription { id, rx }
    }

    pub fn unsubscribe(&self, id: u64) {
        self.subscribers.lock().remove(&id);
    }

    /// Deliver `event` at most once to each interested subscriber.
    pub fn publish(&self, event: Event) {
        let subjects = event.subjects();
        let event = Arc::new(event);
        self.published.fetch_add(1, Ordering::Relaxed);

        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|id, sub| {
            let wanted = sub
                .patterns
                .iter()
                .any(|p| subjects.iter().any(|s| subject_matches(p, s)));
            if !wanted {
                return true;
            }

            match sub.tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!("Dropping slow event subscriber {}", id);
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            subscribers: self.subscribers.lock().len(),
            published: self.published.load(Ordering::Relaxed),
            dropped_subscribers: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// NATS-style subject matching.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern = pattern.split('.');
    let mut subject = subject.split('.');

    loop {
        match (pattern.next(), subject.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => {}
            (Some(p), Some(s)) if p == s => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{ControllerStatus, TagValue};
    use crate::protocol::Value;
    use chrono::Utc;

    fn tag_event(controller_id: i64, tag_id: i64) -> Event {
        Event::TagValue(TagValue {
            controller_id,
            controller_name: format!("plc-{}", controller_id),
            tag_id,
            tag_name: format!("tag-{}", tag_id),
            value: Value::Word(1),
            timestamp: Utc::now(),
        })
    }

    #[test]
    fn test_subject_matching() {
        assert!(subject_matches("plc.status", "plc.status"));
        assert!(subject_matches("plc.status.*", "plc.status.4"));
        assert!(!subject_matches("plc.status.*", "plc.status"));
        assert!(subject_matches("plc.>", "plc.tags.updates.1.2"));
        assert!(!subject_matches("plc.>", "plc"));
        assert!(!subject_matches("faults.updates", "faults.updates.1"));
    }

    #[tokio::test]
    async fn test_delivers_once_per_publish() {
        let bus = EventBus::new(8);
        // both patterns match the same event
        let mut sub = bus.subscribe(&["plc.tags.updates", "plc.tags.updates.1.*"]);
        let mut other = bus.subscribe(&["plc.tags.updates.2"]);

        bus.publish(tag_event(1, 5));

        assert!(sub.recv().await.is_some());
        assert!(sub.try_recv().is_none());
        assert!(other.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_slow_subscriber_is_dropped() {
        let bus = EventBus::new(1);
        let mut slow = bus.subscribe(&[">"]);
        let mut fast = bus.subscribe(&["plc.status"]);

        let status = Event::ControllerStatus(ControllerStatus {
            controller_id: 1,
            name: "plc-1".to_string(),
            connected: true,
            last_error: None,
            last_read: None,
            timestamp: Utc::now(),
        });

        bus.publish(status.clone());
        assert!(fast.recv().await.is_some());
        bus.publish(status);

        let stats = bus.stats();
        assert_eq!(stats.dropped_subscribers, 1);
        assert_eq!(stats.subscribers, 1);
        assert_eq!(stats.published, 2);

        // the buffered event is still delivered, then the stream ends
        assert!(slow.recv().await.is_some());
        assert!(slow.recv().await.is_none());
        assert!(fast.recv().await.is_some());
    }
}
