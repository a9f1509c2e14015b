//! Event Bus (C8): in-process pub/sub keyed by topic (`user:<id>`), §4.7.
//!
//! Each topic gets its own `tokio::sync::broadcast` channel. That channel
//! already gives us everything §4.7/§5 ask for: non-blocking `publish`,
//! a bounded per-subscriber buffer, and — when a slow subscriber falls
//! behind — `Err(RecvError::Lagged(n))` instead of back-pressuring the
//! publisher, which is exactly the "best-effort, drop and report a count"
//! contract. The topic table itself is guarded by a `parking_lot::RwLock`
//! (the "reader-preferring lock" from §5): `publish` only needs a read lock
//! to look up an existing sender, `subscribe` takes a write lock only the
//! first time a topic is touched.

use std::collections::HashMap;

use parking_lot::RwLock;
use tokio::sync::broadcast;

use crate::events::CaptureEvent;

const DEFAULT_TOPIC_CAPACITY: usize = 64;

pub struct EventBus {
    topics: RwLock<HashMap<String, broadcast::Sender<CaptureEvent>>>,
    capacity: usize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_TOPIC_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    /// Best-effort publish. If nobody is subscribed to `topic`, the event
    /// is simply dropped — there is nothing to deliver it to yet.
    pub fn publish(&self, topic: &str, event: CaptureEvent) {
        if let Some(sender) = self.topics.read().get(topic) {
            // `send` only errors when there are zero receivers, which is a
            // race with a subscriber disconnecting — not worth logging.
            let _ = sender.send(event);
        }
    }

    /// Subscribe to `topic`, creating it if this is the first subscriber.
    pub fn subscribe(&self, topic: &str) -> broadcast::Receiver<CaptureEvent> {
        if let Some(sender) = self.topics.read().get(topic) {
            return sender.subscribe();
        }
        let mut guard = self.topics.write();
        let sender = guard
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0);
        sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe("user:u1");
        bus.publish("user:u1", CaptureEvent::progress("cap-1", "classifying", Utc::now()));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.capture_id, "cap-1");
    }

    #[tokio::test]
    async fn publish_with_no_subscribers_is_a_silent_noop() {
        let bus = EventBus::default();
        bus.publish("user:nobody", CaptureEvent::progress("cap-1", "classifying", Utc::now()));
    }

    #[tokio::test]
    async fn lagging_subscriber_observes_a_lagged_error_not_a_block() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe("user:u1");
        for i in 0..5 {
            bus.publish(
                "user:u1",
                CaptureEvent::progress(format!("cap-{i}"), "classifying", Utc::now()),
            );
        }
        let err = rx.recv().await.unwrap_err();
        assert!(matches!(err, broadcast::error::RecvError::Lagged(_)));
    }

    #[tokio::test]
    async fn two_topics_are_independent() {
        let bus = EventBus::default();
        let mut rx_a = bus.subscribe("user:a");
        let mut rx_b = bus.subscribe("user:b");
        bus.publish("user:a", CaptureEvent::progress("cap-1", "classifying", Utc::now()));
        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_err());
    }
}
