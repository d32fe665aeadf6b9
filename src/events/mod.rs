//! Event system for session notifications
//!
//! Each session owns one [`EventBus`]. Consumers subscribe to exactly the
//! topics they need on attach and are removed from all of them on detach.

pub mod types;

pub use types::{EventKind, SessionEvent, SessionStatus};

use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::mpsc;

/// Identifier of a subscriber (the consumer id)
pub type SubscriberId = u64;

/// Delivery channel of one subscriber
pub type EventSink = mpsc::UnboundedSender<SessionEvent>;

/// Topic-per-kind publish/subscribe bus
///
/// Delivery is unbounded so publishing never waits on a slow consumer.
/// Sinks whose receiver was dropped are pruned on the next publish.
///
/// # Example
///
/// ```no_run
/// use camview::events::{EventBus, EventKind, SessionEvent};
/// use tokio::sync::mpsc;
///
/// let bus = EventBus::new();
/// let (tx, mut rx) = mpsc::unbounded_channel();
/// bus.subscribe(1, &[EventKind::Heartbeat], tx);
///
/// bus.publish(SessionEvent::Heartbeat { live: true });
/// ```
pub struct EventBus {
    topics: Mutex<HashMap<EventKind, Vec<(SubscriberId, EventSink)>>>,
}

impl EventBus {
    /// Create a new event bus
    pub fn new() -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
        }
    }

    /// Subscribe `id` to `kinds`, replacing any previous subscription of `id`
    /// to the same topics
    pub fn subscribe(&self, id: SubscriberId, kinds: &[EventKind], sink: EventSink) {
        let mut topics = self.topics.lock();
        for kind in kinds {
            let subscribers = topics.entry(*kind).or_default();
            subscribers.retain(|(sid, _)| *sid != id);
            subscribers.push((id, sink.clone()));
        }
    }

    /// Remove `id` from every topic
    pub fn unsubscribe(&self, id: SubscriberId) {
        let mut topics = self.topics.lock();
        for subscribers in topics.values_mut() {
            subscribers.retain(|(sid, _)| *sid != id);
        }
        topics.retain(|_, subscribers| !subscribers.is_empty());
    }

    /// Publish an event to every subscriber of its topic
    ///
    /// Returns the number of subscribers the event was delivered to.
    pub fn publish(&self, event: SessionEvent) -> usize {
        let kind = event.kind();
        let mut topics = self.topics.lock();
        let Some(subscribers) = topics.get_mut(&kind) else {
            return 0;
        };

        subscribers.retain(|(_, sink)| !sink.is_closed());
        let mut delivered = 0;
        for (_, sink) in subscribers.iter() {
            if sink.send(event.clone()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Deliver an event to one subscriber, if it subscribed to the topic
    pub fn publish_to(&self, id: SubscriberId, event: SessionEvent) -> bool {
        let topics = self.topics.lock();
        topics
            .get(&event.kind())
            .and_then(|subscribers| subscribers.iter().find(|(sid, _)| *sid == id))
            .map(|(_, sink)| sink.send(event).is_ok())
            .unwrap_or(false)
    }

    /// Number of subscribers on a topic
    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.topics.lock().get(&kind).map(Vec::len).unwrap_or(0)
    }

    /// Whether `id` holds any subscription
    pub fn is_subscribed(&self, id: SubscriberId) -> bool {
        self.topics
            .lock()
            .values()
            .any(|subscribers| subscribers.iter().any(|(sid, _)| *sid == id))
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
