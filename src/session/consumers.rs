//! Attached viewers of a session

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::events::{EventKind, SubscriberId};

pub type ConsumerId = SubscriberId;

static NEXT_CONSUMER_ID: AtomicU64 = AtomicU64::new(1);

/// A viewer attached to a session
///
/// The viewer keeps the handle and reports its visibility and whether it is
/// presenting the live stream; the session only reads those flags.
#[derive(Debug)]
pub struct ConsumerHandle {
    id: ConsumerId,
    visible: AtomicBool,
    rendering: AtomicBool,
    allow_background: bool,
    debug: bool,
    poll_interval: Option<Duration>,
    kinds: Vec<EventKind>,
}

impl ConsumerHandle {
    pub fn new() -> Self {
        Self {
            id: NEXT_CONSUMER_ID.fetch_add(1, Ordering::Relaxed),
            visible: AtomicBool::new(true),
            rendering: AtomicBool::new(false),
            allow_background: false,
            debug: false,
            poll_interval: None,
            kinds: EventKind::CONSUMER_DEFAULT.to_vec(),
        }
    }

    pub fn visible(self, visible: bool) -> Self {
        self.visible.store(visible, Ordering::SeqCst);
        self
    }

    /// May hold the session in background while invisible
    pub fn allow_background(mut self, allow: bool) -> Self {
        self.allow_background = allow;
        self
    }

    /// Turn on session tracing when attached
    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Requested snapshot polling interval; zero disables polling
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }

    /// Replace the subscribed topics
    pub fn events(mut self, kinds: &[EventKind]) -> Self {
        self.kinds = kinds.to_vec();
        self
    }

    pub fn id(&self) -> ConsumerId {
        self.id
    }

    pub fn is_visible(&self) -> bool {
        self.visible.load(Ordering::SeqCst)
    }

    pub(crate) fn set_visible(&self, visible: bool) {
        self.visible.store(visible, Ordering::SeqCst);
    }

    pub fn is_rendering(&self) -> bool {
        self.rendering.load(Ordering::SeqCst)
    }

    /// Reported by the media pipeline while it presents the live stream
    pub fn set_rendering(&self, rendering: bool) {
        self.rendering.store(rendering, Ordering::SeqCst);
    }

    pub fn allows_background(&self) -> bool {
        self.allow_background
    }

    pub fn is_debug(&self) -> bool {
        self.debug
    }

    pub fn requested_poll_interval(&self) -> Option<Duration> {
        self.poll_interval
    }

    pub fn event_kinds(&self) -> &[EventKind] {
        &self.kinds
    }
}

impl Default for ConsumerHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Consumers attached to one session, in attach order
#[derive(Default)]
pub struct ConsumerRegistry {
    consumers: Vec<Arc<ConsumerHandle>>,
    background_holder: Option<ConsumerId>,
}

impl ConsumerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` if the consumer was already attached
    pub fn insert(&mut self, consumer: Arc<ConsumerHandle>) -> bool {
        if self.contains(consumer.id()) {
            return false;
        }
        self.consumers.push(consumer);
        true
    }

    pub fn remove(&mut self, id: ConsumerId) -> Option<Arc<ConsumerHandle>> {
        let index = self.consumers.iter().position(|c| c.id() == id)?;
        if self.background_holder == Some(id) {
            self.background_holder = None;
        }
        Some(self.consumers.remove(index))
    }

    pub fn contains(&self, id: ConsumerId) -> bool {
        self.consumers.iter().any(|c| c.id() == id)
    }

    pub fn len(&self) -> usize {
        self.consumers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.consumers.is_empty()
    }

    pub fn any_visible(&self) -> bool {
        self.consumers.iter().any(|c| c.is_visible())
    }

    pub fn any_rendering(&self) -> bool {
        self.consumers.iter().any(|c| c.is_rendering())
    }

    pub fn any_debug(&self) -> bool {
        self.consumers.iter().any(|c| c.is_debug())
    }

    /// Smallest interval requested by any consumer, else `default`
    pub fn min_poll_interval(&self, default: Duration) -> Duration {
        self.consumers
            .iter()
            .filter_map(|c| c.requested_poll_interval())
            .min()
            .unwrap_or(default)
    }

    pub fn background_holder(&self) -> Option<ConsumerId> {
        self.background_holder
    }

    /// Make `id` the background holder
    ///
    /// Returns the other attached consumers that are invisible and must let
    /// go of the shared sink.
    pub fn claim_background(&mut self, id: ConsumerId) -> Vec<ConsumerId> {
        if !self.contains(id) {
            return Vec::new();
        }
        self.background_holder = Some(id);
        self.consumers
            .iter()
            .filter(|c| c.id() != id && !c.is_visible())
            .map(|c| c.id())
            .collect()
    }

    pub fn handles(&self) -> Vec<Arc<ConsumerHandle>> {
        self.consumers.clone()
    }
}
