//! Local event bus: synchronous fan-out to predicate-matched subscribers.

// Layer 1: Standard library
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

// Layer 2: Third-party
use parking_lot::RwLock;

// Layer 3: Internal
use crate::event::CoreEvent;

/// Handle returned by `subscribe`; pass back to `unsubscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Predicate = Arc<dyn Fn(&CoreEvent) -> bool + Send + Sync>;
type Callback = Arc<dyn Fn(&CoreEvent) + Send + Sync>;

struct LocalSubscriber {
    id: SubscriptionId,
    predicate: Predicate,
    callback: Callback,
}

/// In-process bus. `publish` delivers synchronously on the publishing
/// task, in subscription order, so per-publisher FIFO holds locally.
#[derive(Default)]
pub struct LocalEventBus {
    subscribers: RwLock<Vec<LocalSubscriber>>,
    next_id: AtomicU64,
}

impl LocalEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe with an arbitrary predicate.
    pub fn subscribe<P, F>(&self, predicate: P, callback: F) -> SubscriptionId
    where
        P: Fn(&CoreEvent) -> bool + Send + Sync + 'static,
        F: Fn(&CoreEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers.write().push(LocalSubscriber {
            id,
            predicate: Arc::new(predicate),
            callback: Arc::new(callback),
        });
        id
    }

    /// Subscribe to one event family by class name.
    pub fn subscribe_type<F>(&self, event_type: &str, callback: F) -> SubscriptionId
    where
        F: Fn(&CoreEvent) + Send + Sync + 'static,
    {
        let wanted = event_type.to_string();
        self.subscribe(move |event| event.event_type() == wanted, callback)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.subscribers.write().retain(|s| s.id != id);
    }

    /// Deliver to every matching subscriber, synchronously.
    pub fn publish(&self, event: &CoreEvent) {
        let matching: Vec<Callback> = {
            let subscribers = self.subscribers.read();
            subscribers
                .iter()
                .filter(|s| (s.predicate)(event))
                .map(|s| Arc::clone(&s.callback))
                .collect()
        };
        for callback in matching {
            callback(event);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Tests are allowed to use unwrap for simplicity
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn evict(namespace: &str) -> CoreEvent {
        CoreEvent::CacheEvict {
            namespace: namespace.to_string(),
            key: None,
        }
    }

    #[test]
    fn test_type_filter_matches_only_that_family() {
        let bus = LocalEventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bus.subscribe_type("CacheEvict", move |event| {
            sink.lock().push(event.event_type().to_string());
        });

        bus.publish(&evict("player"));
        bus.publish(&CoreEvent::GuildDissolve { guild_id: 1 });
        bus.publish(&evict("guild"));

        assert_eq!(seen.lock().as_slice(), ["CacheEvict", "CacheEvict"]);
    }

    #[test]
    fn test_publish_order_is_per_publisher_fifo() {
        let bus = LocalEventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bus.subscribe(|_| true, move |event| {
            if let CoreEvent::CacheEvict { namespace, .. } = event {
                sink.lock().push(namespace.clone());
            }
        });

        for i in 0..10 {
            bus.publish(&evict(&format!("ns-{i}")));
        }
        let expected: Vec<String> = (0..10).map(|i| format!("ns-{i}")).collect();
        assert_eq!(*seen.lock(), expected);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let bus = LocalEventBus::new();
        let count = Arc::new(Mutex::new(0u32));
        let sink = Arc::clone(&count);
        let id = bus.subscribe(|_| true, move |_| *sink.lock() += 1);

        bus.publish(&evict("a"));
        bus.unsubscribe(id);
        bus.publish(&evict("b"));

        assert_eq!(*count.lock(), 1);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_multiple_subscribers_all_fire() {
        let bus = LocalEventBus::new();
        let count = Arc::new(Mutex::new(0u32));
        for _ in 0..3 {
            let sink = Arc::clone(&count);
            bus.subscribe_type("GuildDissolve", move |_| *sink.lock() += 1);
        }
        bus.publish(&CoreEvent::GuildDissolve { guild_id: 9 });
        assert_eq!(*count.lock(), 3);
    }
}
