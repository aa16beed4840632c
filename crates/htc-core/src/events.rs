//! In-process event bus
//!
//! Single-process, typed pub/sub with per-subscriber bounded queues.
//! Publishing never blocks: a subscriber whose queue is full loses its
//! oldest event and has a lag counter bumped, so one stalled consumer
//! cannot back up the watchers or the orchestrator.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::warn;

/// Events exchanged between the pipeline components.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// A `HAProxyTemplateConfig` was loaded (or re-loaded) and converted.
    ConfigLoaded {
        /// `metadata.generation` of the loaded config
        generation: i64,
    },
    /// The loaded config passed its structural invariants.
    ConfigValidated {
        /// Generation the validation applies to
        generation: i64,
    },
    /// Templates rendered into a candidate artifact.
    TemplateRendered {
        /// Checksum of the candidate main config
        checksum: String,
    },
    /// All three validation phases passed for the candidate.
    ValidationCompleted {
        /// Checksum of the validated main config
        checksum: String,
    },
    /// Rendering or validation failed; the candidate is rejected.
    ValidationFailed {
        /// Full error text, including config-context snippets
        error: String,
    },
    /// The `HAProxyCfg` and auxiliary resources were written.
    ConfigPublished {
        /// Checksum of the published main config
        checksum: String,
    },
    /// Writing the output resources failed.
    ConfigPublishFailed {
        /// Error text
        error: String,
    },
    /// One HAProxy pod now matches the artifact.
    ConfigAppliedToPod {
        /// Pod name
        pod: String,
        /// Checksum that was applied
        checksum: String,
    },
    /// A target HAProxy pod went away.
    HAProxyPodTerminated {
        /// Pod name
        pod: String,
    },
    /// This replica became the leader.
    AcquiredLeadership,
    /// This replica lost the lease.
    LostLeadership,
    /// A watched store changed; carries the user-chosen alias.
    ResourcesChanged {
        /// Alias under which the resource kind is exposed to templates
        alias: String,
    },
}

struct SubscriberQueue {
    buf: Mutex<VecDeque<Event>>,
    capacity: usize,
    notify: Notify,
    dropped: AtomicU64,
    closed: AtomicBool,
}

struct BusInner {
    subscribers: Mutex<Vec<Arc<SubscriberQueue>>>,
    published: AtomicU64,
}

/// The bus handle; cheap to clone, shared by every component.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                subscribers: Mutex::new(Vec::new()),
                published: AtomicU64::new(0),
            }),
        }
    }

    /// Register a subscriber with its own bounded queue.
    pub fn subscribe(&self, buffer: usize) -> Subscription {
        let queue = Arc::new(SubscriberQueue {
            buf: Mutex::new(VecDeque::with_capacity(buffer)),
            capacity: buffer.max(1),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        });
        self.inner.subscribers.lock().push(Arc::clone(&queue));
        Subscription {
            queue,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Deliver an event to every live subscriber. Never blocks; slow
    /// subscribers lose their oldest queued event.
    pub fn publish(&self, event: Event) {
        self.inner.published.fetch_add(1, Ordering::Relaxed);
        let mut subscribers = self.inner.subscribers.lock();
        subscribers.retain(|q| !q.closed.load(Ordering::Acquire));
        for queue in subscribers.iter() {
            let mut buf = queue.buf.lock();
            if buf.len() >= queue.capacity {
                buf.pop_front();
                let dropped = queue.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(dropped, "event bus subscriber lagging, dropped oldest event");
            }
            buf.push_back(event.clone());
            drop(buf);
            queue.notify.notify_one();
        }
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.inner.subscribers.lock();
        subscribers.retain(|q| !q.closed.load(Ordering::Acquire));
        subscribers.len()
    }

    /// Total events published over the bus lifetime.
    pub fn events_published(&self) -> u64 {
        self.inner.published.load(Ordering::Relaxed)
    }
}

/// Receiving side of one subscription. Dropping it detaches the queue.
pub struct Subscription {
    queue: Arc<SubscriberQueue>,
    bus: Weak<BusInner>,
}

impl Subscription {
    /// Wait for the next event. Returns `None` once the bus itself is gone
    /// and the queue has drained.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            if let Some(event) = self.queue.buf.lock().pop_front() {
                return Some(event);
            }
            if self.bus.strong_count() == 0 {
                return None;
            }
            self.queue.notify.notified().await;
        }
    }

    /// Non-blocking receive.
    pub fn try_recv(&mut self) -> Option<Event> {
        self.queue.buf.lock().pop_front()
    }

    /// How many events this subscriber has lost to back-pressure.
    pub fn dropped(&self) -> u64 {
        self.queue.dropped.load(Ordering::Relaxed)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.queue.closed.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivery_preserves_per_subscriber_order() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe(8);
        bus.publish(Event::AcquiredLeadership);
        bus.publish(Event::ResourcesChanged { alias: "ingresses".into() });
        bus.publish(Event::LostLeadership);

        assert_eq!(sub.recv().await, Some(Event::AcquiredLeadership));
        assert_eq!(
            sub.recv().await,
            Some(Event::ResourcesChanged { alias: "ingresses".into() })
        );
        assert_eq!(sub.recv().await, Some(Event::LostLeadership));
    }

    #[tokio::test]
    async fn fan_out_reaches_every_subscriber() {
        let bus = EventBus::new();
        let mut a = bus.subscribe(4);
        let mut b = bus.subscribe(4);
        bus.publish(Event::AcquiredLeadership);
        assert_eq!(a.recv().await, Some(Event::AcquiredLeadership));
        assert_eq!(b.recv().await, Some(Event::AcquiredLeadership));
        assert_eq!(bus.subscriber_count(), 2);
        assert_eq!(bus.events_published(), 1);
    }

    #[tokio::test]
    async fn slow_subscriber_drops_oldest() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe(2);
        bus.publish(Event::ResourcesChanged { alias: "a".into() });
        bus.publish(Event::ResourcesChanged { alias: "b".into() });
        bus.publish(Event::ResourcesChanged { alias: "c".into() });

        assert_eq!(sub.dropped(), 1);
        assert_eq!(sub.recv().await, Some(Event::ResourcesChanged { alias: "b".into() }));
        assert_eq!(sub.recv().await, Some(Event::ResourcesChanged { alias: "c".into() }));
    }

    #[tokio::test]
    async fn dropped_subscription_detaches() {
        let bus = EventBus::new();
        let sub = bus.subscribe(2);
        drop(sub);
        bus.publish(Event::AcquiredLeadership);
        assert_eq!(bus.subscriber_count(), 0);
    }
}
