//! Non-blocking event fan-out.
//!
//! Subscribers get a bounded channel each. `publish` never waits: when a
//! subscriber's channel is full the event is dropped for that subscriber
//! (and counted), so a slow or stalled consumer can never hold up failover.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::RwLock;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::domain::{ConnectionEvent, SubscriptionId};
use crate::error::{Error, Result};

/// Predicate deciding whether a subscriber wants an event.
pub type EventFilter = Box<dyn Fn(&ConnectionEvent) -> bool + Send + Sync>;

struct Subscriber {
    name: String,
    filter: Option<EventFilter>,
    tx: mpsc::Sender<ConnectionEvent>,
}

/// A subscriber's end of the bus.
///
/// Dropping the subscription without unsubscribing is fine; the bus notices
/// the closed channel on the next publish and cleans up.
pub struct Subscription {
    id: SubscriptionId,
    name: String,
    rx: mpsc::Receiver<ConnectionEvent>,
}

impl Subscription {
    pub fn id(&self) -> &SubscriptionId {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait for the next event. Returns `None` once the bus side is gone.
    pub async fn recv(&mut self) -> Option<ConnectionEvent> {
        self.rx.recv().await
    }

    /// Non-blocking poll for a buffered event.
    pub fn try_recv(&mut self) -> Option<ConnectionEvent> {
        self.rx.try_recv().ok()
    }
}

/// Filtered publish/subscribe distribution of connection events.
pub struct EventBus {
    subscribers: RwLock<HashMap<SubscriptionId, Subscriber>>,
    buffer: usize,
    closed: AtomicBool,
    dropped: AtomicU64,
}

impl EventBus {
    /// `buffer` is the per-subscriber channel capacity.
    pub fn new(buffer: usize) -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            buffer: buffer.max(1),
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        }
    }

    /// Register a subscriber. `filter`, when given, is evaluated before
    /// delivery; events it rejects are never queued.
    pub fn subscribe(
        &self,
        name: impl Into<String>,
        filter: Option<EventFilter>,
    ) -> Result<Subscription> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }

        let name = name.into();
        let id = SubscriptionId::random();
        let (tx, rx) = mpsc::channel(self.buffer);
        self.subscribers.write().insert(
            id.clone(),
            Subscriber {
                name: name.clone(),
                filter,
                tx,
            },
        );
        debug!(subscriber = %name, subscription_id = %id, "Subscribed");

        Ok(Subscription { id, name, rx })
    }

    /// Remove a subscriber and close its channel.
    ///
    /// Returns `false` when the id was not subscribed. Safe to call
    /// concurrently with `publish`.
    pub fn unsubscribe(&self, id: &SubscriptionId) -> bool {
        self.subscribers.write().remove(id).is_some()
    }

    /// Deliver an event to every matching subscriber without blocking.
    ///
    /// Full channels drop the event for that subscriber only; closed
    /// channels get their subscriber entry reaped.
    pub fn publish(&self, event: ConnectionEvent) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }

        let mut stale: Vec<SubscriptionId> = Vec::new();
        {
            let subscribers = self.subscribers.read();
            for (id, sub) in subscribers.iter() {
                if let Some(filter) = &sub.filter {
                    if !filter(&event) {
                        continue;
                    }
                }
                match sub.tx.try_send(event.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            subscriber = %sub.name,
                            kind = %event.kind,
                            "Subscriber channel full, dropping event"
                        );
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        stale.push(id.clone());
                    }
                }
            }
        }

        if !stale.is_empty() {
            let mut subscribers = self.subscribers.write();
            for id in stale {
                if subscribers.remove(&id).is_some() {
                    debug!(subscription_id = %id, "Reaped gone subscriber");
                }
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Total events dropped on full subscriber channels.
    pub fn events_dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Close every subscription and refuse new ones.
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        self.subscribers.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ConnectionId, EventKind};

    fn event(kind: EventKind) -> ConnectionEvent {
        ConnectionEvent::for_connection(kind, ConnectionId::new("c-1"), "test")
    }

    #[tokio::test]
    async fn delivers_to_all_subscribers() {
        let bus = EventBus::new(8);
        let mut a = bus.subscribe("a", None).unwrap();
        let mut b = bus.subscribe("b", None).unwrap();

        bus.publish(event(EventKind::Connected));

        assert_eq!(a.recv().await.unwrap().kind, EventKind::Connected);
        assert_eq!(b.recv().await.unwrap().kind, EventKind::Connected);
    }

    #[tokio::test]
    async fn filter_gates_delivery() {
        let bus = EventBus::new(8);
        let mut failovers = bus
            .subscribe(
                "failovers",
                Some(Box::new(|e| e.kind == EventKind::Failover)),
            )
            .unwrap();

        bus.publish(event(EventKind::Connected));
        bus.publish(event(EventKind::Failover));
        bus.publish(event(EventKind::Disconnected));

        assert_eq!(failovers.recv().await.unwrap().kind, EventKind::Failover);
        assert!(failovers.try_recv().is_none());
    }

    #[tokio::test]
    async fn full_channel_drops_without_blocking() {
        let bus = EventBus::new(1);
        let mut slow = bus.subscribe("slow", None).unwrap();
        let mut fast = bus.subscribe("fast", None).unwrap();

        // Drain the fast subscriber between publishes; never drain slow.
        bus.publish(event(EventKind::Connected));
        assert!(fast.try_recv().is_some());
        bus.publish(event(EventKind::StateChange));
        assert!(fast.try_recv().is_some());
        bus.publish(event(EventKind::Disconnected));
        assert!(fast.try_recv().is_some());

        // Slow subscriber kept only the first event; the rest were dropped.
        assert_eq!(slow.try_recv().unwrap().kind, EventKind::Connected);
        assert!(slow.try_recv().is_none());
        assert_eq!(bus.events_dropped(), 2);
    }

    #[tokio::test]
    async fn publish_order_is_preserved_per_subscriber() {
        let bus = EventBus::new(16);
        let mut sub = bus.subscribe("ordered", None).unwrap();

        let kinds = [
            EventKind::Connected,
            EventKind::StateChange,
            EventKind::PrimaryChange,
            EventKind::Disconnected,
        ];
        for kind in kinds {
            bus.publish(event(kind));
        }
        for kind in kinds {
            assert_eq!(sub.recv().await.unwrap().kind, kind);
        }
    }

    #[tokio::test]
    async fn unsubscribe_closes_channel() {
        let bus = EventBus::new(8);
        let mut sub = bus.subscribe("leaving", None).unwrap();
        let id = sub.id().clone();

        assert!(bus.unsubscribe(&id));
        assert!(!bus.unsubscribe(&id));
        assert!(sub.recv().await.is_none());
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn dropped_subscription_is_reaped_on_publish() {
        let bus = EventBus::new(8);
        let sub = bus.subscribe("gone", None).unwrap();
        drop(sub);

        bus.publish(event(EventKind::Connected));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn shutdown_closes_everything() {
        let bus = EventBus::new(8);
        let mut sub = bus.subscribe("s", None).unwrap();

        bus.shutdown();

        assert!(sub.recv().await.is_none());
        assert!(matches!(bus.subscribe("late", None), Err(Error::Closed)));
        // Publishing after shutdown is a silent no-op.
        bus.publish(event(EventKind::Connected));
    }
}
