//! Typed in-process event bus.
//!
//! Every raw telephony or management event enters the system exactly
//! once and is fanned out to any number of subscribers (IVR engine,
//! status reconciler, recorder). Subscribers receive clones through a
//! `tokio::sync::broadcast` channel, so a slow subscriber can lag and
//! drop events but can never block the publisher.
//!
//! The bus also keeps a bounded **audit ring**: the most recent N
//! published events with their publish timestamps, available for
//! debugging regardless of who was subscribed at the time. This is the
//! subscribe-side replacement for intercepting an emitter after
//! construction: the tap is part of the bus itself.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, trace};

/// One entry in the audit ring: an event plus when it was published.
#[derive(Debug, Clone)]
pub struct AuditRecord<E> {
    pub published_at: DateTime<Utc>,
    pub event: E,
}

/// In-process publish/subscribe bus for a single event type.
///
/// Cloning the bus is cheap; all clones share the same channel and
/// audit ring.
#[derive(Clone)]
pub struct EventBus<E> {
    tx: broadcast::Sender<E>,
    audit: Arc<Mutex<VecDeque<AuditRecord<E>>>>,
    audit_capacity: usize,
}

impl<E: Clone + Send + std::fmt::Debug + 'static> EventBus<E> {
    /// Create a bus with the given broadcast capacity and audit ring size.
    pub fn new(channel_capacity: usize, audit_capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(channel_capacity.max(1));
        Self {
            tx,
            audit: Arc::new(Mutex::new(VecDeque::with_capacity(audit_capacity))),
            audit_capacity,
        }
    }

    /// Create a bus with defaults suited to a single-process deployment.
    pub fn new_default() -> Self {
        Self::new(1024, 256)
    }

    /// Publish an event to all current subscribers.
    ///
    /// The event is recorded in the audit ring whether or not anyone is
    /// subscribed. Returns the number of subscribers that received it.
    pub fn publish(&self, event: E) -> usize {
        {
            let mut ring = self.audit.lock();
            if ring.len() == self.audit_capacity && self.audit_capacity > 0 {
                ring.pop_front();
            }
            if self.audit_capacity > 0 {
                ring.push_back(AuditRecord {
                    published_at: Utc::now(),
                    event: event.clone(),
                });
            }
        }

        match self.tx.send(event) {
            Ok(n) => {
                trace!("Event delivered to {} subscribers", n);
                n
            }
            Err(_) => {
                // No live subscribers; the audit ring still has it.
                debug!("Event published with no subscribers");
                0
            }
        }
    }

    /// Subscribe to all events published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        self.tx.subscribe()
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Most recent audit records, newest first, at most `limit`.
    pub fn audit_tail(&self, limit: usize) -> Vec<AuditRecord<E>> {
        let ring = self.audit.lock();
        ring.iter().rev().take(limit).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_all_subscribers() {
        let bus: EventBus<String> = EventBus::new(16, 8);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        assert_eq!(bus.publish("hello".to_string()), 2);
        assert_eq!(a.recv().await.unwrap(), "hello");
        assert_eq!(b.recv().await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn audit_ring_is_bounded_and_newest_first() {
        let bus: EventBus<u32> = EventBus::new(16, 3);
        for i in 0..5 {
            bus.publish(i);
        }

        let tail = bus.audit_tail(10);
        let events: Vec<u32> = tail.iter().map(|r| r.event).collect();
        assert_eq!(events, vec![4, 3, 2]);
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_not_an_error() {
        let bus: EventBus<u32> = EventBus::new(16, 8);
        assert_eq!(bus.publish(7), 0);
        assert_eq!(bus.audit_tail(1).len(), 1);
    }
}
