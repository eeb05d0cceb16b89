//! A small observer registry: subscribers get a bounded channel and are
//! addressed by a subscription id.

use log::debug;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::Mutex;

/// Identifies one subscription on one hub.
pub type SubscriptionId = u64;

/// The receiving half handed to a subscriber.
#[derive(Debug)]
pub struct Subscription<T> {
    /// Pass to [`EventHub::unsubscribe`] to detach
    pub id: SubscriptionId,
    /// Published events arrive here
    pub rx: Receiver<T>,
}

/// Fans events out to every live subscriber.
///
/// Publishing never blocks. A subscriber whose channel is full misses the
/// new event while keeping the older ones it has not read yet, and one
/// whose receiver was dropped is removed. Subscribers that care about the
/// latest reading must drain their channel faster than events arrive.
#[derive(Debug)]
pub struct EventHub<T> {
    next_id: AtomicU64,
    subscribers: Mutex<HashMap<SubscriptionId, SyncSender<T>>>,
}

impl<T> Default for EventHub<T> {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            subscribers: Mutex::new(HashMap::new()),
        }
    }
}

impl<T: Clone> EventHub<T> {
    /// A hub with no subscribers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber whose channel holds up to `capacity` events.
    /// Once full, further events are dropped until the subscriber reads.
    pub fn subscribe(&self, capacity: usize) -> Subscription<T> {
        let (tx, rx) = mpsc::sync_channel(capacity);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, tx);
        Subscription { id, rx }
    }

    /// Detach a subscriber. Unknown ids are ignored.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
    }

    /// Number of attached subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Offer `event` to every subscriber. Full channels skip it.
    pub fn publish(&self, event: &T) {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subscribers.retain(|id, tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => true,
            Err(TrySendError::Disconnected(_)) => {
                debug!("Dropping disconnected subscriber {}", id);
                false
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_subscriber_sees_events() {
        let hub = EventHub::new();
        let a = hub.subscribe(4);
        let b = hub.subscribe(4);
        hub.publish(&7);
        assert_eq!(a.rx.try_recv(), Ok(7));
        assert_eq!(b.rx.try_recv(), Ok(7));
    }

    #[test]
    fn full_channels_drop_instead_of_blocking() {
        let hub = EventHub::new();
        let sub = hub.subscribe(1);
        hub.publish(&1);
        hub.publish(&2);
        assert_eq!(sub.rx.try_recv(), Ok(1));
        assert!(sub.rx.try_recv().is_err());
        assert_eq!(hub.subscriber_count(), 1);

        // draining makes room again
        hub.publish(&3);
        assert_eq!(sub.rx.try_recv(), Ok(3));
    }

    #[test]
    fn unsubscribe_and_dropped_receivers_detach() {
        let hub = EventHub::new();
        let kept = hub.subscribe(1);
        let dropped = hub.subscribe(1);
        drop(dropped);
        hub.publish(&0);
        assert_eq!(hub.subscriber_count(), 1);

        hub.unsubscribe(kept.id);
        assert_eq!(hub.subscriber_count(), 0);
        hub.unsubscribe(999);
    }
}
