//! Publish/subscribe plumbing for outward-facing events.
//!
//! An [`EventBus`] is owned by the component that produces events (the sensor
//! manager, the session recorder). Consumers call [`EventBus::subscribe`] and
//! receive a [`Subscription`] holding the receiving end of a channel. Dropping
//! the subscription (or calling [`Subscription::unsubscribe`]) detaches it.

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

type SubscriberMap<E> = Mutex<HashMap<u64, Sender<E>>>;

/// Fan-out channel for events of type `E`.
pub struct EventBus<E: Clone> {
    subscribers: Arc<SubscriberMap<E>>,
    next_id: AtomicU64,
}

impl<E: Clone> EventBus<E> {
    /// Create a bus with no subscribers.
    pub fn new() -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a new subscriber.
    pub fn subscribe(&self) -> Subscription<E> {
        let (tx, rx) = crossbeam::channel::unbounded();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.insert(id, tx);
        }

        Subscription {
            id,
            receiver: rx,
            bus: Arc::downgrade(&self.subscribers),
        }
    }

    /// Deliver an event to every live subscriber.
    ///
    /// Subscribers whose receiving end is gone are pruned.
    pub fn publish(&self, event: E) {
        let Ok(mut subscribers) = self.subscribers.lock() else {
            return;
        };

        subscribers.retain(|_, tx| tx.send(event.clone()).is_ok());
    }

    /// Number of attached subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().map(|s| s.len()).unwrap_or(0)
    }
}

impl<E: Clone> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Clone> std::fmt::Debug for EventBus<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

/// Receiving side of an [`EventBus`] registration. Detaches on drop.
pub struct Subscription<E> {
    id: u64,
    receiver: Receiver<E>,
    bus: Weak<SubscriberMap<E>>,
}

impl<E> Subscription<E> {
    /// Take the next pending event, if any.
    pub fn try_recv(&self) -> Option<E> {
        match self.receiver.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Wait up to `timeout` for the next event.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<E> {
        match self.receiver.recv_timeout(timeout) {
            Ok(event) => Some(event),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Drain every event currently queued.
    pub fn drain(&self) -> Vec<E> {
        self.receiver.try_iter().collect()
    }

    /// Explicitly detach from the bus.
    pub fn unsubscribe(self) {
        // Drop does the work.
    }
}

impl<E> Drop for Subscription<E> {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            if let Ok(mut subscribers) = bus.lock() {
                subscribers.remove(&self.id);
            }
        }
    }
}
