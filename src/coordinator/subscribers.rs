//! Subscriber registry
//!
//! Change callbacks registered by presentation-layer consumers. Delivery
//! order follows registration order.

use crate::domain::value::ChangeEvent;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub type ChangeCallback = dyn Fn(&ChangeEvent) + Send + Sync;

/// Returned by `subscribe`; pass it back to `unsubscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(u64);

#[derive(Default)]
pub(crate) struct SubscriberRegistry {
    next_id: AtomicU64,
    subscribers: RwLock<Vec<(SubscriptionHandle, Arc<ChangeCallback>)>>,
}

impl SubscriberRegistry {
    pub(crate) fn insert(&self, callback: Arc<ChangeCallback>) -> SubscriptionHandle {
        let handle = SubscriptionHandle(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers.write().push((handle, callback));
        handle
    }

    pub(crate) fn remove(&self, handle: SubscriptionHandle) -> bool {
        let mut subscribers = self.subscribers.write();
        let before = subscribers.len();
        subscribers.retain(|(h, _)| *h != handle);
        subscribers.len() != before
    }

    pub(crate) fn clear(&self) {
        self.subscribers.write().clear();
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Deliver `event` to every current subscriber. The list is copied first
    /// so callbacks may subscribe or unsubscribe without deadlocking.
    pub(crate) fn publish(&self, event: &ChangeEvent) -> usize {
        let callbacks: Vec<Arc<ChangeCallback>> = self
            .subscribers
            .read()
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();
        for callback in &callbacks {
            callback(event);
        }
        callbacks.len()
    }
}
