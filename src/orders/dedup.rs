//! Session-scoped record of which orders have already been surfaced to the
//! operator. Push and poll both go through [`NotificationDeduplicator::mark_seen`];
//! whichever source observes an order first wins and the other no-ops.
//!
//! Entries are never evicted. A shift sees a bounded number of orders, so the
//! set stays small; reusing this for an unbounded id space would need a cap.

use crate::orders::types::Order;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct NotificationDeduplicator {
    shown: Arc<Mutex<HashSet<String>>>,
}

impl NotificationDeduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `order_id` and returns `true` the first time it is seen.
    pub fn mark_seen(&self, order_id: &str) -> bool {
        self.shown.lock().insert(order_id.to_string())
    }

    /// Like [`Self::mark_seen`] but treats every key of the order as the same
    /// order: if any of them was recorded, nothing is recorded and `false` is
    /// returned. Otherwise all keys are recorded together.
    pub fn mark_order_seen(&self, order: &Order) -> bool {
        let mut shown = self.shown.lock();
        if order.keys().any(|key| shown.contains(key)) {
            return false;
        }
        for key in order.keys() {
            shown.insert(key.to_string());
        }
        true
    }

    pub fn contains(&self, order_id: &str) -> bool {
        self.shown.lock().contains(order_id)
    }

    pub fn has_seen_order(&self, order: &Order) -> bool {
        let shown = self.shown.lock();
        order.keys().any(|key| shown.contains(key))
    }

    pub fn len(&self) -> usize {
        self.shown.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.shown.lock().is_empty()
    }
}
