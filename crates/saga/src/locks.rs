use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use common::OrderId;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type Slots = Arc<Mutex<HashMap<OrderId, Arc<AsyncMutex<()>>>>>;

/// Keyed async lock: at most one holder per order id.
///
/// The orchestrator reads several topics, so two events for the same order
/// can be handled by different workers at once; holding this lock around
/// load-decide-apply serializes them. Entries are removed once nobody holds
/// or waits for them.
#[derive(Clone, Default)]
pub struct OrderLocks {
    slots: Slots,
}

/// Releases its order's lock on drop.
pub struct OrderGuard {
    order_id: OrderId,
    slots: Slots,
    guard: Option<OwnedMutexGuard<()>>,
}

impl OrderLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, order_id: OrderId) -> OrderGuard {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(slots.entry(order_id).or_default())
        };
        let guard = slot.lock_owned().await;
        OrderGuard {
            order_id,
            slots: Arc::clone(&self.slots),
            guard: Some(guard),
        }
    }

    /// Number of orders currently locked or waited on.
    pub fn len(&self) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for OrderGuard {
    fn drop(&mut self) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        self.guard.take();
        // Only the map still refers to the slot: no holder, no waiter.
        if let Some(slot) = slots.get(&self.order_id)
            && Arc::strong_count(slot) == 1
        {
            slots.remove(&self.order_id);
        }
    }
}
