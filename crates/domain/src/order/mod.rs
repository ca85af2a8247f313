//! Orders as recorded by the ledger.

mod state;
mod value_objects;

use chrono::{DateTime, Utc};
use common::{OrderId, Sku, UserId};
use serde::{Deserialize, Serialize};

pub use state::OrderStatus;
pub use value_objects::Money;

/// An order row owned by the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub user_id: UserId,
    pub sku: Sku,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: OrderStatus,
    /// Human-readable explanation of the outcome. The only field that may
    /// still change once the order is terminal.
    pub reason: String,
}

impl Order {
    /// Creates a fresh order in `Created` status.
    pub fn new(user_id: UserId, sku: Sku) -> Self {
        let now = Utc::now();
        Self {
            id: OrderId::new(),
            user_id,
            sku,
            created_at: now,
            updated_at: now,
            status: OrderStatus::Created,
            reason: String::new(),
        }
    }

    /// The reference carried by every bus message about this order.
    pub fn order_ref(&self) -> OrderRef {
        OrderRef {
            order_id: self.id,
            user_id: self.user_id,
            sku: self.sku,
        }
    }
}

/// The minimal order reference carried on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderRef {
    pub order_id: OrderId,
    pub user_id: UserId,
    pub sku: Sku,
}

impl OrderRef {
    pub fn new(order_id: OrderId, user_id: UserId, sku: Sku) -> Self {
        Self {
            order_id,
            user_id,
            sku,
        }
    }
}
