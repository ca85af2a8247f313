//! Order status state machine.

use serde::{Deserialize, Serialize};

use crate::DomainError;

/// The status of an order as recorded by the ledger.
///
/// State transitions:
/// ```text
/// Created ──► ReservingStock ──► CheckingBalance ──► Committed
///                   │                   │
///                   └───────────────────┴──► Cancelled
/// ```
///
/// `Created` may also move straight to `Cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum OrderStatus {
    /// Order accepted by the ledger, saga not started yet.
    #[default]
    Created,

    /// A stock reservation has been requested.
    ReservingStock,

    /// Stock is reserved and the buyer's balance is being debited.
    CheckingBalance,

    /// Stock reserved and balance debited (terminal state).
    Committed,

    /// Saga stopped; any reservation has been compensated (terminal state).
    Cancelled,
}

impl OrderStatus {
    /// Position along the happy path. Both terminal states share the top rank.
    pub fn rank(&self) -> u8 {
        match self {
            OrderStatus::Created => 0,
            OrderStatus::ReservingStock => 1,
            OrderStatus::CheckingBalance => 2,
            OrderStatus::Committed | OrderStatus::Cancelled => 3,
        }
    }

    /// Returns true if this is a terminal state (no further transitions possible).
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Committed | OrderStatus::Cancelled)
    }

    /// Returns true if the ledger may move an order from `self` to `next`.
    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        matches!(
            (self, next),
            (Created, ReservingStock)
                | (ReservingStock, CheckingBalance)
                | (CheckingBalance, Committed)
                | (Created | ReservingStock | CheckingBalance, Cancelled)
        )
    }

    /// All statuses from which `next` is reachable in one step.
    pub fn predecessors(next: OrderStatus) -> Vec<OrderStatus> {
        Self::ALL
            .into_iter()
            .filter(|s| s.can_transition_to(next))
            .collect()
    }

    pub const ALL: [OrderStatus; 5] = [
        OrderStatus::Created,
        OrderStatus::ReservingStock,
        OrderStatus::CheckingBalance,
        OrderStatus::Committed,
        OrderStatus::Cancelled,
    ];

    /// Returns the state name as stored in the ledger.
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Created => "created",
            OrderStatus::ReservingStock => "reserving_stock",
            OrderStatus::CheckingBalance => "checking_balance",
            OrderStatus::Committed => "committed",
            OrderStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for OrderStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| DomainError::UnknownStatus(s.to_string()))
    }
}
