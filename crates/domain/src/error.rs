//! Domain error types.

use thiserror::Error;

use crate::OrderStatus;

/// Errors raised while interpreting domain values.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A stored status string does not name an `OrderStatus`.
    #[error("Unknown order status: {0}")]
    UnknownStatus(String),

    /// A stored item kind string does not name an `ItemKind`.
    #[error("Unknown item kind: {0}")]
    UnknownItemKind(String),

    /// The ledger refused a status change.
    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition { from: OrderStatus, to: OrderStatus },
}
