//! Saga error types.

use common::OrderId;
use domain::{DomainError, OrderStatus};
use message_bus::BusError;
use resource_store::StoreError;
use thiserror::Error;

/// What the worker does with a message whose handler failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Leave it unacknowledged so it is delivered again.
    Retry,
    /// Park it on the dead-letter topic and move on.
    DeadLetter,
}

/// Errors that can occur while handling saga messages.
#[derive(Debug, Error)]
pub enum SagaError {
    /// A payload did not decode as the message its topic carries.
    #[error("Malformed message on '{topic}': {reason}")]
    Decode { topic: String, reason: String },

    /// A handler received a message from a topic it does not serve.
    #[error("Unexpected topic: {0}")]
    UnexpectedTopic(String),

    /// The ledger has no such order.
    #[error("Order not found: {0}")]
    UnknownOrder(OrderId),

    /// The ledger refused a status change the orchestrator decided on.
    #[error("Ledger rejected {requested} for order {order_id}: order is {current}")]
    LedgerRejected {
        order_id: OrderId,
        requested: OrderStatus,
        current: OrderStatus,
    },

    /// Another writer saved the saga context first.
    #[error("Saga context for order {0} changed concurrently")]
    ContextConflict(OrderId),

    /// Domain error.
    #[error("Domain error: {0}")]
    Domain(#[from] DomainError),

    /// Store error.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Bus error.
    #[error("Bus error: {0}")]
    Bus(#[from] BusError),
}

impl SagaError {
    /// Decides between redelivery and the dead-letter topic.
    pub fn disposition(&self) -> Disposition {
        match self {
            SagaError::Store(StoreError::OrderNotFound(_)) => Disposition::DeadLetter,
            SagaError::Store(e) if e.is_transient() => Disposition::Retry,
            SagaError::Store(_) => Disposition::DeadLetter,
            SagaError::Bus(BusError::Codec(_)) => Disposition::DeadLetter,
            SagaError::Bus(_) | SagaError::ContextConflict(_) => Disposition::Retry,
            SagaError::Decode { .. }
            | SagaError::UnexpectedTopic(_)
            | SagaError::UnknownOrder(_)
            | SagaError::LedgerRejected { .. }
            | SagaError::Domain(_) => Disposition::DeadLetter,
        }
    }

    pub(crate) fn decode(topic: &str, err: BusError) -> Self {
        SagaError::Decode {
            topic: topic.to_string(),
            reason: err.to_string(),
        }
    }
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;
