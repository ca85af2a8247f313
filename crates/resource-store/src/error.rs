use common::OrderId;
use domain::DomainError;
use thiserror::Error;

/// Errors that can occur when interacting with the resource stores.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The order is not in the ledger.
    #[error("Order not found: {0}")]
    OrderNotFound(OrderId),

    /// A saga context with this order id already exists.
    #[error("Saga context already exists for order {0}")]
    AlreadyExists(OrderId),

    /// The store is unreachable. In-memory stores raise this when a
    /// failure has been injected.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// A stored row could not be mapped back to a domain value.
    #[error("Corrupt row: {0}")]
    Corrupt(#[from] DomainError),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// Whether trying again later can succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Unavailable(_) => true,
            StoreError::Database(e) => !matches!(
                e,
                sqlx::Error::RowNotFound
                    | sqlx::Error::ColumnNotFound(_)
                    | sqlx::Error::ColumnDecode { .. }
                    | sqlx::Error::Decode(_)
                    | sqlx::Error::TypeNotFound { .. }
            ),
            StoreError::OrderNotFound(_)
            | StoreError::AlreadyExists(_)
            | StoreError::Corrupt(_)
            | StoreError::Serialization(_) => false,
        }
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
