use thiserror::Error;

/// Errors that can occur when talking to the message bus.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BusError {
    /// Failed to publish a message to a topic.
    #[error("Publish failed for topic '{topic}': {reason}")]
    PublishFailed { topic: String, reason: String },

    /// Failed to subscribe to a topic.
    #[error("Subscription failed for topic '{topic}': {reason}")]
    SubscriptionFailed { topic: String, reason: String },

    /// Acknowledging a delivery that this consumer does not hold in flight.
    #[error("Delivery {topic}/{partition}@{offset} is not in flight")]
    NotInFlight {
        topic: String,
        partition: u32,
        offset: u64,
    },

    /// A payload could not be encoded or decoded.
    #[error("Codec error: {0}")]
    Codec(String),

    /// The bus has been shut down.
    #[error("Bus closed")]
    Closed,
}

impl From<bincode::Error> for BusError {
    fn from(err: bincode::Error) -> Self {
        BusError::Codec(err.to_string())
    }
}

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;
