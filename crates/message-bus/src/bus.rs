use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::Result;

/// Topic that receives messages no handler could make sense of.
pub const DEAD_LETTER_TOPIC: &str = "saga.dead_letter";

/// A message handed to a consumer.
///
/// The consumer must settle every delivery with [`Consumer::ack`] or
/// [`Consumer::nack`] before the next message of the same partition is
/// delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub topic: String,
    pub partition: u32,
    pub offset: u64,
    pub key: String,
    pub payload: Vec<u8>,
    /// 1 on first delivery, incremented on every redelivery.
    pub attempt: u32,
}

/// Payload published to [`DEAD_LETTER_TOPIC`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub topic: String,
    pub key: String,
    pub payload: Vec<u8>,
    pub error: String,
}

impl DeadLetter {
    pub fn from_delivery(delivery: &Delivery, error: impl Into<String>) -> Self {
        Self {
            topic: delivery.topic.clone(),
            key: delivery.key.clone(),
            payload: delivery.payload.clone(),
            error: error.into(),
        }
    }
}

/// Which partitions of a topic a consumer reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Assignment {
    /// Every partition of the topic.
    All,
    /// An explicit set of partitions.
    Partitions(Vec<u32>),
}

impl Assignment {
    /// Round-robin share of `partitions` for worker `index` out of `workers`.
    pub fn round_robin(index: usize, workers: usize, partitions: u32) -> Self {
        let workers = workers.max(1) as u32;
        let index = index as u32 % workers;
        Assignment::Partitions((0..partitions).filter(|p| p % workers == index).collect())
    }

    pub fn resolve(&self, partitions: u32) -> Vec<u32> {
        match self {
            Assignment::All => (0..partitions).collect(),
            Assignment::Partitions(ps) => ps.iter().copied().filter(|p| *p < partitions).collect(),
        }
    }
}

/// Publishing half of the bus.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Appends `payload` to `topic`, routed by `key`.
    ///
    /// Messages published with the same key are delivered in publish order.
    async fn publish(&self, topic: &str, key: &str, payload: Vec<u8>) -> Result<()>;
}

/// A subscription to one topic on behalf of a consumer group.
#[async_trait]
pub trait Consumer: Send {
    /// Waits for the next message. Returns `Ok(None)` once the bus is closed.
    async fn next(&mut self) -> Result<Option<Delivery>>;

    /// Marks a delivery as consumed; its offset is committed for the group.
    async fn ack(&mut self, delivery: &Delivery) -> Result<()>;

    /// Gives a delivery back; it will be delivered again, before anything
    /// that follows it on the same partition.
    async fn nack(&mut self, delivery: &Delivery) -> Result<()>;
}

/// Trait for bus implementations.
#[async_trait]
pub trait MessageBus: Publisher {
    /// Number of partitions every topic is split into.
    fn partitions(&self) -> u32;

    /// A publish handle owned by the caller.
    fn publisher(&self) -> Box<dyn Publisher>;

    /// Opens a consumer on `topic` for `group`, reading the assigned
    /// partitions from the group's committed offsets.
    async fn subscribe(
        &self,
        topic: &str,
        group: &str,
        assignment: Assignment,
    ) -> Result<Box<dyn Consumer>>;
}
