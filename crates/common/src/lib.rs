//! Identifiers shared by every crate of the order saga.

mod types;

pub use types::{CorrelationId, OrderId, Sku, UserId};
