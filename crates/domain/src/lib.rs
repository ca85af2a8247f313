//! Data model of the order saga.
//!
//! This crate holds the plain values every service agrees on:
//! - `Order` and its `OrderStatus` state machine (owned by the ledger)
//! - `StockItem` and the `ItemSnapshot` that travels with a saga
//! - `Balance` and `Profile` on the buyer side
//! - `SagaContext`, the orchestrator's per-order memory

pub mod account;
pub mod catalog;
pub mod error;
pub mod order;
pub mod saga;

pub use account::{Balance, Profile};
pub use catalog::{ItemKind, ItemSnapshot, StockItem};
pub use error::DomainError;
pub use order::{Money, Order, OrderRef, OrderStatus};
pub use saga::SagaContext;
