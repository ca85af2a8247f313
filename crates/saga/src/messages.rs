//! Payloads carried on the bus.
//!
//! Commands flow from the orchestrator to the services; step outcomes flow
//! back. Every payload carries the [`OrderRef`], and everything sent for a
//! step carries the correlation id of that step so late or duplicated
//! replies can be recognised.

use common::CorrelationId;
use domain::{ItemSnapshot, Money, OrderRef};
use message_bus::{Delivery, decode, encode};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SagaError};
use crate::topics;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReserveStock {
    pub order: OrderRef,
    pub correlation_id: CorrelationId,
}

/// Stock service reply. `item` is `None` only for an unknown SKU.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockChecked {
    pub order: OrderRef,
    pub correlation_id: CorrelationId,
    pub available: bool,
    pub item: Option<ItemSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebitBalance {
    pub order: OrderRef,
    pub correlation_id: CorrelationId,
    pub item: ItemSnapshot,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceChecked {
    pub order: OrderRef,
    pub correlation_id: CorrelationId,
    pub item: ItemSnapshot,
    pub sufficient: bool,
}

/// Compensation for a reservation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseStock {
    pub order: OrderRef,
    pub correlation_id: CorrelationId,
}

/// Compensation for a debit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditBalance {
    pub order: OrderRef,
    pub correlation_id: CorrelationId,
    pub amount: Money,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderCommitted {
    pub order: OrderRef,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderCancelled {
    pub order: OrderRef,
    pub reason: String,
}

/// A message the orchestrator publishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    ReserveStock(ReserveStock),
    DebitBalance(DebitBalance),
    ReleaseStock(ReleaseStock),
    CreditBalance(CreditBalance),
    Commit(OrderCommitted),
    Cancel(OrderCancelled),
}

impl Command {
    pub fn topic(&self) -> &'static str {
        match self {
            Command::ReserveStock(_) => topics::STOCK_RESERVE,
            Command::DebitBalance(_) => topics::BALANCE_DEBIT,
            Command::ReleaseStock(_) => topics::STOCK_RELEASE,
            Command::CreditBalance(_) => topics::BALANCE_CREDIT,
            Command::Commit(_) => topics::ORDER_COMMITTED,
            Command::Cancel(_) => topics::ORDER_CANCELLED,
        }
    }

    pub fn order(&self) -> &OrderRef {
        match self {
            Command::ReserveStock(m) => &m.order,
            Command::DebitBalance(m) => &m.order,
            Command::ReleaseStock(m) => &m.order,
            Command::CreditBalance(m) => &m.order,
            Command::Commit(m) => &m.order,
            Command::Cancel(m) => &m.order,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let bytes = match self {
            Command::ReserveStock(m) => encode(m),
            Command::DebitBalance(m) => encode(m),
            Command::ReleaseStock(m) => encode(m),
            Command::CreditBalance(m) => encode(m),
            Command::Commit(m) => encode(m),
            Command::Cancel(m) => encode(m),
        };
        Ok(bytes?)
    }
}

/// An event the orchestrator reacts to, decoded from its topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SagaEvent {
    OrderSubmitted(OrderRef),
    StockReserved(StockChecked),
    BalanceChecked(BalanceChecked),
}

impl SagaEvent {
    /// Decodes a delivery according to its topic.
    pub fn from_delivery(delivery: &Delivery) -> Result<Self> {
        let topic = delivery.topic.as_str();
        let payload = delivery.payload.as_slice();
        let event = match topic {
            topics::ORDER_CREATED => decode(payload).map(SagaEvent::OrderSubmitted),
            topics::STOCK_CHECKED => decode(payload).map(SagaEvent::StockReserved),
            topics::BALANCE_CHECKED => decode(payload).map(SagaEvent::BalanceChecked),
            other => return Err(SagaError::UnexpectedTopic(other.to_string())),
        };
        event.map_err(|e| SagaError::decode(topic, e))
    }

    pub fn order(&self) -> &OrderRef {
        match self {
            SagaEvent::OrderSubmitted(order) => order,
            SagaEvent::StockReserved(m) => &m.order,
            SagaEvent::BalanceChecked(m) => &m.order,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SagaEvent::OrderSubmitted(_) => "order_submitted",
            SagaEvent::StockReserved(_) => "stock_reserved",
            SagaEvent::BalanceChecked(_) => "balance_checked",
        }
    }
}

/// Decodes a payload, naming the topic on failure.
pub(crate) fn decode_from<T: serde::de::DeserializeOwned>(delivery: &Delivery) -> Result<T> {
    decode(&delivery.payload).map_err(|e| SagaError::decode(&delivery.topic, e))
}
