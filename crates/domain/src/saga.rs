//! Orchestrator-side view of one order's saga.

use chrono::{DateTime, Utc};
use common::{CorrelationId, OrderId};
use serde::{Deserialize, Serialize};

use crate::{ItemSnapshot, OrderRef, OrderStatus};

/// Everything the orchestrator remembers about an order between events.
///
/// Loaded before and persisted after every handled event. `version` starts
/// at 1 and grows by one with every save; stores only accept a save whose
/// predecessor version matches what they hold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SagaContext {
    pub order: OrderRef,
    /// Highest status reached.
    pub state: OrderStatus,
    /// Known once the stock service has answered.
    pub item: Option<ItemSnapshot>,
    /// Correlation id of the command currently in flight.
    pub correlation_id: CorrelationId,
    /// When the in-flight step is considered lost. `None` once terminal.
    pub deadline: Option<DateTime<Utc>>,
    /// How many times the in-flight command has been re-issued.
    pub attempts: u32,
    pub version: u64,
    pub reason: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl SagaContext {
    /// Context for a freshly submitted order, already waiting on stock.
    pub fn start(order: OrderRef, now: DateTime<Utc>, deadline: DateTime<Utc>) -> Self {
        Self {
            order,
            state: OrderStatus::ReservingStock,
            item: None,
            correlation_id: CorrelationId::new(),
            deadline: Some(deadline),
            attempts: 0,
            version: 1,
            reason: None,
            updated_at: now,
        }
    }

    pub fn order_id(&self) -> OrderId {
        self.order.order_id
    }

    /// Next context after a step completes: a new correlation id and no
    /// re-issues yet.
    pub fn advance(
        &self,
        state: OrderStatus,
        now: DateTime<Utc>,
        deadline: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            state,
            correlation_id: CorrelationId::new(),
            deadline: if state.is_terminal() { None } else { deadline },
            attempts: 0,
            version: self.version + 1,
            updated_at: now,
            ..self.clone()
        }
    }

    /// Same step, command sent again with the same correlation id.
    pub fn reissued(&self, now: DateTime<Utc>, deadline: DateTime<Utc>) -> Self {
        Self {
            deadline: Some(deadline),
            attempts: self.attempts + 1,
            version: self.version + 1,
            updated_at: now,
            ..self.clone()
        }
    }

    pub fn with_item(mut self, item: Option<ItemSnapshot>) -> Self {
        if item.is_some() {
            self.item = item;
        }
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        !self.state.is_terminal() && self.deadline.is_some_and(|d| d <= now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use common::{Sku, UserId};

    fn order_ref() -> OrderRef {
        OrderRef::new(OrderId::new(), UserId::new(1), Sku::new(1))
    }

    #[test]
    fn test_start_waits_on_stock() {
        let now = Utc::now();
        let ctx = SagaContext::start(order_ref(), now, now + Duration::seconds(30));
        assert_eq!(ctx.state, OrderStatus::ReservingStock);
        assert_eq!(ctx.version, 1);
        assert!(ctx.item.is_none());
        assert!(!ctx.is_expired(now));
        assert!(ctx.is_expired(now + Duration::seconds(30)));
    }

    #[test]
    fn test_advance_mints_new_correlation() {
        let now = Utc::now();
        let ctx = SagaContext::start(order_ref(), now, now);
        let next = ctx.advance(OrderStatus::CheckingBalance, now, Some(now));
        assert_ne!(next.correlation_id, ctx.correlation_id);
        assert_eq!(next.version, 2);
        assert_eq!(next.order, ctx.order);
    }

    #[test]
    fn test_terminal_context_never_expires() {
        let now = Utc::now();
        let ctx = SagaContext::start(order_ref(), now, now);
        let done = ctx.advance(OrderStatus::Cancelled, now, Some(now));
        assert!(done.deadline.is_none());
        assert!(!done.is_expired(now + Duration::days(1)));
    }

    #[test]
    fn test_reissue_keeps_correlation() {
        let now = Utc::now();
        let ctx = SagaContext::start(order_ref(), now, now);
        let again = ctx.reissued(now, now + Duration::seconds(5));
        assert_eq!(again.correlation_id, ctx.correlation_id);
        assert_eq!(again.attempts, 1);
        assert_eq!(again.version, 2);
    }
}
