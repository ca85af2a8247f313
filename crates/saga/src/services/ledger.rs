//! Ledger service: order submission and the terminal notifications.

use std::sync::Arc;

use async_trait::async_trait;
use common::{OrderId, Sku, UserId};
use domain::{Order, OrderStatus};
use message_bus::{Delivery, Publisher, encode};
use resource_store::{Advance, OrderStore, StoreError};

use crate::decision::REASON_PAID;
use crate::error::{Result, SagaError};
use crate::messages::{OrderCancelled, OrderCommitted, decode_from};
use crate::topics;
use crate::worker::MessageHandler;

/// Records a new order in the ledger and publishes `order.created`.
///
/// The order id is allocated by the ledger before anything is published,
/// so a failed publish leaves a `Created` order that no saga has seen yet;
/// callers may retry with [`resubmit`].
#[tracing::instrument(skip(orders, publisher))]
pub async fn submit_order(
    orders: &dyn OrderStore,
    publisher: &dyn Publisher,
    user_id: UserId,
    sku: Sku,
) -> Result<Order> {
    let order = orders.create(user_id, sku).await?;
    publish_created(&order, publisher).await?;
    tracing::info!(order_id = %order.id, "order submitted");
    metrics::counter!("orders_submitted_total").increment(1);
    Ok(order)
}

/// Publishes `order.created` again for an order still in `Created`.
pub async fn resubmit(
    orders: &dyn OrderStore,
    publisher: &dyn Publisher,
    order_id: OrderId,
) -> Result<Order> {
    let order = orders
        .get(order_id)
        .await?
        .ok_or(SagaError::UnknownOrder(order_id))?;
    if order.status == OrderStatus::Created {
        publish_created(&order, publisher).await?;
    }
    Ok(order)
}

async fn publish_created(order: &Order, publisher: &dyn Publisher) -> Result<()> {
    publisher
        .publish(
            topics::ORDER_CREATED,
            &order.id.key(),
            encode(&order.order_ref())?,
        )
        .await?;
    Ok(())
}

/// Consumes `order.committed` and `order.cancelled`.
///
/// The orchestrator publishes these before it writes the ledger, so the
/// notification may find the order one step behind; it is then moved to the
/// terminal status here and the orchestrator's own write becomes a no-op.
pub struct LedgerService {
    orders: Arc<dyn OrderStore>,
}

impl LedgerService {
    pub fn new(orders: Arc<dyn OrderStore>) -> Self {
        Self { orders }
    }

    pub async fn on_committed(&self, msg: &OrderCommitted) -> Result<()> {
        self.finalize(msg.order.order_id, OrderStatus::Committed, REASON_PAID)
            .await
    }

    pub async fn on_cancelled(&self, msg: &OrderCancelled) -> Result<()> {
        self.finalize(msg.order.order_id, OrderStatus::Cancelled, &msg.reason)
            .await
    }

    #[tracing::instrument(skip(self))]
    async fn finalize(&self, order_id: OrderId, status: OrderStatus, reason: &str) -> Result<()> {
        match self
            .orders
            .advance_status(order_id, status, Some(reason))
            .await
        {
            Ok(Advance::Applied) => tracing::debug!("ledger caught up from notification"),
            Ok(Advance::AlreadyAt) => {}
            Ok(Advance::Rejected { current }) => {
                return Err(SagaError::LedgerRejected {
                    order_id,
                    requested: status,
                    current,
                });
            }
            Err(StoreError::OrderNotFound(id)) => return Err(SagaError::UnknownOrder(id)),
            Err(e) => return Err(e.into()),
        }

        tracing::info!("order finalized");
        metrics::counter!("ledger_orders_finalized_total", "status" => status.as_str())
            .increment(1);
        Ok(())
    }
}

#[async_trait]
impl MessageHandler for LedgerService {
    async fn handle(&self, delivery: &Delivery, _publisher: &dyn Publisher) -> Result<()> {
        match delivery.topic.as_str() {
            topics::ORDER_COMMITTED => self.on_committed(&decode_from(delivery)?).await,
            topics::ORDER_CANCELLED => self.on_cancelled(&decode_from(delivery)?).await,
            other => Err(SagaError::UnexpectedTopic(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::OrderRef;
    use message_bus::{InMemoryBus, decode};
    use resource_store::InMemoryOrderStore;

    #[tokio::test]
    async fn test_submit_publishes_order_ref_keyed_by_order() {
        let orders = InMemoryOrderStore::new();
        let bus = InMemoryBus::new(4);

        let order = submit_order(&orders, &bus, UserId::new(1), Sku::new(2))
            .await
            .unwrap();

        assert_eq!(order.status, OrderStatus::Created);
        let records = bus
            .records_for_key(topics::ORDER_CREATED, &order.id.key())
            .await;
        assert_eq!(records.len(), 1);
        let published: OrderRef = decode(&records[0].payload).unwrap();
        assert_eq!(published, order.order_ref());
    }

    #[tokio::test]
    async fn test_failed_publish_keeps_created_order_for_resubmit() {
        let orders = InMemoryOrderStore::new();
        let bus = InMemoryBus::new(4);
        bus.set_fail_on_publish(true);

        let err = submit_order(&orders, &bus, UserId::new(1), Sku::new(2))
            .await
            .unwrap_err();
        assert!(matches!(err, SagaError::Bus(_)));

        let stored = orders.list_all().await.unwrap();
        assert_eq!(stored.len(), 1);
        bus.set_fail_on_publish(false);
        resubmit(&orders, &bus, stored[0].id).await.unwrap();
        assert_eq!(bus.records(topics::ORDER_CREATED).await.len(), 1);
    }

    #[tokio::test]
    async fn test_notification_catches_up_a_lagging_ledger() {
        let orders = InMemoryOrderStore::new();
        let order = orders.create(UserId::new(1), Sku::new(2)).await.unwrap();
        orders
            .advance_status(order.id, OrderStatus::ReservingStock, None)
            .await
            .unwrap();
        let service = LedgerService::new(Arc::new(orders.clone()));

        service
            .on_cancelled(&OrderCancelled {
                order: order.order_ref(),
                reason: "out of stock".into(),
            })
            .await
            .unwrap();

        let stored = orders.get(order.id).await.unwrap().unwrap();
        assert_eq!(stored.status, OrderStatus::Cancelled);
        assert_eq!(stored.reason, "out of stock");
    }

    #[tokio::test]
    async fn test_conflicting_notification_is_rejected() {
        let orders = InMemoryOrderStore::new();
        let order = orders.create(UserId::new(1), Sku::new(2)).await.unwrap();
        orders
            .advance_status(order.id, OrderStatus::Cancelled, Some("timed out"))
            .await
            .unwrap();
        let service = LedgerService::new(Arc::new(orders.clone()));

        let err = service
            .on_committed(&OrderCommitted {
                order: order.order_ref(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SagaError::LedgerRejected { .. }));
    }

    #[tokio::test]
    async fn test_unknown_order_is_reported() {
        let service = LedgerService::new(Arc::new(InMemoryOrderStore::new()));
        let ghost = OrderRef::new(OrderId::new(), UserId::new(1), Sku::new(1));
        let err = service
            .on_committed(&OrderCommitted { order: ghost })
            .await
            .unwrap_err();
        assert!(matches!(err, SagaError::UnknownOrder(_)));
    }
}
