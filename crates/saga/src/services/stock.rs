//! Stock service: answers `stock.reserve` and `stock.release`.

use std::sync::Arc;

use async_trait::async_trait;
use message_bus::{Delivery, Publisher, encode};
use resource_store::{ReleaseOutcome, ReserveOutcome, StockStore};

use crate::error::{Result, SagaError};
use crate::messages::{ReleaseStock, ReserveStock, StockChecked, decode_from};
use crate::topics;
use crate::worker::MessageHandler;

pub struct StockService {
    store: Arc<dyn StockStore>,
}

impl StockService {
    pub fn new(store: Arc<dyn StockStore>) -> Self {
        Self { store }
    }

    /// Reserves one unit and publishes the outcome on `stock.checked`.
    ///
    /// A redelivered command replays the recorded outcome, so the reply is
    /// the same however often it is sent.
    #[tracing::instrument(
        skip(self, cmd, publisher),
        fields(order_id = %cmd.order.order_id, sku = %cmd.order.sku)
    )]
    pub async fn reserve(
        &self,
        cmd: &ReserveStock,
        publisher: &dyn Publisher,
    ) -> Result<ReserveOutcome> {
        let order_id = cmd.order.order_id;
        let outcome = self.store.reserve(order_id, cmd.order.sku).await?;

        let label = match &outcome {
            ReserveOutcome::Reserved { remaining, .. } => {
                tracing::info!(remaining, "unit reserved");
                "reserved"
            }
            ReserveOutcome::Unavailable { .. } => {
                tracing::info!("sold out");
                "unavailable"
            }
            ReserveOutcome::UnknownSku => {
                tracing::warn!("unknown sku");
                "unknown_sku"
            }
            ReserveOutcome::Replayed { state, .. } => {
                tracing::debug!(state = state.as_str(), "reserve replayed");
                "replayed"
            }
        };
        metrics::counter!("stock_reservations_total", "outcome" => label).increment(1);

        let reply = StockChecked {
            order: cmd.order,
            correlation_id: cmd.correlation_id,
            available: outcome.available(),
            item: outcome.item().cloned(),
        };
        publisher
            .publish(topics::STOCK_CHECKED, &order_id.key(), encode(&reply)?)
            .await?;
        Ok(outcome)
    }

    /// Gives the order's unit back. Nothing is published.
    #[tracing::instrument(
        skip(self, cmd),
        fields(order_id = %cmd.order.order_id, sku = %cmd.order.sku)
    )]
    pub async fn release(&self, cmd: &ReleaseStock) -> Result<ReleaseOutcome> {
        let outcome = self
            .store
            .release(cmd.order.order_id, cmd.order.sku)
            .await?;

        let label = match outcome {
            ReleaseOutcome::Released { count } => {
                tracing::info!(count, "unit released");
                "released"
            }
            ReleaseOutcome::AlreadyReleased => "already_released",
            ReleaseOutcome::NothingReserved => "nothing_reserved",
            ReleaseOutcome::Tombstoned => {
                tracing::warn!("release arrived before reserve");
                "tombstoned"
            }
        };
        metrics::counter!("stock_releases_total", "outcome" => label).increment(1);
        Ok(outcome)
    }
}

#[async_trait]
impl MessageHandler for StockService {
    async fn handle(&self, delivery: &Delivery, publisher: &dyn Publisher) -> Result<()> {
        match delivery.topic.as_str() {
            topics::STOCK_RESERVE => {
                self.reserve(&decode_from(delivery)?, publisher).await?;
            }
            topics::STOCK_RELEASE => {
                self.release(&decode_from(delivery)?).await?;
            }
            other => return Err(SagaError::UnexpectedTopic(other.to_string())),
        }
        Ok(())
    }
}
