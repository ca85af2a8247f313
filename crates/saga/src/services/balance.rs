//! Balance service: answers `balance.debit` and `balance.credit`.

use std::sync::Arc;

use async_trait::async_trait;
use message_bus::{Delivery, Publisher, encode};
use resource_store::{BalanceStore, CreditOutcome, DebitOutcome};

use crate::error::{Result, SagaError};
use crate::messages::{BalanceChecked, CreditBalance, DebitBalance, decode_from};
use crate::topics;
use crate::worker::MessageHandler;

pub struct BalanceService {
    store: Arc<dyn BalanceStore>,
}

impl BalanceService {
    pub fn new(store: Arc<dyn BalanceStore>) -> Self {
        Self { store }
    }

    /// Debits the item price and publishes the outcome on
    /// `balance.checked`.
    #[tracing::instrument(
        skip(self, cmd, publisher),
        fields(order_id = %cmd.order.order_id, user_id = %cmd.order.user_id, price = %cmd.item.price)
    )]
    pub async fn debit(&self, cmd: &DebitBalance, publisher: &dyn Publisher) -> Result<DebitOutcome> {
        let order = cmd.order;
        let outcome = self
            .store
            .debit(order.order_id, order.user_id, cmd.item.price)
            .await?;

        let label = match outcome {
            DebitOutcome::Sufficient { remaining } => {
                tracing::info!(%remaining, "balance debited");
                "sufficient"
            }
            DebitOutcome::Insufficient => {
                tracing::info!("insufficient funds");
                "insufficient"
            }
            DebitOutcome::Replayed { state } => {
                tracing::debug!(state = state.as_str(), "debit replayed");
                "replayed"
            }
        };
        metrics::counter!("balance_debits_total", "outcome" => label).increment(1);

        let reply = BalanceChecked {
            order,
            correlation_id: cmd.correlation_id,
            item: cmd.item.clone(),
            sufficient: outcome.sufficient(),
        };
        publisher
            .publish(topics::BALANCE_CHECKED, &order.order_id.key(), encode(&reply)?)
            .await?;
        Ok(outcome)
    }

    /// Refunds the order's debit. Nothing is published.
    #[tracing::instrument(
        skip(self, cmd),
        fields(order_id = %cmd.order.order_id, user_id = %cmd.order.user_id)
    )]
    pub async fn credit(&self, cmd: &CreditBalance) -> Result<CreditOutcome> {
        let order = cmd.order;
        let outcome = self
            .store
            .credit(order.order_id, order.user_id, cmd.amount)
            .await?;

        let label = match outcome {
            CreditOutcome::Credited { balance } => {
                tracing::info!(%balance, "balance credited");
                "credited"
            }
            CreditOutcome::AlreadyCredited => "already_credited",
            CreditOutcome::NothingDebited => "nothing_debited",
            CreditOutcome::Tombstoned => {
                tracing::warn!("credit arrived before debit");
                "tombstoned"
            }
        };
        metrics::counter!("balance_credits_total", "outcome" => label).increment(1);
        Ok(outcome)
    }
}

#[async_trait]
impl MessageHandler for BalanceService {
    async fn handle(&self, delivery: &Delivery, publisher: &dyn Publisher) -> Result<()> {
        match delivery.topic.as_str() {
            topics::BALANCE_DEBIT => {
                self.debit(&decode_from(delivery)?, publisher).await?;
            }
            topics::BALANCE_CREDIT => {
                self.credit(&decode_from(delivery)?).await?;
            }
            other => return Err(SagaError::UnexpectedTopic(other.to_string())),
        }
        Ok(())
    }
}
