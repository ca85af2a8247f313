//! Saga orchestrator: loads the context, decides, applies.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use common::{OrderId, UserId};
use domain::{OrderStatus, SagaContext};
use message_bus::{Delivery, Publisher};
use resource_store::{
    Advance, OrderStore, ProfileCache, ProfileCacheExt, ProfileStore, SagaStore, StoreError,
};

use crate::decision::{Decision, DropReason, SweepAction, Transition, decide, decide_expired};
use crate::error::{Result, SagaError};
use crate::locks::OrderLocks;
use crate::messages::SagaEvent;
use crate::settings::SagaSettings;
use crate::worker::MessageHandler;

/// Result of handling one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handled {
    Advanced(OrderStatus),
    Dropped(DropReason),
}

/// Result of handling one expired context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepOutcome {
    Reissued,
    Escalated,
}

/// Drives every order to `Committed` or `Cancelled`.
///
/// Holds no saga state of its own: each call loads the order's
/// [`SagaContext`], runs [`decide`] and applies the resulting transition in
/// a fixed order (profile refresh, publish, ledger, context). Each of those
/// writes is idempotent, so when one fails the message is redelivered and
/// the whole sequence runs again.
pub struct Orchestrator {
    orders: Arc<dyn OrderStore>,
    sagas: Arc<dyn SagaStore>,
    profiles: Arc<dyn ProfileStore>,
    cache: Arc<dyn ProfileCache>,
    locks: OrderLocks,
    settings: SagaSettings,
}

impl Orchestrator {
    pub fn new(
        orders: Arc<dyn OrderStore>,
        sagas: Arc<dyn SagaStore>,
        profiles: Arc<dyn ProfileStore>,
        cache: Arc<dyn ProfileCache>,
        settings: SagaSettings,
    ) -> Self {
        Self {
            orders,
            sagas,
            profiles,
            cache,
            locks: OrderLocks::new(),
            settings,
        }
    }

    pub async fn context(&self, order_id: OrderId) -> Result<Option<SagaContext>> {
        Ok(self.sagas.load(order_id).await?)
    }

    /// Handles one event for one order.
    #[tracing::instrument(
        skip(self, event, publisher),
        fields(order_id = %event.order().order_id, event = event.name())
    )]
    pub async fn handle(&self, event: &SagaEvent, publisher: &dyn Publisher) -> Result<Handled> {
        let order_id = event.order().order_id;
        let _guard = self.locks.lock(order_id).await;

        let ctx = self.sagas.load(order_id).await?;
        let now = Utc::now();
        let transition = match decide(
            ctx.as_ref(),
            event,
            now,
            self.settings.step_timeout_chrono(),
        ) {
            Decision::Advance(t) => t,
            Decision::Drop(reason) => {
                tracing::warn!(reason = reason.as_str(), "event dropped");
                metrics::counter!("saga_events_dropped_total", "reason" => reason.as_str())
                    .increment(1);
                return Ok(Handled::Dropped(reason));
            }
        };

        // Never reserve anything for an order the ledger does not know.
        if ctx.is_none() && self.orders.get(order_id).await?.is_none() {
            return Err(SagaError::UnknownOrder(order_id));
        }

        let state = transition.next.state;
        self.apply(ctx.as_ref(), transition, publisher).await?;
        Ok(Handled::Advanced(state))
    }

    /// Re-issues or escalates one expired saga. Returns `None` when the
    /// context moved on since it was listed.
    #[tracing::instrument(skip(self, publisher))]
    pub async fn handle_expired(
        &self,
        order_id: OrderId,
        publisher: &dyn Publisher,
    ) -> Result<Option<SweepOutcome>> {
        let _guard = self.locks.lock(order_id).await;

        let Some(ctx) = self.sagas.load(order_id).await? else {
            return Ok(None);
        };
        let Some(action) = decide_expired(
            &ctx,
            Utc::now(),
            self.settings.step_timeout_chrono(),
            self.settings.max_reissues,
        ) else {
            return Ok(None);
        };

        let outcome = match &action {
            SweepAction::Reissue(_) => {
                tracing::info!(state = %ctx.state, attempt = ctx.attempts + 1, "re-issuing step");
                SweepOutcome::Reissued
            }
            SweepAction::Escalate(_) => {
                tracing::warn!(state = %ctx.state, attempts = ctx.attempts, "step timed out, cancelling");
                SweepOutcome::Escalated
            }
        };
        let label = action.as_str();

        self.apply(Some(&ctx), action.into_transition(), publisher)
            .await?;
        metrics::counter!("saga_reconciliation_total", "action" => label).increment(1);
        Ok(Some(outcome))
    }

    /// Expired, non-terminal contexts, earliest deadline first.
    pub async fn expired(&self, limit: usize) -> Result<Vec<SagaContext>> {
        Ok(self.sagas.list_expired(Utc::now(), limit).await?)
    }

    async fn apply(
        &self,
        prev: Option<&SagaContext>,
        transition: Transition,
        publisher: &dyn Publisher,
    ) -> Result<()> {
        let Transition {
            next,
            commands,
            ledger,
            profile_status,
        } = transition;
        let order_id = next.order_id();
        let key = order_id.key();

        if let Some(status) = &profile_status {
            self.refresh_profile(next.order.user_id, status).await?;
        }

        for command in &commands {
            publisher
                .publish(command.topic(), &key, command.encode()?)
                .await?;
        }

        if let Some(update) = &ledger {
            let result = self
                .orders
                .advance_status(order_id, update.status, update.reason.as_deref())
                .await;
            match result {
                Ok(Advance::Applied) | Ok(Advance::AlreadyAt) => {}
                Ok(Advance::Rejected { current }) => {
                    return Err(SagaError::LedgerRejected {
                        order_id,
                        requested: update.status,
                        current,
                    });
                }
                Err(StoreError::OrderNotFound(id)) => return Err(SagaError::UnknownOrder(id)),
                Err(e) => return Err(e.into()),
            }
        }

        match self.sagas.save(&next).await {
            Ok(true) => {}
            Ok(false) | Err(StoreError::AlreadyExists(_)) => {
                return Err(SagaError::ContextConflict(order_id));
            }
            Err(e) => return Err(e.into()),
        }

        self.record(prev, &next);
        Ok(())
    }

    fn record(&self, prev: Option<&SagaContext>, next: &SagaContext) {
        match prev {
            None => {
                metrics::counter!("saga_started_total").increment(1);
                tracing::info!(user_id = %next.order.user_id, sku = %next.order.sku, "saga started");
            }
            Some(prev) => {
                let elapsed = (next.updated_at - prev.updated_at)
                    .to_std()
                    .unwrap_or_default();
                metrics::histogram!("saga_step_duration_seconds", "step" => prev.state.as_str())
                    .record(elapsed.as_secs_f64());
                if prev.state != next.state {
                    tracing::info!(from = %prev.state, to = %next.state, "saga advanced");
                }
            }
        }

        match next.state {
            OrderStatus::Committed => metrics::counter!("saga_committed_total").increment(1),
            OrderStatus::Cancelled => {
                let reason = next.reason.clone().unwrap_or_default();
                tracing::info!(reason = %reason, "saga cancelled");
                metrics::counter!("saga_cancelled_total", "reason" => reason).increment(1);
            }
            _ => {}
        }
    }

    /// Sets the buyer's profile status, then refreshes the cached snapshot.
    /// A cache failure is logged; the snapshot is rebuilt on the next
    /// status purchase.
    async fn refresh_profile(&self, user_id: UserId, status: &str) -> Result<()> {
        let Some(profile) = self.profiles.set_status(user_id, status).await? else {
            tracing::warn!(%user_id, status, "no profile to update");
            return Ok(());
        };

        if let Err(e) = self
            .cache
            .put_profile(&profile, self.settings.cache_ttl)
            .await
        {
            tracing::warn!(%user_id, error = %e, "profile cache refresh failed");
        }
        Ok(())
    }
}

#[async_trait]
impl MessageHandler for Orchestrator {
    async fn handle(&self, delivery: &Delivery, publisher: &dyn Publisher) -> Result<()> {
        let event = SagaEvent::from_delivery(delivery)?;
        Orchestrator::handle(self, &event, publisher).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::Sku;
    use domain::{ItemKind, ItemSnapshot, Money, OrderRef, Profile};
    use message_bus::{InMemoryBus, decode};
    use resource_store::{
        InMemoryOrderStore, InMemoryProfileCache, InMemoryProfileStore, InMemorySagaStore,
    };

    use crate::messages::{BalanceChecked, DebitBalance, ReserveStock, StockChecked};
    use crate::topics;

    struct Fixture {
        orchestrator: Orchestrator,
        orders: InMemoryOrderStore,
        sagas: InMemorySagaStore,
        profiles: InMemoryProfileStore,
        cache: InMemoryProfileCache,
        bus: InMemoryBus,
    }

    fn fixture() -> Fixture {
        fixture_with(SagaSettings::default())
    }

    fn fixture_with(settings: SagaSettings) -> Fixture {
        let orders = InMemoryOrderStore::new();
        let sagas = InMemorySagaStore::new();
        let profiles = InMemoryProfileStore::new();
        let cache = InMemoryProfileCache::new();
        let orchestrator = Orchestrator::new(
            Arc::new(orders.clone()),
            Arc::new(sagas.clone()),
            Arc::new(profiles.clone()),
            Arc::new(cache.clone()),
            settings,
        );
        Fixture {
            orchestrator,
            orders,
            sagas,
            profiles,
            cache,
            bus: InMemoryBus::new(4),
        }
    }

    fn gold() -> ItemSnapshot {
        ItemSnapshot {
            sku: Sku::new(4),
            name: "gold".into(),
            price: Money::from_cents(50),
            kind: ItemKind::Status,
        }
    }

    async fn submitted(f: &Fixture) -> OrderRef {
        let order = f.orders.create(UserId::new(1), Sku::new(4)).await.unwrap();
        let r = order.order_ref();
        let handled = f
            .orchestrator
            .handle(&SagaEvent::OrderSubmitted(r), &f.bus)
            .await
            .unwrap();
        assert_eq!(handled, Handled::Advanced(OrderStatus::ReservingStock));
        r
    }

    async fn stock_ok(f: &Fixture, order: OrderRef) {
        let ctx = f.sagas.load(order.order_id).await.unwrap().unwrap();
        let reply = SagaEvent::StockReserved(StockChecked {
            order,
            correlation_id: ctx.correlation_id,
            available: true,
            item: Some(gold()),
        });
        f.orchestrator.handle(&reply, &f.bus).await.unwrap();
    }

    #[tokio::test]
    async fn test_submission_publishes_reserve_and_advances_ledger() {
        let f = fixture();
        let order = submitted(&f).await;

        let records = f
            .bus
            .records_for_key(topics::STOCK_RESERVE, &order.order_id.key())
            .await;
        assert_eq!(records.len(), 1);
        let cmd: ReserveStock = decode(&records[0].payload).unwrap();
        assert_eq!(cmd.order, order);

        let stored = f.orders.get(order.order_id).await.unwrap().unwrap();
        assert_eq!(stored.status, OrderStatus::ReservingStock);
        let ctx = f.sagas.load(order.order_id).await.unwrap().unwrap();
        assert_eq!(ctx.correlation_id, cmd.correlation_id);
    }

    #[tokio::test]
    async fn test_submission_for_unknown_order_is_rejected() {
        let f = fixture();
        let ghost = OrderRef::new(OrderId::new(), UserId::new(1), Sku::new(1));
        let err = f
            .orchestrator
            .handle(&SagaEvent::OrderSubmitted(ghost), &f.bus)
            .await
            .unwrap_err();
        assert!(matches!(err, SagaError::UnknownOrder(_)));
        assert!(f.bus.records(topics::STOCK_RESERVE).await.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_stock_reply_is_dropped() {
        let f = fixture();
        let order = submitted(&f).await;
        let ctx = f.sagas.load(order.order_id).await.unwrap().unwrap();
        let reply = SagaEvent::StockReserved(StockChecked {
            order,
            correlation_id: ctx.correlation_id,
            available: true,
            item: Some(gold()),
        });

        f.orchestrator.handle(&reply, &f.bus).await.unwrap();
        let again = f.orchestrator.handle(&reply, &f.bus).await.unwrap();

        assert_eq!(again, Handled::Dropped(DropReason::Duplicate));
        assert_eq!(f.bus.records(topics::BALANCE_DEBIT).await.len(), 1);
    }

    #[tokio::test]
    async fn test_publish_failure_leaves_context_untouched() {
        let f = fixture();
        let order = submitted(&f).await;
        let before = f.sagas.load(order.order_id).await.unwrap().unwrap();

        f.bus.set_fail_on_publish(true);
        let ctx = before.clone();
        let reply = SagaEvent::StockReserved(StockChecked {
            order,
            correlation_id: ctx.correlation_id,
            available: true,
            item: Some(gold()),
        });
        let err = f.orchestrator.handle(&reply, &f.bus).await.unwrap_err();
        assert!(matches!(err, SagaError::Bus(_)));
        assert_eq!(f.sagas.load(order.order_id).await.unwrap(), Some(before));

        f.bus.set_fail_on_publish(false);
        let retried = f.orchestrator.handle(&reply, &f.bus).await.unwrap();
        assert_eq!(retried, Handled::Advanced(OrderStatus::CheckingBalance));
    }

    #[tokio::test]
    async fn test_status_purchase_updates_profile_and_cache() {
        let f = fixture();
        f.profiles
            .upsert(Profile::new(UserId::new(1), "ada"))
            .await
            .unwrap();
        let order = submitted(&f).await;
        stock_ok(&f, order).await;

        let ctx = f.sagas.load(order.order_id).await.unwrap().unwrap();
        let debit: Vec<DebitBalance> = f
            .bus
            .records(topics::BALANCE_DEBIT)
            .await
            .iter()
            .map(|r| decode(&r.payload).unwrap())
            .collect();
        assert_eq!(debit[0].correlation_id, ctx.correlation_id);

        let reply = SagaEvent::BalanceChecked(BalanceChecked {
            order,
            correlation_id: ctx.correlation_id,
            item: gold(),
            sufficient: true,
        });
        let handled = f.orchestrator.handle(&reply, &f.bus).await.unwrap();
        assert_eq!(handled, Handled::Advanced(OrderStatus::Committed));

        let profile = f.profiles.get(UserId::new(1)).await.unwrap().unwrap();
        assert_eq!(profile.status, "gold");
        let cached = f.cache.get_profile(UserId::new(1)).await.unwrap().unwrap();
        assert_eq!(cached.status, "gold");

        let stored = f.orders.get(order.order_id).await.unwrap().unwrap();
        assert_eq!(stored.status, OrderStatus::Committed);
        assert_eq!(stored.reason, "paid");
    }

    #[tokio::test]
    async fn test_cache_failure_does_not_fail_commit() {
        let f = fixture();
        f.profiles
            .upsert(Profile::new(UserId::new(1), "ada"))
            .await
            .unwrap();
        f.cache.set_fail(true);
        let order = submitted(&f).await;
        stock_ok(&f, order).await;

        let ctx = f.sagas.load(order.order_id).await.unwrap().unwrap();
        let reply = SagaEvent::BalanceChecked(BalanceChecked {
            order,
            correlation_id: ctx.correlation_id,
            item: gold(),
            sufficient: true,
        });
        let handled = f.orchestrator.handle(&reply, &f.bus).await.unwrap();
        assert_eq!(handled, Handled::Advanced(OrderStatus::Committed));
    }

    #[tokio::test]
    async fn test_live_context_is_not_swept() {
        let f = fixture();
        let order = submitted(&f).await;
        let outcome = f
            .orchestrator
            .handle_expired(order.order_id, &f.bus)
            .await
            .unwrap();
        assert_eq!(outcome, None);
        assert!(f.orchestrator.expired(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_huge_step_timeout_is_clamped() {
        let f = fixture_with(SagaSettings {
            step_timeout: std::time::Duration::from_secs(u64::MAX / 2),
            ..SagaSettings::default()
        });
        let before = Utc::now();
        let order = submitted(&f).await;

        let ctx = f.sagas.load(order.order_id).await.unwrap().unwrap();
        let deadline = ctx.deadline.unwrap();
        assert!(deadline > before + chrono::Duration::days(29));
        assert!(deadline <= Utc::now() + chrono::Duration::days(30));
    }
}
