use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{OrderId, Sku, UserId};
use domain::{Balance, Money, Order, OrderStatus, Profile, SagaContext, StockItem};
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::{
    Result, StoreError,
    store::{
        Advance, BalanceStore, CreditOutcome, Debit, DebitOutcome, DebitState, OrderStore,
        ProfileCache, ProfileStore, ReleaseOutcome, Reservation, ReservationState,
        ReserveOutcome, SagaStore, StockStore,
    },
};

fn injected(flag: &AtomicBool, op: &str) -> Result<()> {
    if flag.load(Ordering::SeqCst) {
        return Err(StoreError::Unavailable(format!("injected failure on {op}")));
    }
    Ok(())
}

#[derive(Default)]
struct StockState {
    items: BTreeMap<Sku, StockItem>,
    reservations: HashMap<OrderId, Reservation>,
}

/// In-memory stock store for tests and single-process runs.
///
/// Every operation runs under one lock, so two orders racing for the last
/// unit are serialized.
#[derive(Clone, Default)]
pub struct InMemoryStockStore {
    state: Arc<RwLock<StockState>>,
    fail_on_reserve: Arc<AtomicBool>,
    fail_on_release: Arc<AtomicBool>,
}

impl InMemoryStockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store seeded with `items`.
    pub async fn with_items(items: impl IntoIterator<Item = StockItem>) -> Self {
        let store = Self::new();
        {
            let mut state = store.state.write().await;
            for item in items {
                state.items.insert(item.sku, item);
            }
        }
        store
    }

    /// Makes every subsequent `reserve` fail with `Unavailable`.
    pub fn set_fail_on_reserve(&self, fail: bool) {
        self.fail_on_reserve.store(fail, Ordering::SeqCst);
    }

    /// Makes every subsequent `release` fail with `Unavailable`.
    pub fn set_fail_on_release(&self, fail: bool) {
        self.fail_on_release.store(fail, Ordering::SeqCst);
    }

    pub async fn count(&self, sku: Sku) -> Option<i64> {
        self.state.read().await.items.get(&sku).map(|i| i.count)
    }
}

#[async_trait]
impl StockStore for InMemoryStockStore {
    async fn upsert(&self, item: StockItem) -> Result<()> {
        self.state.write().await.items.insert(item.sku, item);
        Ok(())
    }

    async fn get(&self, sku: Sku) -> Result<Option<StockItem>> {
        Ok(self.state.read().await.items.get(&sku).cloned())
    }

    async fn list(&self) -> Result<Vec<StockItem>> {
        Ok(self.state.read().await.items.values().cloned().collect())
    }

    async fn reserve(&self, order_id: OrderId, sku: Sku) -> Result<ReserveOutcome> {
        injected(&self.fail_on_reserve, "reserve")?;
        let mut state = self.state.write().await;

        if let Some(existing) = state.reservations.get(&order_id) {
            let item = state.items.get(&existing.sku).map(StockItem::snapshot);
            return Ok(ReserveOutcome::Replayed {
                state: existing.state,
                item,
            });
        }

        let (outcome, record) = match state.items.get_mut(&sku) {
            Some(item) if item.count > 0 => {
                item.count -= 1;
                let outcome = ReserveOutcome::Reserved {
                    item: item.snapshot(),
                    remaining: item.count,
                };
                (outcome, ReservationState::Reserved)
            }
            Some(item) => (
                ReserveOutcome::Unavailable {
                    item: item.snapshot(),
                },
                ReservationState::Rejected,
            ),
            None => (ReserveOutcome::UnknownSku, ReservationState::Rejected),
        };

        state.reservations.insert(
            order_id,
            Reservation {
                order_id,
                sku,
                state: record,
            },
        );
        Ok(outcome)
    }

    async fn release(&self, order_id: OrderId, sku: Sku) -> Result<ReleaseOutcome> {
        injected(&self.fail_on_release, "release")?;
        let mut state = self.state.write().await;

        let Some(record) = state.reservations.get_mut(&order_id) else {
            state.reservations.insert(
                order_id,
                Reservation {
                    order_id,
                    sku,
                    state: ReservationState::Released,
                },
            );
            return Ok(ReleaseOutcome::Tombstoned);
        };

        match record.state {
            ReservationState::Released => Ok(ReleaseOutcome::AlreadyReleased),
            ReservationState::Rejected => Ok(ReleaseOutcome::NothingReserved),
            ReservationState::Reserved => {
                record.state = ReservationState::Released;
                let held = record.sku;
                let count = match state.items.get_mut(&held) {
                    Some(item) => {
                        item.count += 1;
                        item.count
                    }
                    None => 0,
                };
                Ok(ReleaseOutcome::Released { count })
            }
        }
    }

    async fn reservation(&self, order_id: OrderId) -> Result<Option<Reservation>> {
        Ok(self.state.read().await.reservations.get(&order_id).cloned())
    }
}

#[derive(Default)]
struct BalanceState {
    balances: HashMap<UserId, Money>,
    debits: HashMap<OrderId, Debit>,
}

/// In-memory balance store.
#[derive(Clone, Default)]
pub struct InMemoryBalanceStore {
    state: Arc<RwLock<BalanceState>>,
    fail_on_debit: Arc<AtomicBool>,
    fail_on_credit: Arc<AtomicBool>,
}

impl InMemoryBalanceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn with_balances(balances: impl IntoIterator<Item = Balance>) -> Self {
        let store = Self::new();
        {
            let mut state = store.state.write().await;
            for b in balances {
                state.balances.insert(b.user_id, b.amount);
            }
        }
        store
    }

    pub fn set_fail_on_debit(&self, fail: bool) {
        self.fail_on_debit.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_on_credit(&self, fail: bool) {
        self.fail_on_credit.store(fail, Ordering::SeqCst);
    }

    pub async fn amount(&self, user_id: UserId) -> Option<Money> {
        self.state.read().await.balances.get(&user_id).copied()
    }
}

#[async_trait]
impl BalanceStore for InMemoryBalanceStore {
    async fn set(&self, balance: Balance) -> Result<()> {
        self.state
            .write()
            .await
            .balances
            .insert(balance.user_id, balance.amount);
        Ok(())
    }

    async fn get(&self, user_id: UserId) -> Result<Option<Balance>> {
        Ok(self
            .state
            .read()
            .await
            .balances
            .get(&user_id)
            .map(|amount| Balance::new(user_id, *amount)))
    }

    async fn debit(
        &self,
        order_id: OrderId,
        user_id: UserId,
        amount: Money,
    ) -> Result<DebitOutcome> {
        injected(&self.fail_on_debit, "debit")?;
        let mut state = self.state.write().await;

        if let Some(existing) = state.debits.get(&order_id) {
            return Ok(DebitOutcome::Replayed {
                state: existing.state,
            });
        }

        let (outcome, record) = match state.balances.get_mut(&user_id) {
            Some(balance) => match balance.checked_debit(amount) {
                Some(rest) => {
                    *balance = rest;
                    (
                        DebitOutcome::Sufficient { remaining: rest },
                        DebitState::Debited,
                    )
                }
                None => (DebitOutcome::Insufficient, DebitState::Rejected),
            },
            None => (DebitOutcome::Insufficient, DebitState::Rejected),
        };

        state.debits.insert(
            order_id,
            Debit {
                order_id,
                user_id,
                amount,
                state: record,
            },
        );
        Ok(outcome)
    }

    async fn credit(
        &self,
        order_id: OrderId,
        user_id: UserId,
        amount: Money,
    ) -> Result<CreditOutcome> {
        injected(&self.fail_on_credit, "credit")?;
        let mut state = self.state.write().await;

        let Some(record) = state.debits.get_mut(&order_id) else {
            state.debits.insert(
                order_id,
                Debit {
                    order_id,
                    user_id,
                    amount,
                    state: DebitState::Credited,
                },
            );
            return Ok(CreditOutcome::Tombstoned);
        };

        match record.state {
            DebitState::Credited => Ok(CreditOutcome::AlreadyCredited),
            DebitState::Rejected => Ok(CreditOutcome::NothingDebited),
            DebitState::Debited => {
                record.state = DebitState::Credited;
                let (owner, paid) = (record.user_id, record.amount);
                let balance = state.balances.entry(owner).or_insert_with(Money::zero);
                *balance += paid;
                Ok(CreditOutcome::Credited { balance: *balance })
            }
        }
    }

    async fn debit_record(&self, order_id: OrderId) -> Result<Option<Debit>> {
        Ok(self.state.read().await.debits.get(&order_id).cloned())
    }
}

/// In-memory order ledger.
#[derive(Clone, Default)]
pub struct InMemoryOrderStore {
    orders: Arc<RwLock<HashMap<OrderId, Order>>>,
    fail_on_advance: Arc<AtomicBool>,
}

impl InMemoryOrderStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_on_advance(&self, fail: bool) {
        self.fail_on_advance.store(fail, Ordering::SeqCst);
    }

    fn sorted(mut orders: Vec<Order>) -> Vec<Order> {
        orders.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        orders
    }
}

#[async_trait]
impl OrderStore for InMemoryOrderStore {
    async fn create(&self, user_id: UserId, sku: Sku) -> Result<Order> {
        let order = Order::new(user_id, sku);
        self.orders.write().await.insert(order.id, order.clone());
        Ok(order)
    }

    async fn get(&self, order_id: OrderId) -> Result<Option<Order>> {
        Ok(self.orders.read().await.get(&order_id).cloned())
    }

    async fn list_by_user(&self, user_id: UserId) -> Result<Vec<Order>> {
        let orders = self.orders.read().await;
        Ok(Self::sorted(
            orders
                .values()
                .filter(|o| o.user_id == user_id)
                .cloned()
                .collect(),
        ))
    }

    async fn list_all(&self) -> Result<Vec<Order>> {
        Ok(Self::sorted(
            self.orders.read().await.values().cloned().collect(),
        ))
    }

    async fn advance_status(
        &self,
        order_id: OrderId,
        next: OrderStatus,
        reason: Option<&str>,
    ) -> Result<Advance> {
        injected(&self.fail_on_advance, "advance_status")?;
        let mut orders = self.orders.write().await;
        let order = orders
            .get_mut(&order_id)
            .ok_or(StoreError::OrderNotFound(order_id))?;

        if order.status == next {
            return Ok(Advance::AlreadyAt);
        }
        if !order.status.can_transition_to(next) {
            return Ok(Advance::Rejected {
                current: order.status,
            });
        }

        order.status = next;
        if let Some(reason) = reason {
            order.reason = reason.to_string();
        }
        order.updated_at = Utc::now();
        Ok(Advance::Applied)
    }

    async fn set_reason(&self, order_id: OrderId, reason: &str) -> Result<()> {
        let mut orders = self.orders.write().await;
        let order = orders
            .get_mut(&order_id)
            .ok_or(StoreError::OrderNotFound(order_id))?;
        order.reason = reason.to_string();
        order.updated_at = Utc::now();
        Ok(())
    }
}

/// In-memory saga context store.
#[derive(Clone, Default)]
pub struct InMemorySagaStore {
    contexts: Arc<RwLock<HashMap<OrderId, SagaContext>>>,
    fail_on_save: Arc<AtomicBool>,
}

impl InMemorySagaStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_on_save(&self, fail: bool) {
        self.fail_on_save.store(fail, Ordering::SeqCst);
    }

    pub async fn len(&self) -> usize {
        self.contexts.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.contexts.read().await.is_empty()
    }
}

#[async_trait]
impl SagaStore for InMemorySagaStore {
    async fn load(&self, order_id: OrderId) -> Result<Option<SagaContext>> {
        Ok(self.contexts.read().await.get(&order_id).cloned())
    }

    async fn save(&self, ctx: &SagaContext) -> Result<bool> {
        injected(&self.fail_on_save, "save")?;
        let mut contexts = self.contexts.write().await;
        let order_id = ctx.order_id();

        match contexts.get(&order_id) {
            None if ctx.version == 1 => {
                contexts.insert(order_id, ctx.clone());
                Ok(true)
            }
            Some(_) if ctx.version == 1 => Err(StoreError::AlreadyExists(order_id)),
            Some(stored) if stored.version + 1 == ctx.version => {
                contexts.insert(order_id, ctx.clone());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_expired(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<SagaContext>> {
        let contexts = self.contexts.read().await;
        let mut expired: Vec<_> = contexts
            .values()
            .filter(|c| c.is_expired(now))
            .cloned()
            .collect();
        expired.sort_by_key(|c| c.deadline);
        expired.truncate(limit);
        Ok(expired)
    }
}

/// In-memory profile store.
#[derive(Clone, Default)]
pub struct InMemoryProfileStore {
    profiles: Arc<RwLock<HashMap<UserId, Profile>>>,
}

impl InMemoryProfileStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProfileStore for InMemoryProfileStore {
    async fn upsert(&self, profile: Profile) -> Result<()> {
        self.profiles.write().await.insert(profile.user_id, profile);
        Ok(())
    }

    async fn get(&self, user_id: UserId) -> Result<Option<Profile>> {
        Ok(self.profiles.read().await.get(&user_id).cloned())
    }

    async fn set_status(&self, user_id: UserId, status: &str) -> Result<Option<Profile>> {
        let mut profiles = self.profiles.write().await;
        Ok(profiles.get_mut(&user_id).map(|p| {
            p.status = status.to_string();
            p.updated_at = Utc::now();
            p.clone()
        }))
    }
}

/// In-memory TTL cache.
#[derive(Clone, Default)]
pub struct InMemoryProfileCache {
    entries: Arc<RwLock<HashMap<String, (String, Instant)>>>,
    fail: Arc<AtomicBool>,
}

impl InMemoryProfileCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every cache call fail with `Unavailable`.
    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl ProfileCache for InMemoryProfileCache {
    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<()> {
        injected(&self.fail, "cache set")?;
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        entries.retain(|_, (_, expires)| *expires > now);
        entries.insert(key.to_string(), (value, now + ttl));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        injected(&self.fail, "cache get")?;
        let now = Instant::now();
        Ok(self
            .entries
            .read()
            .await
            .get(key)
            .filter(|(_, expires)| *expires > now)
            .map(|(value, _)| value.clone()))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        injected(&self.fail, "cache delete")?;
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        injected(&self.fail, "cache list")?;
        let now = Instant::now();
        let mut entries: Vec<_> = self
            .entries
            .read()
            .await
            .iter()
            .filter(|(k, (_, expires))| k.starts_with(prefix) && *expires > now)
            .map(|(k, (v, _))| (k.clone(), v.clone()))
            .collect();
        entries.sort();
        Ok(entries)
    }
}
