use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{OrderId, Sku, UserId};
use domain::{
    Balance, DomainError, ItemSnapshot, Money, Order, OrderStatus, Profile, SagaContext, StockItem,
};

use crate::Result;

/// State of the per-order stock dedup record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReservationState {
    /// One unit is held for the order.
    Reserved,
    /// The reserve was refused; nothing is held.
    Rejected,
    /// The unit went back to stock, or a release arrived first.
    Released,
}

impl ReservationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationState::Reserved => "reserved",
            ReservationState::Rejected => "rejected",
            ReservationState::Released => "released",
        }
    }
}

impl std::str::FromStr for ReservationState {
    type Err = DomainError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "reserved" => Ok(ReservationState::Reserved),
            "rejected" => Ok(ReservationState::Rejected),
            "released" => Ok(ReservationState::Released),
            other => Err(DomainError::UnknownStatus(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub order_id: OrderId,
    pub sku: Sku,
    pub state: ReservationState,
}

/// Result of [`StockStore::reserve`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReserveOutcome {
    /// One unit was taken.
    Reserved { item: ItemSnapshot, remaining: i64 },
    /// The SKU exists but is sold out.
    Unavailable { item: ItemSnapshot },
    /// No such SKU.
    UnknownSku,
    /// The order already has a reservation record; nothing changed.
    Replayed {
        state: ReservationState,
        item: Option<ItemSnapshot>,
    },
}

impl ReserveOutcome {
    /// Whether the order holds a unit after this call.
    pub fn available(&self) -> bool {
        match self {
            ReserveOutcome::Reserved { .. } => true,
            ReserveOutcome::Replayed { state, .. } => *state == ReservationState::Reserved,
            ReserveOutcome::Unavailable { .. } | ReserveOutcome::UnknownSku => false,
        }
    }

    pub fn item(&self) -> Option<&ItemSnapshot> {
        match self {
            ReserveOutcome::Reserved { item, .. } | ReserveOutcome::Unavailable { item } => {
                Some(item)
            }
            ReserveOutcome::Replayed { item, .. } => item.as_ref(),
            ReserveOutcome::UnknownSku => None,
        }
    }
}

/// Result of [`StockStore::release`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// The held unit is back in stock.
    Released { count: i64 },
    AlreadyReleased,
    /// The reserve was refused, so there is nothing to give back.
    NothingReserved,
    /// No reservation yet; a tombstone now blocks a late reserve.
    Tombstoned,
}

/// Stock owned by the stock service.
///
/// `reserve` and `release` are idempotent per order: the outcome of the
/// first call is recorded and later calls replay it without touching
/// `count`.
#[async_trait]
pub trait StockStore: Send + Sync {
    /// Inserts or replaces a catalogue row.
    async fn upsert(&self, item: StockItem) -> Result<()>;

    async fn get(&self, sku: Sku) -> Result<Option<StockItem>>;

    /// The whole catalogue, ordered by SKU.
    async fn list(&self) -> Result<Vec<StockItem>>;

    /// Takes one unit of `sku` for `order_id` if `count > 0`.
    async fn reserve(&self, order_id: OrderId, sku: Sku) -> Result<ReserveOutcome>;

    /// Gives back the unit held for `order_id`, if any.
    async fn release(&self, order_id: OrderId, sku: Sku) -> Result<ReleaseOutcome>;

    async fn reservation(&self, order_id: OrderId) -> Result<Option<Reservation>>;
}

/// State of the per-order balance dedup record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DebitState {
    Debited,
    Rejected,
    /// Money went back to the user, or a credit arrived first.
    Credited,
}

impl DebitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DebitState::Debited => "debited",
            DebitState::Rejected => "rejected",
            DebitState::Credited => "credited",
        }
    }
}

impl std::str::FromStr for DebitState {
    type Err = DomainError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "debited" => Ok(DebitState::Debited),
            "rejected" => Ok(DebitState::Rejected),
            "credited" => Ok(DebitState::Credited),
            other => Err(DomainError::UnknownStatus(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Debit {
    pub order_id: OrderId,
    pub user_id: UserId,
    pub amount: Money,
    pub state: DebitState,
}

/// Result of [`BalanceStore::debit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebitOutcome {
    Sufficient { remaining: Money },
    /// Balance too low, or no balance row for the user.
    Insufficient,
    /// The order already has a debit record; nothing changed.
    Replayed { state: DebitState },
}

impl DebitOutcome {
    /// Whether the order's price is paid after this call.
    pub fn sufficient(&self) -> bool {
        match self {
            DebitOutcome::Sufficient { .. } => true,
            DebitOutcome::Replayed { state } => *state == DebitState::Debited,
            DebitOutcome::Insufficient => false,
        }
    }
}

/// Result of [`BalanceStore::credit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreditOutcome {
    Credited { balance: Money },
    AlreadyCredited,
    NothingDebited,
    /// No debit yet; a tombstone now blocks a late debit.
    Tombstoned,
}

/// Balances owned by the balance service. Idempotent per order like
/// [`StockStore`].
#[async_trait]
pub trait BalanceStore: Send + Sync {
    /// Sets a user's balance outright.
    async fn set(&self, balance: Balance) -> Result<()>;

    async fn get(&self, user_id: UserId) -> Result<Option<Balance>>;

    /// Takes `amount` from `user_id` for `order_id` if the balance covers it.
    async fn debit(&self, order_id: OrderId, user_id: UserId, amount: Money)
    -> Result<DebitOutcome>;

    /// Returns what was debited for `order_id`. The recorded amount wins
    /// over `amount` when both exist.
    async fn credit(
        &self,
        order_id: OrderId,
        user_id: UserId,
        amount: Money,
    ) -> Result<CreditOutcome>;

    async fn debit_record(&self, order_id: OrderId) -> Result<Option<Debit>>;
}

/// Result of [`OrderStore::advance_status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    Applied,
    /// The order already has the requested status.
    AlreadyAt,
    /// The stored status cannot move to the requested one.
    Rejected { current: OrderStatus },
}

/// The order ledger.
#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Allocates a new order in `Created` status.
    async fn create(&self, user_id: UserId, sku: Sku) -> Result<Order>;

    async fn get(&self, order_id: OrderId) -> Result<Option<Order>>;

    /// Orders of one user, oldest first.
    async fn list_by_user(&self, user_id: UserId) -> Result<Vec<Order>>;

    /// Every order, oldest first.
    async fn list_all(&self) -> Result<Vec<Order>>;

    /// Moves the order forward if its stored status allows it. `reason`, when
    /// given, is written in the same update.
    ///
    /// Fails with `OrderNotFound` for an unknown order.
    async fn advance_status(
        &self,
        order_id: OrderId,
        next: OrderStatus,
        reason: Option<&str>,
    ) -> Result<Advance>;

    /// Overwrites the advisory reason. Allowed in every status.
    async fn set_reason(&self, order_id: OrderId, reason: &str) -> Result<()>;
}

/// Orchestrator context persistence with optimistic concurrency on
/// [`SagaContext::version`].
#[async_trait]
pub trait SagaStore: Send + Sync {
    async fn load(&self, order_id: OrderId) -> Result<Option<SagaContext>>;

    /// Saves `ctx`. Version 1 inserts and fails with `AlreadyExists` when a
    /// context is already there; any later version only replaces the stored
    /// context at `ctx.version - 1`. Returns false when that check fails.
    async fn save(&self, ctx: &SagaContext) -> Result<bool>;

    /// Non-terminal contexts whose deadline is at or before `now`, earliest
    /// deadline first.
    async fn list_expired(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<SagaContext>>;
}

/// Durable user profiles.
#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn upsert(&self, profile: Profile) -> Result<()>;

    async fn get(&self, user_id: UserId) -> Result<Option<Profile>>;

    /// Sets the profile status and returns the updated profile, or `None`
    /// for an unknown user.
    async fn set_status(&self, user_id: UserId, status: &str) -> Result<Option<Profile>>;
}

/// Key-value cache holding denormalized profile snapshots as JSON.
#[async_trait]
pub trait ProfileCache: Send + Sync {
    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<()>;

    /// `None` when absent or expired.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Live entries whose key starts with `prefix`, sorted by key.
    async fn list(&self, prefix: &str) -> Result<Vec<(String, String)>>;
}

/// Extension methods that read and write [`Profile`] snapshots.
#[async_trait]
pub trait ProfileCacheExt: ProfileCache {
    async fn put_profile(&self, profile: &Profile, ttl: Duration) -> Result<()> {
        let json = serde_json::to_string(profile)?;
        self.set(&profile.cache_key(), json, ttl).await
    }

    async fn get_profile(&self, user_id: UserId) -> Result<Option<Profile>> {
        match self.get(&user_id.cache_key()).await? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }
}

impl<T: ProfileCache + ?Sized> ProfileCacheExt for T {}
