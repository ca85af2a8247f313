use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{CorrelationId, OrderId, Sku, UserId};
use domain::{
    Balance, ItemSnapshot, Money, Order, OrderRef, OrderStatus, Profile, SagaContext, StockItem,
};
use sqlx::{PgPool, Postgres, Row, Transaction, postgres::PgRow};
use uuid::Uuid;

use crate::{
    Result, StoreError,
    store::{
        Advance, BalanceStore, CreditOutcome, Debit, DebitOutcome, DebitState, OrderStore,
        ProfileStore, ReleaseOutcome, Reservation, ReservationState, ReserveOutcome, SagaStore,
        StockStore,
    },
};

/// PostgreSQL-backed implementation of every store trait.
///
/// Resource mutations are single-row conditional updates inside a
/// transaction that first claims the per-order dedup row, so concurrent
/// duplicates of the same command serialize on its primary key.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Creates a new PostgreSQL store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn row_to_item(row: &PgRow) -> Result<StockItem> {
        let kind: String = row.try_get("kind")?;
        Ok(StockItem {
            sku: Sku::new(row.try_get("sku")?),
            name: row.try_get("name")?,
            price: Money::from_cents(row.try_get("price")?),
            count: row.try_get("count")?,
            kind: kind.parse()?,
        })
    }

    fn row_to_order(row: &PgRow) -> Result<Order> {
        let status: String = row.try_get("status")?;
        Ok(Order {
            id: OrderId::from_uuid(row.try_get::<Uuid, _>("id")?),
            user_id: UserId::new(row.try_get("user_id")?),
            sku: Sku::new(row.try_get("sku")?),
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            status: status.parse()?,
            reason: row.try_get("reason")?,
        })
    }

    fn row_to_context(row: &PgRow) -> Result<SagaContext> {
        let state: String = row.try_get("state")?;
        let item: Option<serde_json::Value> = row.try_get("item")?;
        let item: Option<ItemSnapshot> = item.map(serde_json::from_value).transpose()?;
        let attempts: i32 = row.try_get("attempts")?;
        let version: i64 = row.try_get("version")?;

        Ok(SagaContext {
            order: OrderRef::new(
                OrderId::from_uuid(row.try_get::<Uuid, _>("order_id")?),
                UserId::new(row.try_get("user_id")?),
                Sku::new(row.try_get("sku")?),
            ),
            state: state.parse()?,
            item,
            correlation_id: CorrelationId::from_uuid(row.try_get::<Uuid, _>("correlation_id")?),
            deadline: row.try_get("deadline")?,
            attempts: attempts.max(0) as u32,
            version: version.max(0) as u64,
            reason: row.try_get("reason")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn row_to_profile(row: &PgRow) -> Result<Profile> {
        Ok(Profile {
            user_id: UserId::new(row.try_get("user_id")?),
            name: row.try_get("name")?,
            status: row.try_get("status")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    async fn item_in_tx(
        tx: &mut Transaction<'_, Postgres>,
        sku: Sku,
    ) -> Result<Option<StockItem>> {
        let row = sqlx::query("SELECT sku, name, price, count, kind FROM stock WHERE sku = $1")
            .bind(sku.as_i64())
            .fetch_optional(&mut **tx)
            .await?;
        row.as_ref().map(Self::row_to_item).transpose()
    }

    /// Claims the dedup row for a reserve. Returns the existing record when
    /// the order already has one.
    async fn claim_reservation(
        tx: &mut Transaction<'_, Postgres>,
        order_id: OrderId,
        sku: Sku,
        state: ReservationState,
    ) -> Result<Option<Reservation>> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO reservations (order_id, sku, state)
            VALUES ($1, $2, $3)
            ON CONFLICT (order_id) DO NOTHING
            "#,
        )
        .bind(order_id.as_uuid())
        .bind(sku.as_i64())
        .bind(state.as_str())
        .execute(&mut **tx)
        .await?
        .rows_affected();

        if inserted == 1 {
            return Ok(None);
        }

        let row = sqlx::query("SELECT sku, state FROM reservations WHERE order_id = $1 FOR UPDATE")
            .bind(order_id.as_uuid())
            .fetch_one(&mut **tx)
            .await?;
        let stored: String = row.try_get("state")?;
        Ok(Some(Reservation {
            order_id,
            sku: Sku::new(row.try_get("sku")?),
            state: stored.parse()?,
        }))
    }

    async fn claim_debit(
        tx: &mut Transaction<'_, Postgres>,
        order_id: OrderId,
        user_id: UserId,
        amount: Money,
        state: DebitState,
    ) -> Result<Option<Debit>> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO debits (order_id, user_id, amount, state)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (order_id) DO NOTHING
            "#,
        )
        .bind(order_id.as_uuid())
        .bind(user_id.as_i64())
        .bind(amount.cents())
        .bind(state.as_str())
        .execute(&mut **tx)
        .await?
        .rows_affected();

        if inserted == 1 {
            return Ok(None);
        }

        let row = sqlx::query(
            "SELECT user_id, amount, state FROM debits WHERE order_id = $1 FOR UPDATE",
        )
        .bind(order_id.as_uuid())
        .fetch_one(&mut **tx)
        .await?;
        let stored: String = row.try_get("state")?;
        Ok(Some(Debit {
            order_id,
            user_id: UserId::new(row.try_get("user_id")?),
            amount: Money::from_cents(row.try_get("amount")?),
            state: stored.parse()?,
        }))
    }
}

#[async_trait]
impl StockStore for PostgresStore {
    async fn upsert(&self, item: StockItem) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO stock (sku, name, price, count, kind)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (sku) DO UPDATE
            SET name = EXCLUDED.name, price = EXCLUDED.price,
                count = EXCLUDED.count, kind = EXCLUDED.kind
            "#,
        )
        .bind(item.sku.as_i64())
        .bind(&item.name)
        .bind(item.price.cents())
        .bind(item.count)
        .bind(item.kind.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, sku: Sku) -> Result<Option<StockItem>> {
        let row = sqlx::query("SELECT sku, name, price, count, kind FROM stock WHERE sku = $1")
            .bind(sku.as_i64())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_item).transpose()
    }

    async fn list(&self) -> Result<Vec<StockItem>> {
        let rows = sqlx::query("SELECT sku, name, price, count, kind FROM stock ORDER BY sku ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_item).collect()
    }

    #[tracing::instrument(skip_all, fields(%order_id, %sku))]
    async fn reserve(&self, order_id: OrderId, sku: Sku) -> Result<ReserveOutcome> {
        let mut tx = self.pool.begin().await?;

        if let Some(existing) =
            Self::claim_reservation(&mut tx, order_id, sku, ReservationState::Reserved).await?
        {
            let item = Self::item_in_tx(&mut tx, existing.sku)
                .await?
                .map(|i| i.snapshot());
            tx.commit().await?;
            return Ok(ReserveOutcome::Replayed {
                state: existing.state,
                item,
            });
        }

        let taken = sqlx::query(
            r#"
            UPDATE stock SET count = count - 1
            WHERE sku = $1 AND count > 0
            RETURNING sku, name, price, count, kind
            "#,
        )
        .bind(sku.as_i64())
        .fetch_optional(&mut *tx)
        .await?;

        let outcome = match taken {
            Some(row) => {
                let item = Self::row_to_item(&row)?;
                ReserveOutcome::Reserved {
                    item: item.snapshot(),
                    remaining: item.count,
                }
            }
            None => {
                let outcome = match Self::item_in_tx(&mut tx, sku).await? {
                    Some(item) => ReserveOutcome::Unavailable {
                        item: item.snapshot(),
                    },
                    None => ReserveOutcome::UnknownSku,
                };
                sqlx::query("UPDATE reservations SET state = $2 WHERE order_id = $1")
                    .bind(order_id.as_uuid())
                    .bind(ReservationState::Rejected.as_str())
                    .execute(&mut *tx)
                    .await?;
                outcome
            }
        };

        tx.commit().await?;
        Ok(outcome)
    }

    #[tracing::instrument(skip_all, fields(%order_id, %sku))]
    async fn release(&self, order_id: OrderId, sku: Sku) -> Result<ReleaseOutcome> {
        let mut tx = self.pool.begin().await?;

        let Some(existing) =
            Self::claim_reservation(&mut tx, order_id, sku, ReservationState::Released).await?
        else {
            tx.commit().await?;
            return Ok(ReleaseOutcome::Tombstoned);
        };

        let outcome = match existing.state {
            ReservationState::Released => ReleaseOutcome::AlreadyReleased,
            ReservationState::Rejected => ReleaseOutcome::NothingReserved,
            ReservationState::Reserved => {
                sqlx::query("UPDATE reservations SET state = $2 WHERE order_id = $1")
                    .bind(order_id.as_uuid())
                    .bind(ReservationState::Released.as_str())
                    .execute(&mut *tx)
                    .await?;
                let count: Option<i64> = sqlx::query_scalar(
                    "UPDATE stock SET count = count + 1 WHERE sku = $1 RETURNING count",
                )
                .bind(existing.sku.as_i64())
                .fetch_optional(&mut *tx)
                .await?;
                ReleaseOutcome::Released {
                    count: count.unwrap_or(0),
                }
            }
        };

        tx.commit().await?;
        Ok(outcome)
    }

    async fn reservation(&self, order_id: OrderId) -> Result<Option<Reservation>> {
        let row = sqlx::query("SELECT sku, state FROM reservations WHERE order_id = $1")
            .bind(order_id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let state: String = row.try_get("state")?;
                Ok(Some(Reservation {
                    order_id,
                    sku: Sku::new(row.try_get("sku")?),
                    state: state.parse()?,
                }))
            }
            None => Ok(None),
        }
    }
}

#[async_trait]
impl BalanceStore for PostgresStore {
    async fn set(&self, balance: Balance) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO balances (user_id, amount) VALUES ($1, $2)
            ON CONFLICT (user_id) DO UPDATE SET amount = EXCLUDED.amount
            "#,
        )
        .bind(balance.user_id.as_i64())
        .bind(balance.amount.cents())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, user_id: UserId) -> Result<Option<Balance>> {
        let amount: Option<i64> =
            sqlx::query_scalar("SELECT amount FROM balances WHERE user_id = $1")
                .bind(user_id.as_i64())
                .fetch_optional(&self.pool)
                .await?;
        Ok(amount.map(|cents| Balance::new(user_id, Money::from_cents(cents))))
    }

    #[tracing::instrument(skip_all, fields(%order_id, %user_id, %amount))]
    async fn debit(
        &self,
        order_id: OrderId,
        user_id: UserId,
        amount: Money,
    ) -> Result<DebitOutcome> {
        let mut tx = self.pool.begin().await?;

        if let Some(existing) =
            Self::claim_debit(&mut tx, order_id, user_id, amount, DebitState::Debited).await?
        {
            tx.commit().await?;
            return Ok(DebitOutcome::Replayed {
                state: existing.state,
            });
        }

        let remaining: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE balances SET amount = amount - $2
            WHERE user_id = $1 AND amount >= $2
            RETURNING amount
            "#,
        )
        .bind(user_id.as_i64())
        .bind(amount.cents())
        .fetch_optional(&mut *tx)
        .await?;

        let outcome = match remaining {
            Some(cents) => DebitOutcome::Sufficient {
                remaining: Money::from_cents(cents),
            },
            None => {
                sqlx::query("UPDATE debits SET state = $2 WHERE order_id = $1")
                    .bind(order_id.as_uuid())
                    .bind(DebitState::Rejected.as_str())
                    .execute(&mut *tx)
                    .await?;
                DebitOutcome::Insufficient
            }
        };

        tx.commit().await?;
        Ok(outcome)
    }

    #[tracing::instrument(skip_all, fields(%order_id, %user_id, %amount))]
    async fn credit(
        &self,
        order_id: OrderId,
        user_id: UserId,
        amount: Money,
    ) -> Result<CreditOutcome> {
        let mut tx = self.pool.begin().await?;

        let Some(existing) =
            Self::claim_debit(&mut tx, order_id, user_id, amount, DebitState::Credited).await?
        else {
            tx.commit().await?;
            return Ok(CreditOutcome::Tombstoned);
        };

        let outcome = match existing.state {
            DebitState::Credited => CreditOutcome::AlreadyCredited,
            DebitState::Rejected => CreditOutcome::NothingDebited,
            DebitState::Debited => {
                sqlx::query("UPDATE debits SET state = $2 WHERE order_id = $1")
                    .bind(order_id.as_uuid())
                    .bind(DebitState::Credited.as_str())
                    .execute(&mut *tx)
                    .await?;
                let balance: i64 = sqlx::query_scalar(
                    r#"
                    INSERT INTO balances (user_id, amount) VALUES ($1, $2)
                    ON CONFLICT (user_id) DO UPDATE SET amount = balances.amount + EXCLUDED.amount
                    RETURNING amount
                    "#,
                )
                .bind(existing.user_id.as_i64())
                .bind(existing.amount.cents())
                .fetch_one(&mut *tx)
                .await?;
                CreditOutcome::Credited {
                    balance: Money::from_cents(balance),
                }
            }
        };

        tx.commit().await?;
        Ok(outcome)
    }

    async fn debit_record(&self, order_id: OrderId) -> Result<Option<Debit>> {
        let row = sqlx::query("SELECT user_id, amount, state FROM debits WHERE order_id = $1")
            .bind(order_id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let state: String = row.try_get("state")?;
                Ok(Some(Debit {
                    order_id,
                    user_id: UserId::new(row.try_get("user_id")?),
                    amount: Money::from_cents(row.try_get("amount")?),
                    state: state.parse()?,
                }))
            }
            None => Ok(None),
        }
    }
}

#[async_trait]
impl OrderStore for PostgresStore {
    async fn create(&self, user_id: UserId, sku: Sku) -> Result<Order> {
        let order = Order::new(user_id, sku);
        sqlx::query(
            r#"
            INSERT INTO orders (id, user_id, sku, created_at, updated_at, status, reason)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(order.id.as_uuid())
        .bind(user_id.as_i64())
        .bind(sku.as_i64())
        .bind(order.created_at)
        .bind(order.updated_at)
        .bind(order.status.as_str())
        .bind(&order.reason)
        .execute(&self.pool)
        .await?;
        Ok(order)
    }

    async fn get(&self, order_id: OrderId) -> Result<Option<Order>> {
        let row = sqlx::query(
            r#"
            SELECT id, user_id, sku, created_at, updated_at, status, reason
            FROM orders WHERE id = $1
            "#,
        )
        .bind(order_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::row_to_order).transpose()
    }

    async fn list_by_user(&self, user_id: UserId) -> Result<Vec<Order>> {
        let rows = sqlx::query(
            r#"
            SELECT id, user_id, sku, created_at, updated_at, status, reason
            FROM orders WHERE user_id = $1
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(user_id.as_i64())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_order).collect()
    }

    async fn list_all(&self) -> Result<Vec<Order>> {
        let rows = sqlx::query(
            r#"
            SELECT id, user_id, sku, created_at, updated_at, status, reason
            FROM orders ORDER BY created_at ASC, id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_order).collect()
    }

    #[tracing::instrument(skip_all, fields(%order_id, %next))]
    async fn advance_status(
        &self,
        order_id: OrderId,
        next: OrderStatus,
        reason: Option<&str>,
    ) -> Result<Advance> {
        let allowed: Vec<String> = OrderStatus::predecessors(next)
            .into_iter()
            .map(|s| s.as_str().to_string())
            .collect();

        let updated = sqlx::query(
            r#"
            UPDATE orders
            SET status = $2, reason = COALESCE($3, reason), updated_at = now()
            WHERE id = $1 AND status = ANY($4)
            "#,
        )
        .bind(order_id.as_uuid())
        .bind(next.as_str())
        .bind(reason)
        .bind(&allowed)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 1 {
            return Ok(Advance::Applied);
        }

        let current: Option<String> = sqlx::query_scalar("SELECT status FROM orders WHERE id = $1")
            .bind(order_id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;
        let current: OrderStatus = current
            .ok_or(StoreError::OrderNotFound(order_id))?
            .parse()?;

        if current == next {
            Ok(Advance::AlreadyAt)
        } else {
            Ok(Advance::Rejected { current })
        }
    }

    async fn set_reason(&self, order_id: OrderId, reason: &str) -> Result<()> {
        let updated = sqlx::query("UPDATE orders SET reason = $2, updated_at = now() WHERE id = $1")
            .bind(order_id.as_uuid())
            .bind(reason)
            .execute(&self.pool)
            .await?
            .rows_affected();
        if updated == 0 {
            return Err(StoreError::OrderNotFound(order_id));
        }
        Ok(())
    }
}

#[async_trait]
impl SagaStore for PostgresStore {
    async fn load(&self, order_id: OrderId) -> Result<Option<SagaContext>> {
        let row = sqlx::query(
            r#"
            SELECT order_id, user_id, sku, state, item, correlation_id, deadline,
                   attempts, version, reason, updated_at
            FROM saga_contexts WHERE order_id = $1
            "#,
        )
        .bind(order_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::row_to_context).transpose()
    }

    #[tracing::instrument(
        skip_all,
        fields(order_id = %ctx.order.order_id, version = ctx.version)
    )]
    async fn save(&self, ctx: &SagaContext) -> Result<bool> {
        let item = ctx.item.as_ref().map(serde_json::to_value).transpose()?;

        if ctx.version == 1 {
            let inserted = sqlx::query(
                r#"
                INSERT INTO saga_contexts (order_id, user_id, sku, state, item, correlation_id,
                                           deadline, attempts, version, reason, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                ON CONFLICT (order_id) DO NOTHING
                "#,
            )
            .bind(ctx.order.order_id.as_uuid())
            .bind(ctx.order.user_id.as_i64())
            .bind(ctx.order.sku.as_i64())
            .bind(ctx.state.as_str())
            .bind(item)
            .bind(ctx.correlation_id.as_uuid())
            .bind(ctx.deadline)
            .bind(ctx.attempts as i32)
            .bind(ctx.version as i64)
            .bind(ctx.reason.as_deref())
            .bind(ctx.updated_at)
            .execute(&self.pool)
            .await?
            .rows_affected();
            if inserted == 0 {
                return Err(StoreError::AlreadyExists(ctx.order_id()));
            }
            return Ok(true);
        }

        let updated = sqlx::query(
            r#"
            UPDATE saga_contexts
            SET state = $2, item = $3, correlation_id = $4, deadline = $5, attempts = $6,
                version = $7, reason = $8, updated_at = $9
            WHERE order_id = $1 AND version = $7 - 1
            "#,
        )
        .bind(ctx.order.order_id.as_uuid())
        .bind(ctx.state.as_str())
        .bind(item)
        .bind(ctx.correlation_id.as_uuid())
        .bind(ctx.deadline)
        .bind(ctx.attempts as i32)
        .bind(ctx.version as i64)
        .bind(ctx.reason.as_deref())
        .bind(ctx.updated_at)
        .execute(&self.pool)
        .await?
        .rows_affected();
        if updated == 0 {
            tracing::debug!("stale saga context version");
            metrics::counter!("store_version_conflicts_total").increment(1);
        }
        Ok(updated == 1)
    }

    async fn list_expired(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<SagaContext>> {
        let terminal: Vec<String> = OrderStatus::ALL
            .into_iter()
            .filter(OrderStatus::is_terminal)
            .map(|s| s.as_str().to_string())
            .collect();
        let rows = sqlx::query(
            r#"
            SELECT order_id, user_id, sku, state, item, correlation_id, deadline,
                   attempts, version, reason, updated_at
            FROM saga_contexts
            WHERE deadline IS NOT NULL AND deadline <= $1 AND state <> ALL($2)
            ORDER BY deadline ASC
            LIMIT $3
            "#,
        )
        .bind(now)
        .bind(&terminal)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_context).collect()
    }
}

#[async_trait]
impl ProfileStore for PostgresStore {
    async fn upsert(&self, profile: Profile) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO profiles (user_id, name, status, updated_at) VALUES ($1, $2, $3, $4)
            ON CONFLICT (user_id) DO UPDATE
            SET name = EXCLUDED.name, status = EXCLUDED.status, updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(profile.user_id.as_i64())
        .bind(&profile.name)
        .bind(&profile.status)
        .bind(profile.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, user_id: UserId) -> Result<Option<Profile>> {
        let row =
            sqlx::query("SELECT user_id, name, status, updated_at FROM profiles WHERE user_id = $1")
                .bind(user_id.as_i64())
                .fetch_optional(&self.pool)
                .await?;
        row.as_ref().map(Self::row_to_profile).transpose()
    }

    async fn set_status(&self, user_id: UserId, status: &str) -> Result<Option<Profile>> {
        let row = sqlx::query(
            r#"
            UPDATE profiles SET status = $2, updated_at = now()
            WHERE user_id = $1
            RETURNING user_id, name, status, updated_at
            "#,
        )
        .bind(user_id.as_i64())
        .bind(status)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::row_to_profile).transpose()
    }
}
