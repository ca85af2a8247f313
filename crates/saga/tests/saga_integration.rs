//! End-to-end saga runs over the in-memory bus and stores.

use std::sync::Arc;
use std::time::Duration;

use common::{OrderId, Sku, UserId};
use domain::{Balance, Money, Order, OrderRef, OrderStatus, Profile, StockItem};
use message_bus::{DEAD_LETTER_TOPIC, DeadLetter, InMemoryBus, Publisher, decode, encode};
use resource_store::{
    BalanceStore, InMemoryBalanceStore, InMemoryOrderStore, InMemoryProfileCache,
    InMemoryProfileStore, InMemorySagaStore, InMemoryStockStore, OrderStore, ProfileCacheExt,
    ProfileStore, SagaStore,
};
use saga::messages::{DebitBalance, StockChecked};
use saga::runtime::{BALANCE_GROUP, LEDGER_GROUP, ORCHESTRATOR_GROUP, STOCK_GROUP};
use saga::{Reconciler, SagaRuntime, SagaSettings, Stores, submit_order, topics};

const ALICE: i64 = 1;
const BOB: i64 = 2;
const WIDGET: i64 = 10;
const GOLD: i64 = 20;

const SUBSCRIPTIONS: [(&str, &str); 9] = [
    (topics::ORDER_CREATED, ORCHESTRATOR_GROUP),
    (topics::STOCK_CHECKED, ORCHESTRATOR_GROUP),
    (topics::BALANCE_CHECKED, ORCHESTRATOR_GROUP),
    (topics::STOCK_RESERVE, STOCK_GROUP),
    (topics::STOCK_RELEASE, STOCK_GROUP),
    (topics::BALANCE_DEBIT, BALANCE_GROUP),
    (topics::BALANCE_CREDIT, BALANCE_GROUP),
    (topics::ORDER_COMMITTED, LEDGER_GROUP),
    (topics::ORDER_CANCELLED, LEDGER_GROUP),
];

fn settings() -> SagaSettings {
    SagaSettings {
        workers_per_topic: 2,
        sweep_interval: Duration::from_secs(3600),
        retry_base: Duration::from_millis(1),
        retry_cap: Duration::from_millis(10),
        ..SagaSettings::default()
    }
}

struct TestHarness {
    bus: InMemoryBus,
    stock: InMemoryStockStore,
    balances: InMemoryBalanceStore,
    orders: InMemoryOrderStore,
    sagas: InMemorySagaStore,
    profiles: InMemoryProfileStore,
    cache: InMemoryProfileCache,
    settings: SagaSettings,
    runtime: SagaRuntime,
}

impl TestHarness {
    async fn start(items: Vec<StockItem>, balances: Vec<Balance>) -> Self {
        Self::start_with(items, balances, settings()).await
    }

    async fn start_with(
        items: Vec<StockItem>,
        balances: Vec<Balance>,
        settings: SagaSettings,
    ) -> Self {
        let bus = InMemoryBus::new(8);
        let stock = InMemoryStockStore::with_items(items).await;
        let balance_store = InMemoryBalanceStore::with_balances(balances).await;
        let orders = InMemoryOrderStore::new();
        let sagas = InMemorySagaStore::new();
        let profiles = InMemoryProfileStore::new();
        let cache = InMemoryProfileCache::new();

        let stores = Stores {
            stock: Arc::new(stock.clone()),
            balances: Arc::new(balance_store.clone()),
            orders: Arc::new(orders.clone()),
            sagas: Arc::new(sagas.clone()),
            profiles: Arc::new(profiles.clone()),
            cache: Arc::new(cache.clone()),
        };
        let runtime = SagaRuntime::start(Arc::new(bus.clone()), stores, settings.clone())
            .await
            .unwrap();

        Self {
            bus,
            stock,
            balances: balance_store,
            orders,
            sagas,
            profiles,
            cache,
            settings,
            runtime,
        }
    }

    async fn submit(&self, user: i64, sku: i64) -> OrderId {
        submit_order(&self.orders, &self.bus, UserId::new(user), Sku::new(sku))
            .await
            .unwrap()
            .id
    }

    /// Waits until no group has anything left to consume. Handlers publish
    /// before they ack, so an empty backlog means the system is at rest.
    async fn settle(&self) {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let mut lag = 0;
                for (topic, group) in SUBSCRIPTIONS {
                    lag += self.bus.lag(topic, group).await;
                }
                if lag == 0 {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("saga did not settle");
    }

    async fn finished(&self, order_id: OrderId) -> Order {
        self.settle().await;
        let order = self.orders.get(order_id).await.unwrap().unwrap();
        assert!(order.status.is_terminal(), "order stuck in {}", order.status);
        order
    }

    async fn wait_for_state(&self, order_id: OrderId, state: OrderStatus) {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                if let Some(ctx) = self.sagas.load(order_id).await.unwrap()
                    && ctx.state == state
                {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("saga never reached the expected state");
    }

    async fn count(&self, sku: i64) -> i64 {
        self.stock.count(Sku::new(sku)).await.unwrap()
    }

    async fn balance(&self, user: i64) -> i64 {
        self.balances
            .amount(UserId::new(user))
            .await
            .unwrap()
            .cents()
    }

    async fn count_for(&self, topic: &str, order_id: OrderId) -> usize {
        self.bus.records_for_key(topic, &order_id.key()).await.len()
    }
}

fn widget(count: i64) -> StockItem {
    StockItem::new(Sku::new(WIDGET), "widget", Money::from_cents(25), count)
}

fn balance(user: i64, cents: i64) -> Balance {
    Balance::new(UserId::new(user), Money::from_cents(cents))
}

#[tokio::test]
async fn test_happy_path_commits() {
    let h = TestHarness::start(vec![widget(5)], vec![balance(ALICE, 100)]).await;

    let order_id = h.submit(ALICE, WIDGET).await;
    let order = h.finished(order_id).await;

    assert_eq!(order.status, OrderStatus::Committed);
    assert_eq!(order.reason, "paid");
    assert_eq!(h.count(WIDGET).await, 4);
    assert_eq!(h.balance(ALICE).await, 75);
    assert_eq!(h.count_for(topics::ORDER_COMMITTED, order_id).await, 1);
    assert_eq!(h.count_for(topics::STOCK_RELEASE, order_id).await, 0);

    h.runtime.shutdown().await;
}

#[tokio::test]
async fn test_out_of_stock_cancels() {
    let h = TestHarness::start(vec![widget(0)], vec![balance(ALICE, 100)]).await;

    let order_id = h.submit(ALICE, WIDGET).await;
    let order = h.finished(order_id).await;

    assert_eq!(order.status, OrderStatus::Cancelled);
    assert_eq!(order.reason, "out of stock");
    assert_eq!(h.count(WIDGET).await, 0);
    assert_eq!(h.balance(ALICE).await, 100);
    assert_eq!(h.count_for(topics::BALANCE_DEBIT, order_id).await, 0);

    h.runtime.shutdown().await;
}

#[tokio::test]
async fn test_unknown_product_cancels() {
    let h = TestHarness::start(vec![widget(1)], vec![balance(ALICE, 100)]).await;

    let order_id = h.submit(ALICE, 999).await;
    let order = h.finished(order_id).await;

    assert_eq!(order.status, OrderStatus::Cancelled);
    assert_eq!(order.reason, "unknown product");
    assert_eq!(h.count(WIDGET).await, 1);

    h.runtime.shutdown().await;
}

#[tokio::test]
async fn test_insufficient_funds_releases_stock() {
    let item = StockItem::new(Sku::new(WIDGET), "widget", Money::from_cents(50), 3);
    let h = TestHarness::start(vec![item], vec![balance(ALICE, 10)]).await;

    let order_id = h.submit(ALICE, WIDGET).await;
    let order = h.finished(order_id).await;

    assert_eq!(order.status, OrderStatus::Cancelled);
    assert_eq!(order.reason, "insufficient funds");
    assert_eq!(h.count(WIDGET).await, 3);
    assert_eq!(h.balance(ALICE).await, 10);
    assert_eq!(h.count_for(topics::STOCK_RELEASE, order_id).await, 1);

    h.runtime.shutdown().await;
}

#[tokio::test]
async fn test_duplicate_stock_reply_is_dropped() {
    let h = TestHarness::start(vec![widget(5)], vec![balance(ALICE, 100)]).await;
    h.balances.set_fail_on_debit(true);

    let order_id = h.submit(ALICE, WIDGET).await;
    h.wait_for_state(order_id, OrderStatus::CheckingBalance)
        .await;

    let replies = h
        .bus
        .records_for_key(topics::STOCK_CHECKED, &order_id.key())
        .await;
    let reply: StockChecked = decode(&replies[0].payload).unwrap();
    assert!(reply.available);
    h.bus
        .publish(topics::STOCK_CHECKED, &order_id.key(), encode(&reply).unwrap())
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(10), async {
        while h.bus.lag(topics::STOCK_CHECKED, ORCHESTRATOR_GROUP).await > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(h.count_for(topics::BALANCE_DEBIT, order_id).await, 1);

    h.balances.set_fail_on_debit(false);
    let order = h.finished(order_id).await;
    assert_eq!(order.status, OrderStatus::Committed);
    assert_eq!(h.count(WIDGET).await, 4);
    assert_eq!(h.balance(ALICE).await, 75);

    h.runtime.shutdown().await;
}

#[tokio::test]
async fn test_two_orders_race_for_last_unit() {
    let h = TestHarness::start(
        vec![widget(1)],
        vec![balance(ALICE, 100), balance(BOB, 100)],
    )
    .await;

    let (a, b) = tokio::join!(h.submit(ALICE, WIDGET), h.submit(BOB, WIDGET));
    let a = h.finished(a).await;
    let b = h.finished(b).await;

    let mut statuses = [a.status, b.status];
    statuses.sort_by_key(|s| s.as_str());
    assert_eq!(statuses, [OrderStatus::Cancelled, OrderStatus::Committed]);
    assert_eq!(h.count(WIDGET).await, 0);
    assert_eq!(h.balance(ALICE).await + h.balance(BOB).await, 175);

    let loser = if a.status == OrderStatus::Cancelled { a } else { b };
    assert_eq!(loser.reason, "out of stock");

    h.runtime.shutdown().await;
}

#[tokio::test]
async fn test_many_orders_settle_independently() {
    let users: Vec<i64> = (100..120).collect();
    let h = TestHarness::start(
        vec![widget(10)],
        users.iter().map(|u| balance(*u, 25)).collect(),
    )
    .await;

    let mut ids = Vec::new();
    for user in &users {
        ids.push(h.submit(*user, WIDGET).await);
    }
    h.settle().await;

    let mut committed = 0;
    for id in ids {
        let order = h.finished(id).await;
        if order.status == OrderStatus::Committed {
            committed += 1;
        } else {
            assert_eq!(order.reason, "out of stock");
        }
    }
    assert_eq!(committed, 10);
    assert_eq!(h.count(WIDGET).await, 0);

    h.runtime.shutdown().await;
}

#[tokio::test]
async fn test_replayed_commands_change_nothing() {
    let h = TestHarness::start(vec![widget(5)], vec![balance(ALICE, 100)]).await;
    let order_id = h.submit(ALICE, WIDGET).await;
    h.finished(order_id).await;
    let ctx = h.sagas.load(order_id).await.unwrap();

    for topic in [
        topics::ORDER_CREATED,
        topics::STOCK_RESERVE,
        topics::BALANCE_DEBIT,
    ] {
        for record in h.bus.records_for_key(topic, &order_id.key()).await {
            h.bus
                .publish(topic, &record.key, record.payload)
                .await
                .unwrap();
        }
    }
    let order = h.finished(order_id).await;

    assert_eq!(order.status, OrderStatus::Committed);
    assert_eq!(h.count(WIDGET).await, 4);
    assert_eq!(h.balance(ALICE).await, 75);
    assert_eq!(h.sagas.load(order_id).await.unwrap(), ctx);
    assert_eq!(h.count_for(topics::ORDER_COMMITTED, order_id).await, 1);
    assert_eq!(h.count_for(topics::STOCK_RELEASE, order_id).await, 0);

    h.runtime.shutdown().await;
}

#[tokio::test]
async fn test_replayed_release_restores_once() {
    let item = StockItem::new(Sku::new(WIDGET), "widget", Money::from_cents(50), 3);
    let h = TestHarness::start(vec![item], vec![balance(ALICE, 10)]).await;
    let order_id = h.submit(ALICE, WIDGET).await;
    h.finished(order_id).await;

    for record in h
        .bus
        .records_for_key(topics::STOCK_RELEASE, &order_id.key())
        .await
    {
        for _ in 0..3 {
            h.bus
                .publish(topics::STOCK_RELEASE, &record.key, record.payload.clone())
                .await
                .unwrap();
        }
    }
    h.settle().await;

    assert_eq!(h.count(WIDGET).await, 3);

    h.runtime.shutdown().await;
}

#[tokio::test]
async fn test_transient_store_failures_are_retried() {
    let h = TestHarness::start(vec![widget(5)], vec![balance(ALICE, 100)]).await;
    h.stock.set_fail_on_reserve(true);
    h.orders.set_fail_on_advance(true);

    let order_id = h.submit(ALICE, WIDGET).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    h.orders.set_fail_on_advance(false);
    tokio::time::sleep(Duration::from_millis(50)).await;
    h.stock.set_fail_on_reserve(false);

    let order = h.finished(order_id).await;
    assert_eq!(order.status, OrderStatus::Committed);
    assert_eq!(h.count(WIDGET).await, 4);
    assert_eq!(h.balance(ALICE).await, 75);
    assert!(h.bus.records(DEAD_LETTER_TOPIC).await.is_empty());

    h.runtime.shutdown().await;
}

#[tokio::test]
async fn test_status_purchase_refreshes_profile_cache() {
    let gold = StockItem::new(Sku::new(GOLD), "gold", Money::from_cents(30), 1).as_status();
    let h = TestHarness::start(vec![gold], vec![balance(ALICE, 100)]).await;
    h.profiles
        .upsert(Profile::new(UserId::new(ALICE), "alice"))
        .await
        .unwrap();

    let order_id = h.submit(ALICE, GOLD).await;
    let order = h.finished(order_id).await;
    assert_eq!(order.status, OrderStatus::Committed);

    let profile = h.profiles.get(UserId::new(ALICE)).await.unwrap().unwrap();
    assert_eq!(profile.status, "gold");
    let cached = h
        .cache
        .get_profile(UserId::new(ALICE))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(cached, profile);

    h.runtime.shutdown().await;
}

#[tokio::test]
async fn test_goods_purchase_leaves_cache_alone() {
    let h = TestHarness::start(vec![widget(5)], vec![balance(ALICE, 100)]).await;
    h.profiles
        .upsert(Profile::new(UserId::new(ALICE), "alice"))
        .await
        .unwrap();

    let order_id = h.submit(ALICE, WIDGET).await;
    h.finished(order_id).await;

    assert!(
        h.cache
            .get_profile(UserId::new(ALICE))
            .await
            .unwrap()
            .is_none()
    );

    h.runtime.shutdown().await;
}

#[tokio::test]
async fn test_malformed_message_is_dead_lettered() {
    let h = TestHarness::start(vec![widget(5)], vec![]).await;

    h.bus
        .publish(topics::STOCK_CHECKED, "garbage", vec![0xff; 3])
        .await
        .unwrap();
    h.settle().await;

    let letters = h.bus.records(DEAD_LETTER_TOPIC).await;
    assert_eq!(letters.len(), 1);
    let letter: DeadLetter = decode(&letters[0].payload).unwrap();
    assert_eq!(letter.topic, topics::STOCK_CHECKED);
    assert_eq!(letter.payload, vec![0xff; 3]);

    h.runtime.shutdown().await;
}

#[tokio::test]
async fn test_order_missing_from_ledger_is_dead_lettered() {
    let h = TestHarness::start(vec![widget(5)], vec![balance(ALICE, 100)]).await;
    let ghost = OrderRef::new(OrderId::new(), UserId::new(ALICE), Sku::new(WIDGET));

    h.bus
        .publish(
            topics::ORDER_CREATED,
            &ghost.order_id.key(),
            encode(&ghost).unwrap(),
        )
        .await
        .unwrap();
    h.settle().await;

    assert_eq!(h.bus.records(DEAD_LETTER_TOPIC).await.len(), 1);
    assert!(h.bus.records(topics::STOCK_RESERVE).await.is_empty());
    assert_eq!(h.count(WIDGET).await, 5);

    h.runtime.shutdown().await;
}

#[tokio::test]
async fn test_stuck_debit_times_out_and_compensates() {
    let settings = SagaSettings {
        step_timeout: Duration::ZERO,
        max_reissues: 0,
        ..settings()
    };
    let h = TestHarness::start_with(vec![widget(5)], vec![balance(ALICE, 100)], settings).await;
    h.balances.set_fail_on_debit(true);

    let order_id = h.submit(ALICE, WIDGET).await;
    h.wait_for_state(order_id, OrderStatus::CheckingBalance)
        .await;
    assert_eq!(h.count(WIDGET).await, 4);

    let reconciler = Reconciler::new(Arc::clone(h.runtime.orchestrator()), h.settings.clone());
    let report = reconciler.sweep(&h.bus).await.unwrap();
    assert_eq!(report.escalated, 1);

    // Debit and credit may land in either order; the money ends up back.
    h.balances.set_fail_on_debit(false);
    let order = h.finished(order_id).await;

    assert_eq!(order.status, OrderStatus::Cancelled);
    assert_eq!(order.reason, "timed out");
    assert_eq!(h.count(WIDGET).await, 5);
    assert_eq!(h.balance(ALICE).await, 100);
    assert_eq!(h.count_for(topics::BALANCE_CREDIT, order_id).await, 1);

    let debit = h
        .balances
        .debit_record(order_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(debit.state, resource_store::DebitState::Credited);

    let commands: Vec<DebitBalance> = h
        .bus
        .records_for_key(topics::BALANCE_DEBIT, &order_id.key())
        .await
        .iter()
        .map(|r| decode(&r.payload).unwrap())
        .collect();
    assert_eq!(commands.len(), 1);

    h.runtime.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_stops_every_worker() {
    let h = TestHarness::start(vec![widget(5)], vec![balance(ALICE, 100)]).await;
    tokio::time::timeout(Duration::from_secs(5), h.runtime.shutdown())
        .await
        .unwrap();
}
