//! Property tests: resources never go negative and are conserved under any
//! interleaving of forward commands, compensations and duplicates.

use common::{OrderId, Sku, UserId};
use domain::{Balance, Money, StockItem};
use proptest::prelude::*;
use resource_store::{
    BalanceStore, DebitState, InMemoryBalanceStore, InMemoryStockStore, ReservationState,
    StockStore,
};

#[derive(Debug, Clone)]
enum StockOp {
    Reserve(usize),
    Release(usize),
}

#[derive(Debug, Clone)]
enum BalanceOp {
    Debit(usize, i64),
    Credit(usize, i64),
}

fn stock_op() -> impl Strategy<Value = StockOp> {
    prop_oneof![
        (0..6usize).prop_map(StockOp::Reserve),
        (0..6usize).prop_map(StockOp::Release),
    ]
}

fn balance_op() -> impl Strategy<Value = BalanceOp> {
    prop_oneof![
        (0..6usize, 1..60i64).prop_map(|(o, a)| BalanceOp::Debit(o, a)),
        (0..6usize, 1..60i64).prop_map(|(o, a)| BalanceOp::Credit(o, a)),
    ]
}

fn runtime() -> tokio::runtime::Runtime {
    match tokio::runtime::Builder::new_current_thread().build() {
        Ok(rt) => rt,
        Err(e) => panic!("runtime creation should succeed: {e}"),
    }
}

proptest! {
    #[test]
    fn prop_stock_never_negative_and_conserved(
        initial in 0..4i64,
        ops in prop::collection::vec(stock_op(), 1..40),
    ) {
        let rt = runtime();
        let orders: Vec<OrderId> = (0..6).map(|_| OrderId::new()).collect();
        let sku = Sku::new(1);

        let (count, held) = rt.block_on(async {
            let store = InMemoryStockStore::with_items([
                StockItem::new(sku, "widget", Money::from_cents(25), initial),
            ])
            .await;

            for op in &ops {
                match op {
                    StockOp::Reserve(i) => { store.reserve(orders[*i], sku).await.unwrap(); }
                    StockOp::Release(i) => { store.release(orders[*i], sku).await.unwrap(); }
                }
                let count = store.count(sku).await.unwrap();
                assert!(count >= 0, "count went negative: {count}");
            }

            let mut held = 0;
            for order in &orders {
                if let Some(r) = store.reservation(*order).await.unwrap()
                    && r.state == ReservationState::Reserved
                {
                    held += 1;
                }
            }
            (store.count(sku).await.unwrap(), held)
        });

        prop_assert!(count >= 0);
        prop_assert_eq!(count + held, initial);
    }

    #[test]
    fn prop_balance_never_negative_and_conserved(
        initial in 0..120i64,
        ops in prop::collection::vec(balance_op(), 1..40),
    ) {
        let rt = runtime();
        let orders: Vec<OrderId> = (0..6).map(|_| OrderId::new()).collect();
        let user = UserId::new(1);

        let (amount, debited) = rt.block_on(async {
            let store = InMemoryBalanceStore::with_balances([
                Balance::new(user, Money::from_cents(initial)),
            ])
            .await;

            for op in &ops {
                match op {
                    BalanceOp::Debit(i, a) => {
                        store.debit(orders[*i], user, Money::from_cents(*a)).await.unwrap();
                    }
                    BalanceOp::Credit(i, a) => {
                        store.credit(orders[*i], user, Money::from_cents(*a)).await.unwrap();
                    }
                }
                let amount = store.amount(user).await.unwrap();
                assert!(!amount.is_negative(), "balance went negative: {amount}");
            }

            let mut debited = 0;
            for order in &orders {
                if let Some(d) = store.debit_record(*order).await.unwrap()
                    && d.state == DebitState::Debited
                {
                    debited += d.amount.cents();
                }
            }
            (store.amount(user).await.unwrap(), debited)
        });

        prop_assert!(!amount.is_negative());
        prop_assert_eq!(amount.cents() + debited, initial);
    }
}
