//! Wires the orchestrator, the services and the sweep onto a bus.

use std::sync::Arc;

use message_bus::MessageBus;
use resource_store::{
    BalanceStore, OrderStore, PostgresStore, ProfileCache, ProfileStore, SagaStore, StockStore,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::Result;
use crate::orchestrator::Orchestrator;
use crate::reconcile::Reconciler;
use crate::services::{BalanceService, LedgerService, StockService};
use crate::settings::SagaSettings;
use crate::topics;
use crate::worker::{MessageHandler, WorkerPool};

pub const ORCHESTRATOR_GROUP: &str = "orchestrator";
pub const STOCK_GROUP: &str = "stock-service";
pub const BALANCE_GROUP: &str = "balance-service";
pub const LEDGER_GROUP: &str = "ledger-service";

/// Every store the saga touches.
#[derive(Clone)]
pub struct Stores {
    pub stock: Arc<dyn StockStore>,
    pub balances: Arc<dyn BalanceStore>,
    pub orders: Arc<dyn OrderStore>,
    pub sagas: Arc<dyn SagaStore>,
    pub profiles: Arc<dyn ProfileStore>,
    pub cache: Arc<dyn ProfileCache>,
}

impl Stores {
    /// Everything but the cache backed by one PostgreSQL pool.
    pub fn postgres(store: PostgresStore, cache: Arc<dyn ProfileCache>) -> Self {
        Self {
            stock: Arc::new(store.clone()),
            balances: Arc::new(store.clone()),
            orders: Arc::new(store.clone()),
            sagas: Arc::new(store.clone()),
            profiles: Arc::new(store),
            cache,
        }
    }
}

/// The running saga: one worker pool per (topic, group) and the sweep.
pub struct SagaRuntime {
    orchestrator: Arc<Orchestrator>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl SagaRuntime {
    pub async fn start(
        bus: Arc<dyn MessageBus>,
        stores: Stores,
        settings: SagaSettings,
    ) -> Result<Self> {
        let (shutdown, rx) = watch::channel(false);

        let orchestrator = Arc::new(Orchestrator::new(
            Arc::clone(&stores.orders),
            Arc::clone(&stores.sagas),
            Arc::clone(&stores.profiles),
            Arc::clone(&stores.cache),
            settings.clone(),
        ));
        let stock: Arc<dyn MessageHandler> = Arc::new(StockService::new(stores.stock));
        let balance: Arc<dyn MessageHandler> = Arc::new(BalanceService::new(stores.balances));
        let ledger: Arc<dyn MessageHandler> = Arc::new(LedgerService::new(stores.orders));

        let mut pools = Vec::new();
        for topic in topics::ORCHESTRATOR_INPUTS {
            let handler: Arc<dyn MessageHandler> = orchestrator.clone();
            pools.push(WorkerPool::new(topic, ORCHESTRATOR_GROUP, handler, settings.clone()));
        }
        for topic in [topics::STOCK_RESERVE, topics::STOCK_RELEASE] {
            pools.push(WorkerPool::new(topic, STOCK_GROUP, Arc::clone(&stock), settings.clone()));
        }
        for topic in [topics::BALANCE_DEBIT, topics::BALANCE_CREDIT] {
            pools.push(WorkerPool::new(
                topic,
                BALANCE_GROUP,
                Arc::clone(&balance),
                settings.clone(),
            ));
        }
        for topic in [topics::ORDER_COMMITTED, topics::ORDER_CANCELLED] {
            pools.push(WorkerPool::new(
                topic,
                LEDGER_GROUP,
                Arc::clone(&ledger),
                settings.clone(),
            ));
        }

        let mut tasks = Vec::new();
        for pool in pools {
            tasks.extend(pool.spawn(bus.as_ref(), rx.clone()).await?);
        }

        let reconciler = Reconciler::new(Arc::clone(&orchestrator), settings);
        tasks.push(tokio::spawn(reconciler.run(bus.publisher(), rx)));

        tracing::info!(tasks = tasks.len(), "saga runtime started");
        Ok(Self {
            orchestrator,
            shutdown,
            tasks,
        })
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    /// Stops every worker and the sweep, and waits for them. Messages in
    /// flight are left unacked and come back on the next start.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "saga task panicked");
            }
        }
        tracing::info!("saga runtime stopped");
    }
}
