//! Saga node.
//!
//! Runs the whole saga in one process: the in-process bus, the orchestrator,
//! the stock, balance and ledger services, and the reconciliation sweep.
//! An ops HTTP server exposes `/health` and Prometheus `/metrics`.

pub mod config;
pub mod routes;

use std::sync::Arc;

use axum::Router;
use axum::routing::get;
use metrics_exporter_prometheus::PrometheusHandle;
use resource_store::{
    InMemoryBalanceStore, InMemoryOrderStore, InMemoryProfileCache, InMemoryProfileStore,
    InMemorySagaStore, InMemoryStockStore, PostgresStore,
};
use saga::Stores;
use sqlx::postgres::PgPoolOptions;
use tower_http::trace::TraceLayer;

/// Where the node keeps its state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Memory,
    Postgres,
}

impl Backend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::Memory => "memory",
            Backend::Postgres => "postgres",
        }
    }
}

/// Static facts about the running node, reported by `/health`.
#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub backend: Backend,
    pub partitions: u32,
    pub workers_per_topic: usize,
}

/// Creates the ops router.
pub fn create_app(node: Arc<NodeInfo>, metrics_handle: PrometheusHandle) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::health))
        .with_state(node)
        .merge(metrics_router)
        .layer(TraceLayer::new_for_http())
}

/// Stores kept in process memory.
pub fn in_memory_stores() -> Stores {
    Stores {
        stock: Arc::new(InMemoryStockStore::new()),
        balances: Arc::new(InMemoryBalanceStore::new()),
        orders: Arc::new(InMemoryOrderStore::new()),
        sagas: Arc::new(InMemorySagaStore::new()),
        profiles: Arc::new(InMemoryProfileStore::new()),
        cache: Arc::new(InMemoryProfileCache::new()),
    }
}

/// Stores backed by PostgreSQL. The profile cache stays in memory.
pub async fn postgres_stores(database_url: &str) -> Result<Stores, sqlx::Error> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await?;
    Ok(Stores::postgres(
        PostgresStore::new(pool),
        Arc::new(InMemoryProfileCache::new()),
    ))
}
