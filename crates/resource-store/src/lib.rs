//! Storage owned by the saga's services.
//!
//! Each resource has one trait and two backends: an in-memory one used by
//! tests and single-process runs, and PostgreSQL via `sqlx`.

pub mod error;
pub mod memory;
pub mod postgres;
pub mod store;

pub use error::{Result, StoreError};
pub use memory::{
    InMemoryBalanceStore, InMemoryOrderStore, InMemoryProfileCache, InMemoryProfileStore,
    InMemorySagaStore, InMemoryStockStore,
};
pub use postgres::PostgresStore;
pub use store::{
    Advance, BalanceStore, CreditOutcome, Debit, DebitOutcome, DebitState, OrderStore,
    ProfileCache, ProfileCacheExt, ProfileStore, ReleaseOutcome, Reservation, ReservationState,
    ReserveOutcome, SagaStore, StockStore,
};
