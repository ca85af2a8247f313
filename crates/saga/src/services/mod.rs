//! The downstream services: each consumes its command topics and owns its
//! store.

pub mod balance;
pub mod ledger;
pub mod stock;

pub use balance::BalanceService;
pub use ledger::{LedgerService, resubmit, submit_order};
pub use stock::StockService;
