//! Topic names. Every message on every topic is keyed by order id.

pub const ORDER_CREATED: &str = "order.created";
pub const STOCK_RESERVE: &str = "stock.reserve";
pub const STOCK_CHECKED: &str = "stock.checked";
pub const STOCK_RELEASE: &str = "stock.release";
pub const BALANCE_DEBIT: &str = "balance.debit";
pub const BALANCE_CHECKED: &str = "balance.checked";
pub const BALANCE_CREDIT: &str = "balance.credit";
pub const ORDER_COMMITTED: &str = "order.committed";
pub const ORDER_CANCELLED: &str = "order.cancelled";

pub use message_bus::DEAD_LETTER_TOPIC as DEAD_LETTER;

/// Topics the orchestrator consumes.
pub const ORCHESTRATOR_INPUTS: [&str; 3] = [ORDER_CREATED, STOCK_CHECKED, BALANCE_CHECKED];
