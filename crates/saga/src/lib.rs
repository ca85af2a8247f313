//! Order saga: orchestration, resource services and the worker runtime.
//!
//! An order moves `Created → ReservingStock → CheckingBalance → Committed`,
//! or to `Cancelled` from any non-terminal step. The [`Orchestrator`] reads
//! step outcomes from the bus and publishes the next command; the
//! [`services`] own stock, balances and the order ledger. Delivery is
//! at-least-once, so:
//!
//! - every service write is idempotent per order and replays its first
//!   outcome on redelivery
//! - every step carries a correlation id, and replies to anything but the
//!   step in flight are dropped
//! - a [`Reconciler`] re-issues or cancels sagas stuck past their deadline
//!
//! [`decide`] is the transition table as a pure function; everything with
//! side effects goes through it.

pub mod decision;
pub mod error;
pub mod locks;
pub mod messages;
pub mod orchestrator;
pub mod reconcile;
pub mod runtime;
pub mod services;
pub mod settings;
pub mod topics;
pub mod worker;

pub use decision::{Decision, DropReason, SweepAction, Transition, decide, decide_expired};
pub use error::{Disposition, Result, SagaError};
pub use locks::OrderLocks;
pub use messages::{Command, SagaEvent};
pub use orchestrator::{Handled, Orchestrator, SweepOutcome};
pub use reconcile::{Reconciler, SweepReport};
pub use runtime::{SagaRuntime, Stores};
pub use services::{BalanceService, LedgerService, StockService, submit_order};
pub use settings::{MAX_STEP_TIMEOUT, SagaSettings};
pub use worker::{MessageHandler, WorkerPool};
