//! The saga's transition table as a pure function.
//!
//! `decide` takes the stored context and one incoming event and returns
//! either the transition to apply or the reason the event is ignored.
//! `decide_expired` does the same for a context whose step deadline has
//! passed. Neither touches a store or the bus; the orchestrator applies the
//! result.

use chrono::{DateTime, Duration, Utc};
use common::CorrelationId;
use domain::{ItemKind, ItemSnapshot, OrderStatus, SagaContext};

use crate::messages::{
    BalanceChecked, Command, CreditBalance, DebitBalance, OrderCancelled, OrderCommitted,
    ReleaseStock, ReserveStock, SagaEvent, StockChecked,
};

pub const REASON_PAID: &str = "paid";
pub const REASON_OUT_OF_STOCK: &str = "out of stock";
pub const REASON_UNKNOWN_PRODUCT: &str = "unknown product";
pub const REASON_INSUFFICIENT_FUNDS: &str = "insufficient funds";
pub const REASON_TIMED_OUT: &str = "timed out";

/// Why an event changes nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DropReason {
    /// The step this event answers has already been applied.
    Duplicate,
    /// The event answers a command that is no longer in flight.
    Stale,
    /// The order already reached `Committed` or `Cancelled`.
    Terminal,
    /// No saga is known for the order.
    UnknownOrder,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::Duplicate => "duplicate",
            DropReason::Stale => "stale",
            DropReason::Terminal => "terminal",
            DropReason::UnknownOrder => "unknown_order",
        }
    }
}

/// Status write for the order ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerUpdate {
    pub status: OrderStatus,
    pub reason: Option<String>,
}

/// Everything one handled event changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    /// Context to persist once everything else is done.
    pub next: SagaContext,
    /// Published in order, keyed by order id.
    pub commands: Vec<Command>,
    /// `None` when the ledger status stays as it is.
    pub ledger: Option<LedgerUpdate>,
    /// Profile status to set before publishing, for purchased status items.
    pub profile_status: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Advance(Transition),
    Drop(DropReason),
}

/// What the sweep does with an expired context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SweepAction {
    /// Send the in-flight command again with the same correlation id.
    Reissue(Transition),
    /// Give up: cancel the order and compensate every step that may have
    /// mutated state.
    Escalate(Transition),
}

impl SweepAction {
    pub fn transition(&self) -> &Transition {
        match self {
            SweepAction::Reissue(t) | SweepAction::Escalate(t) => t,
        }
    }

    pub fn into_transition(self) -> Transition {
        match self {
            SweepAction::Reissue(t) | SweepAction::Escalate(t) => t,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SweepAction::Reissue(_) => "reissue",
            SweepAction::Escalate(_) => "escalate",
        }
    }
}

/// Applies one event to the stored context.
pub fn decide(
    ctx: Option<&SagaContext>,
    event: &SagaEvent,
    now: DateTime<Utc>,
    step_timeout: Duration,
) -> Decision {
    let deadline = deadline_after(now, step_timeout);

    match event {
        SagaEvent::OrderSubmitted(order) => match ctx {
            Some(ctx) if ctx.state.is_terminal() => Decision::Drop(DropReason::Terminal),
            Some(_) => Decision::Drop(DropReason::Duplicate),
            None => {
                let next = SagaContext::start(*order, now, deadline);
                let reserve = Command::ReserveStock(ReserveStock {
                    order: *order,
                    correlation_id: next.correlation_id,
                });
                Decision::Advance(Transition {
                    next,
                    commands: vec![reserve],
                    ledger: Some(LedgerUpdate {
                        status: OrderStatus::ReservingStock,
                        reason: None,
                    }),
                    profile_status: None,
                })
            }
        },

        SagaEvent::StockReserved(reply) => {
            let ctx = match in_step(ctx, OrderStatus::ReservingStock, reply.correlation_id) {
                Ok(ctx) => ctx,
                Err(reason) => return Decision::Drop(reason),
            };
            Decision::Advance(on_stock_checked(ctx, reply, now, deadline))
        }

        SagaEvent::BalanceChecked(reply) => {
            let ctx = match in_step(ctx, OrderStatus::CheckingBalance, reply.correlation_id) {
                Ok(ctx) => ctx,
                Err(reason) => return Decision::Drop(reason),
            };
            Decision::Advance(on_balance_checked(ctx, reply, now))
        }
    }
}

/// `now + step_timeout`, saturating at the latest representable instant.
fn deadline_after(now: DateTime<Utc>, step_timeout: Duration) -> DateTime<Utc> {
    now.checked_add_signed(step_timeout)
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Checks that `ctx` is waiting on `step` for exactly this correlation id.
fn in_step(
    ctx: Option<&SagaContext>,
    step: OrderStatus,
    correlation_id: CorrelationId,
) -> Result<&SagaContext, DropReason> {
    let ctx = ctx.ok_or(DropReason::UnknownOrder)?;
    if ctx.state.is_terminal() {
        return Err(DropReason::Terminal);
    }
    if ctx.state.rank() > step.rank() {
        return Err(DropReason::Duplicate);
    }
    if ctx.state != step || ctx.correlation_id != correlation_id {
        return Err(DropReason::Stale);
    }
    Ok(ctx)
}

fn on_stock_checked(
    ctx: &SagaContext,
    reply: &StockChecked,
    now: DateTime<Utc>,
    deadline: DateTime<Utc>,
) -> Transition {
    match (&reply.item, reply.available) {
        (Some(item), true) => {
            let next = ctx
                .advance(OrderStatus::CheckingBalance, now, Some(deadline))
                .with_item(Some(item.clone()));
            let debit = Command::DebitBalance(DebitBalance {
                order: ctx.order,
                correlation_id: next.correlation_id,
                item: item.clone(),
            });
            Transition {
                next,
                commands: vec![debit],
                ledger: Some(LedgerUpdate {
                    status: OrderStatus::CheckingBalance,
                    reason: None,
                }),
                profile_status: None,
            }
        }
        (Some(item), false) => cancel(
            ctx.advance(OrderStatus::Cancelled, now, None)
                .with_item(Some(item.clone())),
            REASON_OUT_OF_STOCK,
            Vec::new(),
        ),
        // A unit held without an item to price it cannot be paid for.
        (None, true) => {
            let next = ctx.advance(OrderStatus::Cancelled, now, None);
            let compensation = release(&next);
            cancel(next, REASON_UNKNOWN_PRODUCT, vec![compensation])
        }
        (None, false) => cancel(
            ctx.advance(OrderStatus::Cancelled, now, None),
            REASON_UNKNOWN_PRODUCT,
            Vec::new(),
        ),
    }
}

fn on_balance_checked(ctx: &SagaContext, reply: &BalanceChecked, now: DateTime<Utc>) -> Transition {
    if !reply.sufficient {
        let next = ctx
            .advance(OrderStatus::Cancelled, now, None)
            .with_item(Some(reply.item.clone()));
        let compensation = release(&next);
        return cancel(next, REASON_INSUFFICIENT_FUNDS, vec![compensation]);
    }

    let next = ctx
        .advance(OrderStatus::Committed, now, None)
        .with_item(Some(reply.item.clone()))
        .with_reason(REASON_PAID);
    let profile_status = status_item(&reply.item).map(|item| item.name.clone());
    Transition {
        commands: vec![Command::Commit(OrderCommitted { order: ctx.order })],
        next,
        ledger: Some(LedgerUpdate {
            status: OrderStatus::Committed,
            reason: Some(REASON_PAID.to_string()),
        }),
        profile_status,
    }
}

fn status_item(item: &ItemSnapshot) -> Option<&ItemSnapshot> {
    (item.kind == ItemKind::Status).then_some(item)
}

fn release(next: &SagaContext) -> Command {
    Command::ReleaseStock(ReleaseStock {
        order: next.order,
        correlation_id: next.correlation_id,
    })
}

/// Builds a cancellation: compensations first, then the notification.
fn cancel(next: SagaContext, reason: &str, mut commands: Vec<Command>) -> Transition {
    commands.push(Command::Cancel(OrderCancelled {
        order: next.order,
        reason: reason.to_string(),
    }));
    Transition {
        next: next.with_reason(reason),
        commands,
        ledger: Some(LedgerUpdate {
            status: OrderStatus::Cancelled,
            reason: Some(reason.to_string()),
        }),
        profile_status: None,
    }
}

/// Plans the sweep's action for a context whose deadline has passed.
///
/// Returns `None` when the context is not expired (it advanced or was
/// re-issued since it was listed).
pub fn decide_expired(
    ctx: &SagaContext,
    now: DateTime<Utc>,
    step_timeout: Duration,
    max_reissues: u32,
) -> Option<SweepAction> {
    if !ctx.is_expired(now) {
        return None;
    }

    let reissue = match (ctx.state, &ctx.item) {
        (OrderStatus::ReservingStock, _) => Some(Command::ReserveStock(ReserveStock {
            order: ctx.order,
            correlation_id: ctx.correlation_id,
        })),
        (OrderStatus::CheckingBalance, Some(item)) => Some(Command::DebitBalance(DebitBalance {
            order: ctx.order,
            correlation_id: ctx.correlation_id,
            item: item.clone(),
        })),
        _ => None,
    };

    if let Some(command) = reissue
        && ctx.attempts < max_reissues
    {
        return Some(SweepAction::Reissue(Transition {
            next: ctx.reissued(now, deadline_after(now, step_timeout)),
            commands: vec![command],
            ledger: None,
            profile_status: None,
        }));
    }

    let next = ctx.advance(OrderStatus::Cancelled, now, None);
    let mut compensations = vec![release(&next)];
    if ctx.state == OrderStatus::CheckingBalance
        && let Some(item) = &ctx.item
    {
        compensations.push(Command::CreditBalance(CreditBalance {
            order: next.order,
            correlation_id: next.correlation_id,
            amount: item.price,
        }));
    }
    Some(SweepAction::Escalate(cancel(
        next,
        REASON_TIMED_OUT,
        compensations,
    )))
}
