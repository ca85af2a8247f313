//! Periodic sweep over sagas whose step deadline has passed.

use std::sync::Arc;
use std::time::Duration;

use message_bus::Publisher;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};

use crate::error::Result;
use crate::orchestrator::{Orchestrator, SweepOutcome};
use crate::settings::SagaSettings;
use crate::worker::stopped;

const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(10);

/// Counts from one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub reissued: usize,
    pub escalated: usize,
    /// Contexts that moved on before they were handled.
    pub skipped: usize,
    pub failed: usize,
}

pub struct Reconciler {
    orchestrator: Arc<Orchestrator>,
    settings: SagaSettings,
}

impl Reconciler {
    pub fn new(orchestrator: Arc<Orchestrator>, settings: SagaSettings) -> Self {
        Self {
            orchestrator,
            settings,
        }
    }

    /// Handles up to `sweep_batch` expired sagas. A failure on one order is
    /// logged and left for the next sweep.
    pub async fn sweep(&self, publisher: &dyn Publisher) -> Result<SweepReport> {
        let expired = self.orchestrator.expired(self.settings.sweep_batch).await?;
        let mut report = SweepReport::default();

        for ctx in expired {
            let order_id = ctx.order_id();
            match self.orchestrator.handle_expired(order_id, publisher).await {
                Ok(Some(SweepOutcome::Reissued)) => report.reissued += 1,
                Ok(Some(SweepOutcome::Escalated)) => report.escalated += 1,
                Ok(None) => report.skipped += 1,
                Err(e) => {
                    tracing::error!(%order_id, error = %e, "sweep failed for order");
                    report.failed += 1;
                }
            }
        }

        if report != SweepReport::default() {
            tracing::info!(
                reissued = report.reissued,
                escalated = report.escalated,
                skipped = report.skipped,
                failed = report.failed,
                "sweep finished"
            );
        }
        Ok(report)
    }

    /// Sweeps every `sweep_interval` until `shutdown` turns `true`. The first
    /// sweep runs one interval after start.
    pub async fn run(self, publisher: Box<dyn Publisher>, mut shutdown: watch::Receiver<bool>) {
        let period = self.settings.sweep_interval.max(MIN_SWEEP_INTERVAL);
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = stopped(&mut shutdown) => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep(publisher.as_ref()).await {
                        tracing::error!(error = %e, "sweep failed");
                    }
                }
            }
        }
        tracing::debug!("reconciler stopped");
    }
}
