use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::time::MissedTickBehavior;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::IntervalStream;
use tracing::{debug, info, warn};

use crate::engine::dispatch::{DispatchEngine, ResponseOutcome};
use crate::engine::queue::DueQueue;
use crate::error::DispatchError;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    /// Offers released on timeout and handed back to dispatch.
    pub expired: usize,
    /// Due offers that had already moved on (accepted, cancelled, reassigned).
    pub stale: usize,
    /// Stranded pending records pushed forward again.
    pub resumed: usize,
    pub failed: usize,
}

impl SweepReport {
    pub fn is_idle(&self) -> bool {
        *self == SweepReport::default()
    }
}

/// Periodic timeout sweep. Runs until the task is aborted.
pub async fn run_timeout_scheduler(engine: Arc<DispatchEngine>, every: std::time::Duration) {
    info!(interval_ms = every.as_millis() as u64, "timeout scheduler started");

    let stale_after = Duration::from_std(every).unwrap_or_else(|_| Duration::seconds(5));
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut ticks = IntervalStream::new(interval);

    while ticks.next().await.is_some() {
        match sweep(&engine, Utc::now(), stale_after).await {
            Ok(report) if report.is_idle() => debug!("sweep found nothing due"),
            Ok(report) => info!(
                expired = report.expired,
                stale = report.stale,
                resumed = report.resumed,
                failed = report.failed,
                "sweep completed"
            ),
            Err(err) => warn!(error = %err, "sweep failed; retrying on next tick"),
        }
    }
}

/// One pass: release every offer whose window closed at or before `now`,
/// then resume pending records idle for longer than `stale_after`.
///
/// Every release goes through the engine's compare-and-swap keyed on the
/// assignee the sweep observed, so an accept that lands first wins and the
/// sweep's write is dropped.
pub async fn sweep(
    engine: &DispatchEngine,
    now: DateTime<Utc>,
    stale_after: Duration,
) -> Result<SweepReport, DispatchError> {
    let result = sweep_inner(engine, now, stale_after).await;
    let outcome = if result.is_ok() { "ok" } else { "error" };
    engine
        .metrics()
        .sweep_runs_total
        .with_label_values(&[outcome])
        .inc();
    result
}

async fn sweep_inner(
    engine: &DispatchEngine,
    now: DateTime<Utc>,
    stale_after: Duration,
) -> Result<SweepReport, DispatchError> {
    let mut report = SweepReport::default();

    let due = engine.due_offers(now).await?;
    let mut queue = DueQueue::from_records(&due);

    while let Some(offer) = queue.pop() {
        match engine
            .expire_offer(&offer.order_id, offer.courier_id, now)
            .await
        {
            Ok(ResponseOutcome::Applied(record)) => {
                report.expired += 1;
                info!(
                    order_id = %offer.order_id,
                    courier_id = %offer.courier_id,
                    status = %record.status(),
                    "offer timed out"
                );
            }
            Ok(_) => report.stale += 1,
            Err(err) => {
                report.failed += 1;
                warn!(order_id = %offer.order_id, error = %err, "timeout transition failed");
            }
        }
    }

    for record in engine.stranded(now - stale_after).await? {
        match engine.resume(record.order_id()).await {
            Ok(Some(_)) => report.resumed += 1,
            Ok(None) => {}
            Err(err) => {
                report.failed += 1;
                warn!(order_id = %record.order_id(), error = %err, "resume failed");
            }
        }
    }

    Ok(report)
}
