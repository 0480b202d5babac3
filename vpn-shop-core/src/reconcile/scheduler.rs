use std::time::Duration;

use tokio::{
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{ReconcileReport, Reconciler};
use crate::{error::Result, purchase::Provider};

/// Timing of one provider's reconciliation loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    /// Delay between run starts.
    pub interval: Duration,
    /// Upper bound on a single run.
    pub run_timeout: Duration,
}

/// Spawns the reconciliation loop for `provider`.
///
/// Runs are awaited inline, so a slow run makes the loop skip the ticks it
/// missed instead of overlapping itself. Cancelling `cancel` stops the loop
/// between runs and aborts a run in progress.
pub fn spawn_periodic(
    reconciler: Reconciler,
    provider: Provider,
    settings: PollSettings,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(settings.interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            %provider,
            interval_secs = settings.interval.as_secs(),
            "starting reconciliation loop"
        );

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    warn!(%provider, "reconciliation run aborted by shutdown");
                    break;
                }
                outcome = time::timeout(settings.run_timeout, reconciler.run_once(provider)) => {
                    log_outcome(provider, settings.run_timeout, outcome);
                }
            }
        }
        info!(%provider, "reconciliation loop stopped");
    })
}

fn log_outcome(
    provider: Provider,
    run_timeout: Duration,
    outcome: std::result::Result<Result<ReconcileReport>, time::error::Elapsed>,
) {
    match outcome {
        Ok(Ok(report)) if report.is_idle() => {
            debug!(%provider, pending = report.pending, "reconciliation run finished");
        }
        Ok(Ok(report)) => info!(
            %provider,
            pending = report.pending,
            confirmed = report.confirmed,
            completed = report.completed,
            already_processed = report.already_processed,
            cancelled = report.cancelled,
            errors = report.errors,
            "reconciliation run finished"
        ),
        Ok(Err(e)) => error!(%provider, error = %e, "reconciliation run failed"),
        Err(_) => error!(
            %provider,
            timeout_secs = run_timeout.as_secs(),
            "reconciliation run timed out"
        ),
    }
}
