//! External Job Watcher: polls the pipeline and reconciles finished jobs.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::db::store::ExternalJobStore;
use crate::error::StoreError;
use crate::models::external_job::ExternalJob;
use crate::services::clock::Clock;
use crate::services::lock::LockGuard;
use crate::services::pipeline::PipelineClient;

/// Counts from one pass over the tracked external jobs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub polled: u64,
    pub running: u64,
    pub reconciled: u64,
    pub errors: u64,
}

/// Reconciled handles are kept this long by default, like finished queue jobs.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(14 * 24 * 60 * 60);
const PURGE_EVERY: Duration = Duration::from_secs(60 * 60);

#[derive(Clone)]
pub struct ExternalJobWatcher {
    store: Arc<dyn ExternalJobStore>,
    pipeline: Arc<dyn PipelineClient>,
    locks: LockGuard,
    clock: Arc<dyn Clock>,
    interval: Duration,
    retention: Duration,
}

impl ExternalJobWatcher {
    pub fn new(
        store: Arc<dyn ExternalJobStore>,
        pipeline: Arc<dyn PipelineClient>,
        locks: LockGuard,
        clock: Arc<dyn Clock>,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            pipeline,
            locks,
            clock,
            interval,
            retention: DEFAULT_RETENTION,
        }
    }

    /// How long reconciled handles stay queryable before they are purged.
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Tick until cancelled. A tick still running when the next is due skips it.
    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!(interval_secs = self.interval.as_secs(), "External job watcher started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut purge = tokio::time::interval(PURGE_EVERY);
        purge.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = purge.tick() => {
                    if let Err(e) = self.purge_reconciled().await {
                        tracing::error!(error = %e, "Failed to purge reconciled external jobs");
                    }
                    continue;
                }
                _ = ticker.tick() => {}
            }

            match self.tick(&cancel).await {
                Ok(report) if report.polled > 0 => {
                    tracing::debug!(?report, "Watcher tick finished");
                }
                Ok(_) => {}
                Err(e) => tracing::error!(error = %e, "Failed to list external jobs"),
            }
        }

        tracing::info!("External job watcher stopped");
    }

    /// Poll every unreconciled handle once.
    pub async fn tick(&self, cancel: &CancellationToken) -> Result<TickReport, StoreError> {
        let mut report = TickReport::default();

        for job in self.store.list_unreconciled().await? {
            if cancel.is_cancelled() {
                break;
            }
            report.polled += 1;

            let status = match self.pipeline.get_status(&job.external_id).await {
                Ok(status) => status,
                Err(e) => {
                    metrics::counter!("watcher_poll_errors_total").increment(1);
                    tracing::warn!(
                        external_id = %job.external_id,
                        dataset_id = job.dataset_id,
                        error = %e,
                        "Failed to poll external job, retrying next tick"
                    );
                    report.errors += 1;
                    continue;
                }
            };

            let now = self.clock.now();
            if !status.status.is_terminal() {
                self.store.record_poll(job.id, &status, now).await?;
                self.keep_lease(&job).await;
                report.running += 1;
                continue;
            }

            if let Some(follow_up) = self.store.reconcile(job.id, &status, now).await? {
                metrics::counter!("watcher_reconciled_total", "status" => status.status.as_ref().to_string())
                    .increment(1);
                tracing::info!(
                    external_id = %job.external_id,
                    dataset_id = job.dataset_id,
                    state = %status.state,
                    status = %status.status,
                    output_job_id = %follow_up.id,
                    "External job reconciled"
                );
                report.reconciled += 1;
            } else {
                tracing::debug!(external_id = %job.external_id, "External job already reconciled");
            }
        }

        Ok(report)
    }

    /// Drop reconciled handles older than the retention. Their Changes stay.
    pub async fn purge_reconciled(&self) -> Result<u64, StoreError> {
        let retention = chrono::Duration::from_std(self.retention).unwrap_or(chrono::Duration::MAX);
        let Some(cutoff) = self.clock.now().checked_sub_signed(retention) else {
            return Ok(0);
        };
        let purged = self.store.purge_reconciled(cutoff).await?;
        if purged > 0 {
            tracing::info!(purged, "Purged reconciled external jobs");
        }
        Ok(purged)
    }

    async fn keep_lease(&self, job: &ExternalJob) {
        match self.locks.renew(job.dataset_id, &job.lock_holder()).await {
            Ok(true) => {}
            Ok(false) => tracing::warn!(
                external_id = %job.external_id,
                dataset_id = job.dataset_id,
                "External job no longer holds its dataset lock"
            ),
            Err(e) => tracing::warn!(
                external_id = %job.external_id,
                error = %e,
                "Failed to renew external job lease"
            ),
        }
    }
}
