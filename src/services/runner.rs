//! Job Runner: worker loops that drain the durable queue.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{CoreError, StoreError};
use crate::models::job::{ExternalOutput, Job, JobPayload, JobState};
use crate::services::mutation::MutationService;
use crate::services::output::{OutputCollector, OutputError};
use crate::services::queue::{JobQueue, QueueError};

/// How a handler reports failure to the runner.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    /// Worth another attempt after the retry delay.
    #[error("{0}")]
    Recoverable(String),

    /// Never retried; the job is marked Failed.
    #[error("{0}")]
    Fatal(String),

    /// The claim was reclaimed while the handler ran. Someone else owns the job now.
    #[error("claim on job {0} was lost")]
    ClaimLost(Uuid),
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job, cancel: &CancellationToken) -> Result<(), JobError>;
}

/// Runs queued dataset mutations and collects external job output.
pub struct DatasetJobHandler {
    mutations: MutationService,
    outputs: Option<OutputCollector>,
}

impl DatasetJobHandler {
    pub fn new(mutations: MutationService) -> Self {
        Self {
            mutations,
            outputs: None,
        }
    }

    pub fn with_outputs(mut self, outputs: OutputCollector) -> Self {
        self.outputs = Some(outputs);
        self
    }

    async fn collect_output(&self, job: &Job, output: &ExternalOutput) -> Result<(), JobError> {
        let Some(outputs) = &self.outputs else {
            return Err(JobError::Fatal(
                "output collection is not configured on this worker".to_string(),
            ));
        };

        match outputs.collect(job, output).await {
            Ok(collected) => {
                tracing::info!(
                    job_id = %job.id,
                    external_id = %output.external_id,
                    bytes = collected.bytes,
                    "External output collected"
                );
                Ok(())
            }
            Err(OutputError::Pipeline(e)) if e.is_permanent() => Err(JobError::Fatal(e.to_string())),
            Err(e) => Err(JobError::Recoverable(e.to_string())),
        }
    }
}

#[async_trait]
impl JobHandler for DatasetJobHandler {
    async fn handle(&self, job: &Job, cancel: &CancellationToken) -> Result<(), JobError> {
        if let JobPayload::ExternalOutput(output) = &job.payload {
            return self.collect_output(job, output).await;
        }

        match self.mutations.execute_job(job, cancel).await {
            Ok(report) => {
                tracing::info!(
                    job_id = %job.id,
                    dataset_id = job.dataset_id,
                    matched = report.matched,
                    chunks = report.chunks,
                    "Dataset job applied"
                );
                Ok(())
            }
            Err(e) => Err(classify(e)),
        }
    }
}

fn classify(error: CoreError) -> JobError {
    match error {
        CoreError::Store(StoreError::ClaimLost { job_id }) => JobError::ClaimLost(job_id),
        CoreError::LockedDataset { .. }
        | CoreError::Store(_)
        | CoreError::Queue(_)
        | CoreError::Cancelled => {
            JobError::Recoverable(error.to_string())
        }
        CoreError::Permission { .. }
        | CoreError::NotFound { .. }
        | CoreError::Validation(_)
        | CoreError::Conflict(_) => JobError::Fatal(error.to_string()),
    }
}

/// What a single [`JobRunner::run_once`] call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Idle,
    Finished { job_id: Uuid, state: JobState },
    /// The claim was reclaimed before the worker could record a result.
    Abandoned { job_id: Uuid },
}

#[derive(Clone)]
pub struct JobRunner {
    queue: JobQueue,
    handler: Arc<dyn JobHandler>,
}

impl JobRunner {
    pub fn new(queue: JobQueue, handler: Arc<dyn JobHandler>) -> Self {
        Self { queue, handler }
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    /// Claim and run at most one job.
    pub async fn run_once(
        &self,
        worker_id: &str,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome, QueueError> {
        let Some(job) = self.queue.claim(worker_id).await? else {
            return Ok(RunOutcome::Idle);
        };

        let started = Instant::now();
        let result = self.handler.handle(&job, cancel).await;
        metrics::histogram!("job_processing_seconds").record(started.elapsed().as_secs_f64());

        let transition = match result {
            Ok(()) => self.queue.complete(&job).await.map(|()| JobState::Succeeded),
            Err(JobError::Recoverable(reason)) => {
                tracing::warn!(job_id = %job.id, attempt = job.attempts, error = %reason, "Job failed, will retry");
                self.queue.retry_or_fail(&job, &reason).await
            }
            Err(JobError::Fatal(reason)) => {
                tracing::error!(job_id = %job.id, error = %reason, "Job failed permanently");
                self.queue.fail(&job, &reason).await.map(|()| JobState::Failed)
            }
            Err(JobError::ClaimLost(job_id)) => {
                tracing::warn!(%job_id, worker_id, "Claim lost mid-run, abandoning job");
                return Ok(RunOutcome::Abandoned { job_id });
            }
        };

        match transition {
            Ok(state) => {
                tracing::info!(job_id = %job.id, worker_id, state = %state, "Job finished");
                Ok(RunOutcome::Finished {
                    job_id: job.id,
                    state,
                })
            }
            Err(e) if e.is_claim_lost() => {
                tracing::warn!(job_id = %job.id, worker_id, "Claim lost before recording result");
                Ok(RunOutcome::Abandoned { job_id: job.id })
            }
            Err(e) => Err(e),
        }
    }

    /// Drain the queue until cancelled.
    pub async fn run_worker(&self, worker_id: String, cancel: CancellationToken) {
        tracing::info!(worker_id = %worker_id, "Worker started");

        while !cancel.is_cancelled() {
            match self.run_once(&worker_id, &cancel).await {
                Ok(RunOutcome::Idle) => {
                    tracing::trace!(worker_id = %worker_id, "No jobs available, waiting");
                    self.queue.wait_for_work(&cancel).await;
                }
                Ok(outcome) => {
                    tracing::debug!(worker_id = %worker_id, ?outcome, "Checking for next job");
                }
                Err(e) => {
                    tracing::error!(worker_id = %worker_id, error = %e, "Error processing job, will retry");
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        _ = tokio::time::sleep(self.queue.settings().poll_interval) => {}
                    }
                }
            }
        }

        tracing::info!(worker_id = %worker_id, "Worker stopped");
    }

    /// Periodically requeue overdue work and purge expired jobs until cancelled.
    pub async fn run_housekeeping(&self, every: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if let Err(e) = self.queue.requeue_due().await {
                tracing::error!(error = %e, "Failed to requeue due jobs");
            }
            if let Err(e) = self.queue.purge_expired().await {
                tracing::error!(error = %e, "Failed to purge expired jobs");
            }
        }

        tracing::info!("Housekeeping stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::dataset::LockHolder;

    #[test]
    fn test_classify() {
        assert!(matches!(
            classify(CoreError::Permission { dataset_id: 1 }),
            JobError::Fatal(_)
        ));
        assert!(matches!(
            classify(CoreError::LockedDataset {
                dataset_id: 1,
                holder: LockHolder::request()
            }),
            JobError::Recoverable(_)
        ));
        assert!(matches!(classify(CoreError::Cancelled), JobError::Recoverable(_)));
        let id = Uuid::new_v4();
        assert!(matches!(
            classify(CoreError::Store(StoreError::ClaimLost { job_id: id })),
            JobError::ClaimLost(lost) if lost == id
        ));
    }
}
