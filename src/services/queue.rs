use std::sync::Arc;
use std::time::Duration;

use redis::AsyncCommands;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::db::store::{JobStore, ReclaimReport};
use crate::error::{CoreError, StoreError};
use crate::models::job::{Job, JobState, NewJob};
use crate::services::clock::Clock;

/// Redis list used to wake idle workers. Postgres stays the source of truth.
const READY_KEY: &str = "astroview:jobs:ready";
const READY_MAX_LEN: isize = 1000;

/// Queue timing and retry policy.
#[derive(Debug, Clone, Copy)]
pub struct QueueSettings {
    pub poll_interval: Duration,
    pub visibility_timeout: Duration,
    pub expiration: Duration,
    pub max_attempts: u32,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(15),
            visibility_timeout: Duration::from_secs(14 * 24 * 60 * 60),
            expiration: Duration::from_secs(14 * 24 * 60 * 60),
            max_attempts: 3,
        }
    }
}

/// Durable job queue over a [`JobStore`] with an optional Redis wake-up signal.
#[derive(Clone)]
pub struct JobQueue {
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    redis: Option<redis::Client>,
    settings: QueueSettings,
}

impl JobQueue {
    pub fn new(store: Arc<dyn JobStore>, clock: Arc<dyn Clock>, settings: QueueSettings) -> Self {
        Self {
            store,
            clock,
            redis: None,
            settings,
        }
    }

    pub fn with_redis(mut self, redis_url: &str) -> Result<Self, QueueError> {
        self.redis = Some(redis::Client::open(redis_url)?);
        Ok(self)
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    /// Persist a new job and nudge idle workers.
    pub async fn enqueue(&self, job: NewJob) -> Result<Job, QueueError> {
        let job = self.store.insert_job(job, self.clock.now()).await?;
        metrics::counter!("jobs_enqueued_total", "kind" => job.payload.name()).increment(1);
        tracing::info!(job_id = %job.id, dataset_id = job.dataset_id, kind = job.payload.name(), "Job enqueued");

        if let Err(e) = self.signal(job.id).await {
            tracing::warn!(job_id = %job.id, error = %e, "Failed to signal workers; they will poll");
        }
        Ok(job)
    }

    async fn signal(&self, job_id: Uuid) -> Result<(), QueueError> {
        let Some(client) = &self.redis else {
            return Ok(());
        };
        let mut conn = client.get_multiplexed_async_connection().await?;
        conn.lpush::<_, _, ()>(READY_KEY, job_id.to_string()).await?;
        conn.ltrim::<_, ()>(READY_KEY, 0, READY_MAX_LEN - 1).await?;
        Ok(())
    }

    /// Claim the next due job after returning overdue and retry-ready jobs to the queue.
    pub async fn claim(&self, worker_id: &str) -> Result<Option<Job>, QueueError> {
        self.requeue_due().await?;
        let now = self.clock.now();
        let job = self
            .store
            .claim_next(worker_id, now, self.clock.after(self.settings.visibility_timeout))
            .await?;
        if let Some(job) = &job {
            tracing::info!(
                job_id = %job.id,
                worker_id,
                attempt = job.attempts,
                "Job claimed"
            );
        }
        Ok(job)
    }

    /// Promote AwaitingRetry jobs that are due and reclaim expired claims.
    pub async fn requeue_due(&self) -> Result<ReclaimReport, QueueError> {
        let now = self.clock.now();
        let promoted = self.store.promote_due_retries(now).await?;
        if promoted > 0 {
            tracing::debug!(promoted, "Retry-ready jobs re-enqueued");
        }

        let report = self
            .store
            .reclaim_expired(
                now,
                self.settings.max_attempts,
                self.clock.after(self.settings.expiration),
            )
            .await?;
        if report.requeued > 0 || report.failed > 0 {
            metrics::counter!("jobs_reclaimed_total").increment(report.requeued + report.failed);
            tracing::warn!(
                requeued = report.requeued,
                failed = report.failed,
                "Reclaimed jobs past their visibility deadline"
            );
        }
        Ok(report)
    }

    pub async fn complete(&self, job: &Job) -> Result<(), QueueError> {
        let claim = job.claim().ok_or(QueueError::NotClaimed { job_id: job.id })?;
        self.store
            .mark_succeeded(claim, self.clock.now(), self.clock.after(self.settings.expiration))
            .await?;
        metrics::counter!("jobs_succeeded_total").increment(1);
        Ok(())
    }

    /// AwaitingRetry below the attempt ceiling, Failed at it.
    pub async fn retry_or_fail(&self, job: &Job, error: &str) -> Result<JobState, QueueError> {
        if job.attempts >= self.settings.max_attempts {
            self.fail(job, &format!("{error} (after {} attempts)", job.attempts))
                .await?;
            return Ok(JobState::Failed);
        }

        let claim = job.claim().ok_or(QueueError::NotClaimed { job_id: job.id })?;
        self.store
            .mark_awaiting_retry(
                claim,
                error,
                self.clock.now(),
                self.clock.after(self.settings.poll_interval),
            )
            .await?;
        metrics::counter!("jobs_retried_total").increment(1);
        Ok(JobState::AwaitingRetry)
    }

    pub async fn fail(&self, job: &Job, error: &str) -> Result<(), QueueError> {
        let claim = job.claim().ok_or(QueueError::NotClaimed { job_id: job.id })?;
        self.store
            .mark_failed(
                claim,
                error,
                self.clock.now(),
                self.clock.after(self.settings.expiration),
            )
            .await?;
        metrics::counter!("jobs_failed_total").increment(1);
        Ok(())
    }

    /// Delete terminal jobs whose retention has elapsed.
    pub async fn purge_expired(&self) -> Result<u64, QueueError> {
        let purged = self.store.purge_expired(self.clock.now()).await?;
        if purged > 0 {
            metrics::counter!("jobs_purged_total").increment(purged);
            tracing::info!(purged, "Purged expired jobs");
        }
        Ok(purged)
    }

    /// Block until a job might be available: a Redis signal, the poll interval, or cancellation.
    pub async fn wait_for_work(&self, cancel: &CancellationToken) {
        let wait = async {
            match &self.redis {
                Some(client) => {
                    if let Err(e) = self.wait_for_signal(client).await {
                        tracing::debug!(error = %e, "Wake-up wait failed; falling back to sleep");
                        tokio::time::sleep(self.settings.poll_interval).await;
                    }
                }
                None => tokio::time::sleep(self.settings.poll_interval).await,
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = wait => {}
        }
    }

    async fn wait_for_signal(&self, client: &redis::Client) -> Result<(), QueueError> {
        let mut conn = client.get_multiplexed_async_connection().await?;
        let popped: Option<(String, String)> = conn
            .brpop(READY_KEY, self.settings.poll_interval.as_secs_f64())
            .await?;
        if let Some((_, job_id)) = popped {
            tracing::trace!(job_id, "Woken by enqueue signal");
        }
        Ok(())
    }

    /// Check Redis connectivity. `None` when no Redis is configured.
    pub async fn health_check(&self) -> Option<Result<(), QueueError>> {
        let client = self.redis.as_ref()?;
        Some(ping(client).await)
    }

    pub async fn get(&self, job_id: Uuid) -> Result<Option<Job>, QueueError> {
        Ok(self.store.get_job(job_id).await?)
    }

    pub async fn list(&self, state: Option<JobState>, limit: i64) -> Result<Vec<Job>, QueueError> {
        Ok(self.store.list_jobs(state, limit).await?)
    }

    pub async fn counts(&self) -> Result<Vec<(JobState, i64)>, QueueError> {
        Ok(self.store.count_by_state().await?)
    }
}

async fn ping(client: &redis::Client) -> Result<(), QueueError> {
    let mut conn = client.get_multiplexed_async_connection().await?;
    redis::cmd("PING").query_async::<String>(&mut conn).await?;
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Job {job_id} has no active claim")]
    NotClaimed { job_id: Uuid },
}

impl From<QueueError> for CoreError {
    fn from(error: QueueError) -> Self {
        match error {
            QueueError::Store(e) => CoreError::Store(e),
            other => CoreError::Queue(other.to_string()),
        }
    }
}

impl QueueError {
    /// The job was reclaimed out from under the caller.
    pub fn is_claim_lost(&self) -> bool {
        matches!(self, QueueError::Store(StoreError::ClaimLost { .. }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use crate::models::mutation::Mutation;
    use crate::services::clock::ManualClock;

    fn queue() -> (JobQueue, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let queue = JobQueue::new(Arc::new(MemoryStore::new()), clock.clone(), QueueSettings::default());
        (queue, clock)
    }

    fn new_job() -> NewJob {
        NewJob {
            dataset_id: 1,
            user_id: "u".to_string(),
            payload: Mutation::ApplyLabel {
                label_id: 1,
                image_names: vec!["a".into()],
            }
            .into(),
        }
    }

    #[tokio::test]
    async fn test_claim_sets_visibility_deadline() {
        let (queue, clock) = queue();
        queue.enqueue(new_job()).await.unwrap();

        let job = queue.claim("w1").await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Processing);
        assert_eq!(job.attempts, 1);
        assert_eq!(
            job.visibility_deadline,
            Some(clock.after(QueueSettings::default().visibility_timeout))
        );
        assert!(queue.claim("w2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_retry_waits_for_poll_interval() {
        let (queue, clock) = queue();
        queue.enqueue(new_job()).await.unwrap();
        let job = queue.claim("w1").await.unwrap().unwrap();

        assert_eq!(queue.retry_or_fail(&job, "boom").await.unwrap(), JobState::AwaitingRetry);
        assert!(queue.claim("w1").await.unwrap().is_none());

        clock.advance(chrono::Duration::seconds(15));
        let again = queue.claim("w1").await.unwrap().unwrap();
        assert_eq!(again.id, job.id);
        assert_eq!(again.attempts, 2);
        assert_eq!(again.last_error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_no_redis_health_is_none() {
        let (queue, _) = queue();
        assert!(queue.health_check().await.is_none());
    }
}
