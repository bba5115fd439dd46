//! Storage seams shared by the API server, the job runner and the watcher.
//!
//! Every method that depends on "now" takes it explicitly so the caller's
//! clock decides deadlines, not the database server.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::change::{Change, NewChange};
use crate::models::dataset::{Dataset, DatasetLock, Label, LockHolder, NewDataset};
use crate::models::external_job::{ExternalJob, NewExternalJob, StatusReport};
use crate::models::job::{ClaimToken, Job, JobProgress, JobState, NewJob};
use crate::models::mutation::{ChunkOutcome, Mutation};

/// Checkpoint written atomically with a chunk by background jobs.
#[derive(Debug, Clone, Copy)]
pub struct ChunkCheckpoint {
    pub claim: ClaimToken,
    /// Progress before this chunk.
    pub before: JobProgress,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LockAttempt {
    Granted(DatasetLock),
    Held(DatasetLock),
}

/// Outcome of registering an external job handle.
#[derive(Debug, Clone)]
pub enum Registration {
    /// Handle stored and the dataset's lease taken for it.
    Registered(ExternalJob),
    /// Another holder has the dataset; nothing was stored.
    Locked(DatasetLock),
    /// The external id is already tracked; its handle and lease are untouched.
    Duplicate(ExternalJob),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReclaimReport {
    pub requeued: u64,
    pub failed: u64,
}

#[async_trait]
pub trait DatasetStore: Send + Sync {
    async fn health_check(&self) -> Result<(), StoreError>;

    async fn create_dataset(
        &self,
        dataset: NewDataset,
        now: DateTime<Utc>,
    ) -> Result<Dataset, StoreError>;

    async fn get_dataset(&self, dataset_id: i64) -> Result<Option<Dataset>, StoreError>;

    async fn get_label(&self, label_id: i64) -> Result<Option<Label>, StoreError>;

    /// Apply one chunk of `mutation` to `dataset_id` in a single transaction.
    /// With a checkpoint, the job's progress advances in the same transaction
    /// and the chunk is rejected with [`StoreError::ClaimLost`] if the claim was reclaimed.
    async fn apply_chunk(
        &self,
        dataset_id: i64,
        mutation: &Mutation,
        names: &[String],
        checkpoint: Option<ChunkCheckpoint>,
    ) -> Result<ChunkOutcome, StoreError>;

    /// Write the audit record for a finished mutation and bump the dataset's
    /// modification time. Returns `None` when the job already has its change.
    async fn complete_mutation(
        &self,
        change: NewChange,
        completed_at: DateTime<Utc>,
    ) -> Result<Option<Change>, StoreError>;

    async fn append_change(
        &self,
        change: NewChange,
        now: DateTime<Utc>,
    ) -> Result<Change, StoreError>;

    async fn list_changes(&self, dataset_id: i64) -> Result<Vec<Change>, StoreError>;
}

#[async_trait]
pub trait LockStore: Send + Sync {
    /// Take the lease if it is free, expired, or already ours.
    async fn try_acquire(
        &self,
        dataset_id: i64,
        holder: &LockHolder,
        now: DateTime<Utc>,
        lease_expires_at: DateTime<Utc>,
    ) -> Result<LockAttempt, StoreError>;

    /// Extend a lease we still hold. False if it was lost.
    async fn renew(
        &self,
        dataset_id: i64,
        holder: &LockHolder,
        lease_expires_at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    async fn release(&self, dataset_id: i64, holder: &LockHolder) -> Result<bool, StoreError>;

    /// Operator override: drop the lease whoever holds it.
    async fn force_release(&self, dataset_id: i64) -> Result<Option<DatasetLock>, StoreError>;

    async fn current_lock(&self, dataset_id: i64) -> Result<Option<DatasetLock>, StoreError>;
}

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert_job(&self, job: NewJob, now: DateTime<Utc>) -> Result<Job, StoreError>;

    async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>, StoreError>;

    /// Atomically move the oldest due Enqueued job to Processing.
    async fn claim_next(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
        visibility_deadline: DateTime<Utc>,
    ) -> Result<Option<Job>, StoreError>;

    async fn mark_succeeded(
        &self,
        claim: ClaimToken,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn mark_awaiting_retry(
        &self,
        claim: ClaimToken,
        error: &str,
        now: DateTime<Utc>,
        available_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn mark_failed(
        &self,
        claim: ClaimToken,
        error: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// AwaitingRetry jobs whose delay has elapsed go back to Enqueued.
    async fn promote_due_retries(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Processing jobs past their visibility deadline go back to Enqueued,
    /// or to Failed once `max_attempts` is reached.
    async fn reclaim_expired(
        &self,
        now: DateTime<Utc>,
        max_attempts: u32,
        failed_expires_at: DateTime<Utc>,
    ) -> Result<ReclaimReport, StoreError>;

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;

    async fn list_jobs(&self, state: Option<JobState>, limit: i64) -> Result<Vec<Job>, StoreError>;

    async fn count_by_state(&self) -> Result<Vec<(JobState, i64)>, StoreError>;
}

#[async_trait]
pub trait ExternalJobStore: Send + Sync {
    /// Store a new handle and take the dataset lease for it in one transaction.
    async fn register_external_job(
        &self,
        job: NewExternalJob,
        now: DateTime<Utc>,
        lease_expires_at: DateTime<Utc>,
    ) -> Result<Registration, StoreError>;

    async fn list_unreconciled(&self) -> Result<Vec<ExternalJob>, StoreError>;

    async fn record_poll(
        &self,
        id: i64,
        report: &StatusReport,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Apply a terminal status exactly once. In one transaction: mark the
    /// handle reconciled, write the Change, enqueue the output collection job
    /// and release the handle's dataset lease. Returns the enqueued job, or
    /// `None` when the handle was already reconciled.
    async fn reconcile(
        &self,
        id: i64,
        report: &StatusReport,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, StoreError>;

    /// Drop reconciled handles that finished at or before `finished_before`.
    /// Their Changes stay.
    async fn purge_reconciled(&self, finished_before: DateTime<Utc>) -> Result<u64, StoreError>;
}
