//! In-process store with the same semantics as [`PgStore`](crate::db::PgStore).
//!
//! Each trait method takes the mutex once, so every call is atomic the way a
//! single Postgres transaction is.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::db::postgres::reconcile_summary;
use crate::db::store::{
    ChunkCheckpoint, DatasetStore, ExternalJobStore, JobStore, LockAttempt, LockStore,
    ReclaimReport, Registration,
};
use crate::error::StoreError;
use crate::models::change::{Change, ChangeKind, NewChange};
use crate::models::dataset::{Dataset, DatasetLock, Image, Label, LockHolder, NewDataset, NewImage};
use crate::models::external_job::{ExternalJob, ExternalStatus, NewExternalJob, StatusReport};
use crate::models::job::{ClaimToken, Job, JobProgress, JobState, NewJob};
use crate::models::mutation::{ChunkOutcome, Mutation};

#[derive(Default)]
struct Inner {
    next_id: i64,
    datasets: BTreeMap<i64, Dataset>,
    images: BTreeMap<i64, Image>,
    labels: BTreeMap<i64, Label>,
    image_labels: BTreeMap<(i64, i64), i32>,
    changes: Vec<Change>,
    locks: HashMap<i64, DatasetLock>,
    jobs: HashMap<Uuid, Job>,
    external_jobs: BTreeMap<i64, ExternalJob>,
    committed_chunks: u64,
    fail_after: Option<u64>,
    unavailable: bool,
}

impl Inner {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable {
            return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
        }
        Ok(())
    }

    /// Images of `dataset_id` named in `names`, ordered by id.
    fn matching_images(&self, dataset_id: i64, names: &[String]) -> Vec<Image> {
        self.images
            .values()
            .filter(|img| img.dataset_id == dataset_id && names.contains(&img.name))
            .cloned()
            .collect()
    }

    fn processing_job(&mut self, claim: ClaimToken) -> Result<&mut Job, StoreError> {
        match self.jobs.get_mut(&claim.job_id) {
            Some(job) if job.state == JobState::Processing && job.claim_token == Some(claim.token) => {
                Ok(job)
            }
            _ => Err(StoreError::ClaimLost {
                job_id: claim.job_id,
            }),
        }
    }

    fn acquire_lease(
        &mut self,
        dataset_id: i64,
        holder: &LockHolder,
        now: DateTime<Utc>,
        lease_expires_at: DateTime<Utc>,
    ) -> LockAttempt {
        let acquired_at = match self.locks.get(&dataset_id) {
            Some(current) if current.holder == *holder => current.acquired_at,
            Some(current) if !current.is_expired(now) => {
                return LockAttempt::Held(current.clone());
            }
            _ => now,
        };
        let lock = DatasetLock {
            dataset_id,
            holder: holder.clone(),
            acquired_at,
            lease_expires_at,
        };
        self.locks.insert(dataset_id, lock.clone());
        LockAttempt::Granted(lock)
    }

    fn push_job(&mut self, job_id: Uuid, job: NewJob, now: DateTime<Utc>) -> Job {
        let job = Job {
            id: job_id,
            dataset_id: job.dataset_id,
            user_id: job.user_id,
            payload: job.payload,
            state: JobState::Enqueued,
            attempts: 0,
            claimed_by: None,
            claim_token: None,
            visibility_deadline: None,
            available_at: now,
            expires_at: None,
            progress: JobProgress::default(),
            last_error: None,
            created_at: now,
            updated_at: now,
        };
        self.jobs.insert(job.id, job.clone());
        job
    }

    fn push_change(&mut self, change: NewChange, now: DateTime<Utc>) -> Change {
        let change = Change {
            id: self.next_id(),
            dataset_id: change.dataset_id,
            user_id: change.user_id,
            kind: change.kind,
            summary: change.summary,
            job_id: change.job_id,
            created_at: now,
        };
        self.changes.push(change.clone());
        change
    }
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn insert_image(&self, image: NewImage) -> Image {
        let mut inner = self.inner();
        let image = Image {
            id: inner.next_id(),
            dataset_id: image.dataset_id,
            name: image.name,
            path: image.path,
            metadata: image.metadata,
        };
        inner.images.insert(image.id, image.clone());
        image
    }

    pub fn insert_label(&self, name: &str, color: &str) -> Label {
        let mut inner = self.inner();
        let label = Label {
            id: inner.next_id(),
            name: name.to_string(),
            color: color.to_string(),
        };
        inner.labels.insert(label.id, label.clone());
        label
    }

    /// Associate a label with an image directly, bypassing the mutation path.
    pub fn attach_label(&self, image_id: i64, label_id: i64) {
        self.inner().image_labels.insert((image_id, label_id), 0);
    }

    /// Image names in a dataset, ordered by id.
    pub fn image_names(&self, dataset_id: i64) -> Vec<String> {
        self.inner()
            .images
            .values()
            .filter(|img| img.dataset_id == dataset_id)
            .map(|img| img.name.clone())
            .collect()
    }

    /// Label ids attached to the named image.
    pub fn labels_of(&self, dataset_id: i64, image_name: &str) -> Vec<i64> {
        let inner = self.inner();
        let Some(image) = inner
            .images
            .values()
            .find(|img| img.dataset_id == dataset_id && img.name == image_name)
        else {
            return Vec::new();
        };
        inner
            .image_labels
            .keys()
            .filter(|(image_id, _)| *image_id == image.id)
            .map(|(_, label_id)| *label_id)
            .collect()
    }

    pub fn association_count(&self) -> usize {
        self.inner().image_labels.len()
    }

    /// Chunk transactions committed so far.
    pub fn committed_chunks(&self) -> u64 {
        self.inner().committed_chunks
    }

    /// Fail the chunk transaction that follows the `commits`-th commit, once,
    /// as if the database dropped out mid-run.
    pub fn fail_chunk_after(&self, commits: u64) {
        self.inner().fail_after = Some(commits);
    }

    /// Toggle whole-store unavailability for health and transient-error paths.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner().unavailable = unavailable;
    }
}

#[async_trait]
impl DatasetStore for MemoryStore {
    async fn health_check(&self) -> Result<(), StoreError> {
        self.inner().check_available()
    }

    async fn create_dataset(
        &self,
        dataset: NewDataset,
        now: DateTime<Utc>,
    ) -> Result<Dataset, StoreError> {
        let mut inner = self.inner();
        inner.check_available()?;
        let dataset = Dataset {
            id: inner.next_id(),
            owner_id: dataset.owner_id,
            name: dataset.name,
            description: dataset.description,
            share_mode: dataset.share_mode,
            created_at: now,
            modified_at: now,
        };
        inner.datasets.insert(dataset.id, dataset.clone());
        Ok(dataset)
    }

    async fn get_dataset(&self, dataset_id: i64) -> Result<Option<Dataset>, StoreError> {
        let inner = self.inner();
        inner.check_available()?;
        Ok(inner.datasets.get(&dataset_id).cloned())
    }

    async fn get_label(&self, label_id: i64) -> Result<Option<Label>, StoreError> {
        let inner = self.inner();
        inner.check_available()?;
        Ok(inner.labels.get(&label_id).cloned())
    }

    async fn apply_chunk(
        &self,
        dataset_id: i64,
        mutation: &Mutation,
        names: &[String],
        checkpoint: Option<ChunkCheckpoint>,
    ) -> Result<ChunkOutcome, StoreError> {
        let mut inner = self.inner();
        inner.check_available()?;
        if inner.fail_after == Some(inner.committed_chunks) {
            inner.fail_after = None;
            return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
        }
        // Validate the claim before touching anything so a rejected chunk leaves no trace.
        if let Some(checkpoint) = checkpoint {
            inner.processing_job(checkpoint.claim)?;
        }

        let outcome = match mutation {
            Mutation::AddImages {
                source_dataset_id, ..
            } => {
                let sources = inner.matching_images(*source_dataset_id, names);
                let mut outcome = ChunkOutcome {
                    matched: sources.len() as u64,
                    affected: 0,
                };
                for source in sources {
                    let exists = inner
                        .images
                        .values()
                        .any(|img| img.dataset_id == dataset_id && img.name == source.name);
                    if exists {
                        continue;
                    }
                    let copy_id = inner.next_id();
                    inner.images.insert(
                        copy_id,
                        Image {
                            id: copy_id,
                            dataset_id,
                            ..source.clone()
                        },
                    );
                    let copied: Vec<(i64, i32)> = inner
                        .image_labels
                        .iter()
                        .filter(|((image_id, _), _)| *image_id == source.id)
                        .map(|((_, label_id), value)| (*label_id, *value))
                        .collect();
                    for (label_id, value) in copied {
                        inner.image_labels.entry((copy_id, label_id)).or_insert(value);
                    }
                    outcome.affected += 1;
                }
                outcome
            }
            Mutation::ApplyLabel { label_id, .. } => {
                let targets = inner.matching_images(dataset_id, names);
                let mut affected = 0;
                for image in &targets {
                    if !inner.image_labels.contains_key(&(image.id, *label_id)) {
                        inner.image_labels.insert((image.id, *label_id), 0);
                        affected += 1;
                    }
                }
                ChunkOutcome {
                    matched: targets.len() as u64,
                    affected,
                }
            }
            Mutation::RemoveLabel { label_id, .. } => {
                let targets = inner.matching_images(dataset_id, names);
                let affected = targets
                    .iter()
                    .filter(|image| inner.image_labels.remove(&(image.id, *label_id)).is_some())
                    .count() as u64;
                ChunkOutcome {
                    matched: targets.len() as u64,
                    affected,
                }
            }
        };

        if let Some(checkpoint) = checkpoint {
            let job = inner.processing_job(checkpoint.claim)?;
            job.progress = JobProgress {
                items: checkpoint.before.items + names.len() as u64,
                matched: checkpoint.before.matched + outcome.matched,
            };
        }

        inner.committed_chunks += 1;
        Ok(outcome)
    }

    async fn complete_mutation(
        &self,
        change: NewChange,
        completed_at: DateTime<Utc>,
    ) -> Result<Option<Change>, StoreError> {
        let mut inner = self.inner();
        inner.check_available()?;

        if let Some(dataset) = inner.datasets.get_mut(&change.dataset_id) {
            dataset.modified_at = completed_at;
        }
        let duplicate = change.job_id.is_some()
            && inner.changes.iter().any(|c| c.job_id == change.job_id);
        if duplicate {
            return Ok(None);
        }
        Ok(Some(inner.push_change(change, completed_at)))
    }

    async fn append_change(
        &self,
        change: NewChange,
        now: DateTime<Utc>,
    ) -> Result<Change, StoreError> {
        let mut inner = self.inner();
        inner.check_available()?;
        Ok(inner.push_change(change, now))
    }

    async fn list_changes(&self, dataset_id: i64) -> Result<Vec<Change>, StoreError> {
        let inner = self.inner();
        inner.check_available()?;
        Ok(inner
            .changes
            .iter()
            .filter(|c| c.dataset_id == dataset_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl LockStore for MemoryStore {
    async fn try_acquire(
        &self,
        dataset_id: i64,
        holder: &LockHolder,
        now: DateTime<Utc>,
        lease_expires_at: DateTime<Utc>,
    ) -> Result<LockAttempt, StoreError> {
        let mut inner = self.inner();
        inner.check_available()?;
        Ok(inner.acquire_lease(dataset_id, holder, now, lease_expires_at))
    }

    async fn renew(
        &self,
        dataset_id: i64,
        holder: &LockHolder,
        lease_expires_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner();
        inner.check_available()?;
        match inner.locks.get_mut(&dataset_id) {
            Some(lock) if lock.holder == *holder => {
                lock.lease_expires_at = lease_expires_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, dataset_id: i64, holder: &LockHolder) -> Result<bool, StoreError> {
        let mut inner = self.inner();
        inner.check_available()?;
        if inner.locks.get(&dataset_id).is_some_and(|l| l.holder == *holder) {
            inner.locks.remove(&dataset_id);
            return Ok(true);
        }
        Ok(false)
    }

    async fn force_release(&self, dataset_id: i64) -> Result<Option<DatasetLock>, StoreError> {
        let mut inner = self.inner();
        inner.check_available()?;
        Ok(inner.locks.remove(&dataset_id))
    }

    async fn current_lock(&self, dataset_id: i64) -> Result<Option<DatasetLock>, StoreError> {
        let inner = self.inner();
        inner.check_available()?;
        Ok(inner.locks.get(&dataset_id).cloned())
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn insert_job(&self, job: NewJob, now: DateTime<Utc>) -> Result<Job, StoreError> {
        let mut inner = self.inner();
        inner.check_available()?;
        Ok(inner.push_job(Uuid::new_v4(), job, now))
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>, StoreError> {
        let inner = self.inner();
        inner.check_available()?;
        Ok(inner.jobs.get(&job_id).cloned())
    }

    async fn claim_next(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
        visibility_deadline: DateTime<Utc>,
    ) -> Result<Option<Job>, StoreError> {
        let mut inner = self.inner();
        inner.check_available()?;

        let next = inner
            .jobs
            .values()
            .filter(|j| j.state == JobState::Enqueued && j.available_at <= now)
            .min_by_key(|j| (j.available_at, j.created_at))
            .map(|j| j.id);
        let Some(job) = next.and_then(|id| inner.jobs.get_mut(&id)) else {
            return Ok(None);
        };

        job.state = JobState::Processing;
        job.attempts += 1;
        job.claimed_by = Some(worker_id.to_string());
        job.claim_token = Some(Uuid::new_v4());
        job.visibility_deadline = Some(visibility_deadline);
        job.updated_at = now;
        Ok(Some(job.clone()))
    }

    async fn mark_succeeded(
        &self,
        claim: ClaimToken,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner();
        inner.check_available()?;
        let job = inner.processing_job(claim)?;
        job.state = JobState::Succeeded;
        job.claim_token = None;
        job.visibility_deadline = None;
        job.last_error = None;
        job.expires_at = Some(expires_at);
        job.updated_at = now;
        Ok(())
    }

    async fn mark_awaiting_retry(
        &self,
        claim: ClaimToken,
        error: &str,
        now: DateTime<Utc>,
        available_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner();
        inner.check_available()?;
        let job = inner.processing_job(claim)?;
        job.state = JobState::AwaitingRetry;
        job.claim_token = None;
        job.visibility_deadline = None;
        job.last_error = Some(error.to_string());
        job.available_at = available_at;
        job.updated_at = now;
        Ok(())
    }

    async fn mark_failed(
        &self,
        claim: ClaimToken,
        error: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner();
        inner.check_available()?;
        let job = inner.processing_job(claim)?;
        job.state = JobState::Failed;
        job.claim_token = None;
        job.visibility_deadline = None;
        job.last_error = Some(error.to_string());
        job.expires_at = Some(expires_at);
        job.updated_at = now;
        Ok(())
    }

    async fn promote_due_retries(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut inner = self.inner();
        inner.check_available()?;
        let mut promoted = 0;
        for job in inner.jobs.values_mut() {
            if job.state == JobState::AwaitingRetry && job.available_at <= now {
                job.state = JobState::Enqueued;
                job.updated_at = now;
                promoted += 1;
            }
        }
        Ok(promoted)
    }

    async fn reclaim_expired(
        &self,
        now: DateTime<Utc>,
        max_attempts: u32,
        failed_expires_at: DateTime<Utc>,
    ) -> Result<ReclaimReport, StoreError> {
        let mut inner = self.inner();
        inner.check_available()?;
        let mut report = ReclaimReport::default();
        for job in inner.jobs.values_mut() {
            let overdue = job.state == JobState::Processing
                && job.visibility_deadline.is_some_and(|deadline| deadline <= now);
            if !overdue {
                continue;
            }
            if job.attempts >= max_attempts {
                job.state = JobState::Failed;
                job.expires_at = Some(failed_expires_at);
                report.failed += 1;
            } else {
                job.state = JobState::Enqueued;
                job.expires_at = None;
                report.requeued += 1;
            }
            job.claim_token = None;
            job.visibility_deadline = None;
            job.available_at = now;
            job.last_error = Some("visibility timeout elapsed".to_string());
            job.updated_at = now;
        }
        Ok(report)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut inner = self.inner();
        inner.check_available()?;
        let before = inner.jobs.len();
        inner
            .jobs
            .retain(|_, job| !job.expires_at.is_some_and(|expires| expires <= now));
        Ok((before - inner.jobs.len()) as u64)
    }

    async fn list_jobs(&self, state: Option<JobState>, limit: i64) -> Result<Vec<Job>, StoreError> {
        let inner = self.inner();
        inner.check_available()?;
        let mut jobs: Vec<Job> = inner
            .jobs
            .values()
            .filter(|j| state.is_none_or(|s| j.state == s))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(jobs)
    }

    async fn count_by_state(&self) -> Result<Vec<(JobState, i64)>, StoreError> {
        let inner = self.inner();
        inner.check_available()?;
        let mut counts: HashMap<JobState, i64> = HashMap::new();
        for job in inner.jobs.values() {
            *counts.entry(job.state).or_default() += 1;
        }
        Ok(counts.into_iter().collect())
    }
}

#[async_trait]
impl ExternalJobStore for MemoryStore {
    async fn register_external_job(
        &self,
        job: NewExternalJob,
        now: DateTime<Utc>,
        lease_expires_at: DateTime<Utc>,
    ) -> Result<Registration, StoreError> {
        let mut inner = self.inner();
        inner.check_available()?;
        if let Some(existing) = inner
            .external_jobs
            .values()
            .find(|existing| existing.external_id == job.external_id)
        {
            return Ok(Registration::Duplicate(existing.clone()));
        }

        let holder = LockHolder::external(&job.external_id);
        if let LockAttempt::Held(lock) =
            inner.acquire_lease(job.dataset_id, &holder, now, lease_expires_at)
        {
            return Ok(Registration::Locked(lock));
        }

        let job = ExternalJob {
            id: inner.next_id(),
            dataset_id: job.dataset_id,
            user_id: job.user_id,
            external_id: job.external_id,
            app_name: job.app_name,
            status: ExternalStatus::Running,
            last_state: None,
            last_status: None,
            reconciled: false,
            started_at: now,
            last_polled_at: None,
            finished_at: None,
            result_job_id: None,
        };
        inner.external_jobs.insert(job.id, job.clone());
        Ok(Registration::Registered(job))
    }

    async fn list_unreconciled(&self) -> Result<Vec<ExternalJob>, StoreError> {
        let inner = self.inner();
        inner.check_available()?;
        Ok(inner
            .external_jobs
            .values()
            .filter(|j| !j.reconciled)
            .cloned()
            .collect())
    }

    async fn record_poll(
        &self,
        id: i64,
        report: &StatusReport,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner();
        inner.check_available()?;
        if let Some(job) = inner.external_jobs.get_mut(&id).filter(|j| !j.reconciled) {
            job.last_state = Some(report.state.clone());
            job.last_status = Some(report.detail.clone());
            job.last_polled_at = Some(now);
        }
        Ok(())
    }

    async fn reconcile(
        &self,
        id: i64,
        report: &StatusReport,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, StoreError> {
        let mut inner = self.inner();
        inner.check_available()?;

        let result_job_id = Uuid::new_v4();
        let Some(job) = inner.external_jobs.get_mut(&id).filter(|j| !j.reconciled) else {
            return Ok(None);
        };
        job.status = report.status;
        job.last_state = Some(report.state.clone());
        job.last_status = Some(report.detail.clone());
        job.last_polled_at = Some(now);
        job.finished_at = Some(now);
        job.reconciled = true;
        job.result_job_id = Some(result_job_id);
        let job = job.clone();

        let kind = match report.status {
            ExternalStatus::Succeeded => ChangeKind::ExternalJobSucceeded,
            _ => ChangeKind::ExternalJobFailed,
        };
        inner.push_change(
            NewChange {
                dataset_id: job.dataset_id,
                user_id: job.user_id.clone(),
                kind,
                summary: reconcile_summary(&job, report),
                job_id: None,
            },
            now,
        );
        let follow_up = inner.push_job(result_job_id, job.output_job(), now);

        let holder = job.lock_holder();
        if inner
            .locks
            .get(&job.dataset_id)
            .is_some_and(|l| l.holder == holder)
        {
            inner.locks.remove(&job.dataset_id);
        }
        Ok(Some(follow_up))
    }

    async fn purge_reconciled(&self, finished_before: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut inner = self.inner();
        inner.check_available()?;
        let before = inner.external_jobs.len();
        inner.external_jobs.retain(|_, job| {
            !(job.reconciled && job.finished_at.is_some_and(|finished| finished <= finished_before))
        });
        Ok((before - inner.external_jobs.len()) as u64)
    }
}
