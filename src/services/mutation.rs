//! Mutation Applier: AddImages / ApplyLabel / RemoveLabel over the Batch Cursor.

use std::sync::Arc;

use garde::Validate;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::db::store::{ChunkCheckpoint, DatasetStore};
use crate::error::CoreError;
use crate::models::change::{Change, NewChange};
use crate::models::dataset::{Dataset, Label, LockHolder};
use crate::models::job::{Job, JobPayload, JobProgress};
use crate::models::mutation::Mutation;
use crate::services::batch::BatchCursor;
use crate::services::clock::Clock;
use crate::services::lock::LockGuard;

/// Items per chunk transaction.
pub const LABELING_BATCH_SIZE: usize = 250;

/// Outcome of a whole mutation invocation.
#[derive(Debug, Clone)]
pub struct MutationReport {
    pub dataset_id: i64,
    pub requested: u64,
    pub matched: u64,
    /// Rows inserted or deleted by chunks committed during this run.
    pub affected: u64,
    /// Chunks committed during this run.
    pub chunks: u64,
    /// `None` when a retried job already wrote its change.
    pub change: Option<Change>,
}

/// What a mutation was checked against before any chunk runs.
#[derive(Debug, Clone)]
pub struct MutationTarget {
    pub dataset: Dataset,
    pub label: Option<Label>,
}

/// A background job's claim and checkpoint, threaded into every chunk.
#[derive(Debug, Clone, Copy)]
struct Resume {
    job_id: Uuid,
    checkpoint: ChunkCheckpoint,
}

#[derive(Clone)]
pub struct MutationService {
    datasets: Arc<dyn DatasetStore>,
    locks: LockGuard,
    clock: Arc<dyn Clock>,
    batch_size: usize,
}

impl MutationService {
    pub fn new(
        datasets: Arc<dyn DatasetStore>,
        locks: LockGuard,
        clock: Arc<dyn Clock>,
        batch_size: usize,
    ) -> Self {
        Self {
            datasets,
            locks,
            clock,
            batch_size: batch_size.max(1),
        }
    }

    /// Validate, resolve and authorize a mutation without touching any rows.
    pub async fn check(
        &self,
        dataset_id: i64,
        user_id: &str,
        mutation: &Mutation,
    ) -> Result<MutationTarget, CoreError> {
        mutation.validate()?;

        let dataset = self
            .datasets
            .get_dataset(dataset_id)
            .await?
            .ok_or_else(|| CoreError::not_found("Dataset", dataset_id))?;
        if !dataset.can_write(user_id) {
            return Err(CoreError::Permission { dataset_id });
        }

        let label = match mutation {
            Mutation::AddImages {
                source_dataset_id, ..
            } => {
                let source = self
                    .datasets
                    .get_dataset(*source_dataset_id)
                    .await?
                    .ok_or_else(|| CoreError::not_found("Dataset", source_dataset_id))?;
                if !source.can_read(user_id) {
                    return Err(CoreError::Permission {
                        dataset_id: *source_dataset_id,
                    });
                }
                None
            }
            Mutation::ApplyLabel { label_id, .. } | Mutation::RemoveLabel { label_id, .. } => Some(
                self.datasets
                    .get_label(*label_id)
                    .await?
                    .ok_or_else(|| CoreError::not_found("Label", label_id))?,
            ),
        };

        Ok(MutationTarget { dataset, label })
    }

    /// Run a mutation on behalf of an API request.
    pub async fn execute(
        &self,
        dataset_id: i64,
        user_id: &str,
        mutation: &Mutation,
        cancel: &CancellationToken,
    ) -> Result<MutationReport, CoreError> {
        let target = self.check(dataset_id, user_id, mutation).await?;
        let holder = LockHolder::request();
        self.locks
            .with_lock(dataset_id, &holder, || {
                self.apply(&target, user_id, mutation, None, cancel)
            })
            .await
    }

    /// Run a claimed background job, resuming from its persisted checkpoint.
    pub async fn execute_job(
        &self,
        job: &Job,
        cancel: &CancellationToken,
    ) -> Result<MutationReport, CoreError> {
        let JobPayload::Mutation(mutation) = &job.payload else {
            return Err(CoreError::Validation(format!(
                "job {} is not a dataset mutation",
                job.id
            )));
        };
        let claim = job.claim().ok_or_else(|| {
            CoreError::Validation(format!("job {} is not claimed", job.id))
        })?;
        let target = self.check(job.dataset_id, &job.user_id, mutation).await?;
        let resume = Resume {
            job_id: job.id,
            checkpoint: ChunkCheckpoint {
                claim,
                before: job.progress,
            },
        };

        let holder = LockHolder::job(claim);
        self.locks
            .with_lock(job.dataset_id, &holder, || {
                self.apply(&target, &job.user_id, mutation, Some(resume), cancel)
            })
            .await
    }

    async fn apply(
        &self,
        target: &MutationTarget,
        user_id: &str,
        mutation: &Mutation,
        resume: Option<Resume>,
        cancel: &CancellationToken,
    ) -> Result<MutationReport, CoreError> {
        let dataset_id = target.dataset.id;
        let names = mutation.image_names();
        let mut progress = resume
            .map(|r| r.checkpoint.before)
            .unwrap_or_default();
        let mut cursor = BatchCursor::resume(names, self.batch_size, progress.items as usize);
        let mut affected = 0;
        let mut chunks = 0;

        if progress.items > 0 {
            tracing::info!(dataset_id, processed = progress.items, "Resuming mutation from checkpoint");
        }

        while let Some(chunk) = cursor.next_chunk() {
            if cancel.is_cancelled() {
                tracing::info!(dataset_id, processed = cursor.processed(), "Mutation cancelled between chunks");
                return Err(CoreError::Cancelled);
            }

            let checkpoint = resume.map(|r| ChunkCheckpoint {
                before: progress,
                ..r.checkpoint
            });
            let outcome = self
                .datasets
                .apply_chunk(dataset_id, mutation, chunk, checkpoint)
                .await?;

            cursor.advance(chunk.len());
            progress = JobProgress {
                items: cursor.processed() as u64,
                matched: progress.matched + outcome.matched,
            };
            affected += outcome.affected;
            chunks += 1;
            metrics::counter!("dataset_mutation_chunks_total", "kind" => mutation.name())
                .increment(1);
            tracing::debug!(
                dataset_id,
                kind = mutation.name(),
                processed = cursor.processed(),
                matched = outcome.matched,
                affected = outcome.affected,
                "Chunk committed"
            );
        }

        let change = self
            .datasets
            .complete_mutation(
                NewChange {
                    dataset_id,
                    user_id: user_id.to_string(),
                    kind: mutation.change_kind(),
                    summary: summarize(mutation, progress.matched, target.label.as_ref()),
                    job_id: resume.map(|r| r.job_id),
                },
                self.clock.now(),
            )
            .await?;

        metrics::counter!("dataset_mutations_total", "kind" => mutation.name()).increment(1);
        tracing::info!(
            dataset_id,
            kind = mutation.name(),
            requested = names.len(),
            matched = progress.matched,
            chunks,
            "Mutation completed"
        );

        Ok(MutationReport {
            dataset_id,
            requested: names.len() as u64,
            matched: progress.matched,
            affected,
            chunks,
            change,
        })
    }
}

fn summarize(mutation: &Mutation, matched: u64, label: Option<&Label>) -> String {
    let label_name = label.map(|l| l.name.as_str()).unwrap_or_default();
    match mutation {
        Mutation::AddImages {
            source_dataset_id, ..
        } => format!("{matched} images added from dataset {source_dataset_id}"),
        Mutation::ApplyLabel { .. } => format!("{matched} images, label {label_name}"),
        Mutation::RemoveLabel { .. } => format!("{matched} images, label {label_name} removed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summaries() {
        let label = Label {
            id: 1,
            name: "L".to_string(),
            color: "#fff".to_string(),
        };
        let apply = Mutation::ApplyLabel {
            label_id: 1,
            image_names: vec!["a".into()],
        };
        assert_eq!(summarize(&apply, 5, Some(&label)), "5 images, label L");

        let add = Mutation::AddImages {
            source_dataset_id: 9,
            image_names: vec!["a".into()],
        };
        assert_eq!(summarize(&add, 2, None), "2 images added from dataset 9");
    }
}
