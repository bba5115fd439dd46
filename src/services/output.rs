//! Output collection for reconciled external pipeline jobs.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::db::store::DatasetStore;
use crate::error::StoreError;
use crate::models::change::{Change, ChangeKind, NewChange};
use crate::models::job::{ExternalOutput, Job};
use crate::services::clock::Clock;
use crate::services::pipeline::{PipelineClient, PipelineError};

pub const OUTPUT_ARCHIVE: &str = "output.tar.gz";

#[derive(Debug, thiserror::Error)]
pub enum OutputError {
    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("Storage error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct CollectedOutput {
    pub path: PathBuf,
    pub bytes: u64,
    /// `None` when a retried job already wrote its change.
    pub change: Option<Change>,
}

/// Downloads a finished pipeline job's archive into dataset storage.
#[derive(Clone)]
pub struct OutputCollector {
    pipeline: Arc<dyn PipelineClient>,
    datasets: Arc<dyn DatasetStore>,
    clock: Arc<dyn Clock>,
    storage_root: PathBuf,
}

impl OutputCollector {
    pub fn new(
        pipeline: Arc<dyn PipelineClient>,
        datasets: Arc<dyn DatasetStore>,
        clock: Arc<dyn Clock>,
        storage_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            pipeline,
            datasets,
            clock,
            storage_root: storage_root.into(),
        }
    }

    /// `{root}/datasets/{dataset_id}/pipeline/jobs/{external_job_id}`
    pub fn job_dir(&self, dataset_id: i64, external_job_id: i64) -> PathBuf {
        self.storage_root
            .join("datasets")
            .join(dataset_id.to_string())
            .join("pipeline")
            .join("jobs")
            .join(external_job_id.to_string())
    }

    pub async fn collect(
        &self,
        job: &Job,
        output: &ExternalOutput,
    ) -> Result<CollectedOutput, OutputError> {
        let dir = self.job_dir(job.dataset_id, output.external_job_id);
        tokio::fs::create_dir_all(&dir).await?;

        let archive = self.pipeline.download_output(&output.external_id).await?;
        let path = dir.join(OUTPUT_ARCHIVE);
        write_replacing(&path, &archive).await?;
        let bytes = archive.len() as u64;

        let change = self
            .datasets
            .complete_mutation(
                NewChange {
                    dataset_id: job.dataset_id,
                    user_id: job.user_id.clone(),
                    kind: ChangeKind::ExternalOutputCollected,
                    summary: format!(
                        "{} job {} output stored ({} bytes, {})",
                        output.app_name, output.external_id, bytes, output.status
                    ),
                    job_id: Some(job.id),
                },
                self.clock.now(),
            )
            .await?;

        metrics::counter!("external_outputs_collected_total").increment(1);
        tracing::info!(
            job_id = %job.id,
            dataset_id = job.dataset_id,
            external_id = %output.external_id,
            bytes,
            path = %path.display(),
            "External job output stored"
        );

        Ok(CollectedOutput {
            path,
            bytes,
            change,
        })
    }
}

/// Readers never see a half-written archive; a retry overwrites the last one.
async fn write_replacing(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let partial = path.with_extension("part");
    tokio::fs::write(&partial, bytes).await?;
    tokio::fs::rename(&partial, path).await
}
