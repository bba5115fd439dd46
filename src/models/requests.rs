use garde::Validate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::dataset::{Dataset, DatasetLock, ShareMode};
use crate::models::job::{Job, JobState};

/// POST /datasets
#[derive(Debug, Deserialize, Validate)]
pub struct CreateDatasetRequest {
    #[garde(length(min = 1, max = 200))]
    pub name: String,

    #[garde(length(max = 2000))]
    #[serde(default)]
    pub description: String,

    #[garde(skip)]
    #[serde(default)]
    pub share_mode: ShareMode,
}

/// POST /datasets/{id}/add-images
#[derive(Debug, Deserialize, Validate)]
pub struct AddImagesRequest {
    #[garde(skip)]
    pub source_dataset_id: i64,

    #[garde(length(min = 1), inner(length(min = 1, max = 255)))]
    pub image_names: Vec<String>,
}

/// POST /datasets/{id}/image-labels/apply and /remove
#[derive(Debug, Deserialize, Validate)]
pub struct LabelImagesRequest {
    #[garde(skip)]
    pub label_id: i64,

    #[garde(length(min = 1), inner(length(min = 1, max = 255)))]
    pub image_names: Vec<String>,
}

/// POST /datasets/{id}/external-jobs
#[derive(Debug, Deserialize, Validate)]
pub struct RegisterExternalJobRequest {
    #[garde(length(min = 1, max = 200))]
    pub external_id: String,

    #[garde(length(min = 1, max = 100))]
    pub app_name: String,
}

#[derive(Debug, Serialize)]
pub struct DatasetResponse {
    #[serde(flatten)]
    pub dataset: Dataset,
    pub lock: Option<DatasetLock>,
}

/// Response after a synchronous mutation.
#[derive(Debug, Serialize)]
pub struct MutationResponse {
    pub dataset_id: i64,
    pub requested: u64,
    pub matched: u64,
    pub affected: u64,
    pub chunks: u64,
    pub change_id: Option<i64>,
}

/// Query string for the job dashboard.
#[derive(Debug, Deserialize)]
pub struct JobListQuery {
    pub state: Option<JobState>,
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct StateCount {
    pub state: JobState,
    pub count: i64,
}

/// Read-only dashboard view over the queue.
#[derive(Debug, Serialize)]
pub struct JobDashboardResponse {
    pub counts: Vec<StateCount>,
    pub jobs: Vec<Job>,
}

#[derive(Debug, Serialize)]
pub struct EnqueuedResponse {
    pub job_id: Uuid,
    pub state: JobState,
}
