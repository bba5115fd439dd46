use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use garde::Validate;
use serde_json::{json, Value};

use crate::app_state::AppState;
use crate::db::store::Registration;
use crate::error::CoreError;
use crate::models::change::{ChangeKind, NewChange};
use crate::models::dataset::{Dataset, NewDataset};
use crate::models::external_job::{ExternalJob, NewExternalJob};
use crate::models::job::NewJob;
use crate::models::mutation::Mutation;
use crate::models::requests::{
    AddImagesRequest, CreateDatasetRequest, DatasetResponse, EnqueuedResponse, LabelImagesRequest,
    MutationResponse, RegisterExternalJobRequest,
};
use crate::routes::auth::{AdminUser, AuthUser};

/// POST /datasets: Create a dataset owned by the caller.
pub async fn create_dataset(
    State(state): State<AppState>,
    user: AuthUser,
    Json(req): Json<CreateDatasetRequest>,
) -> Result<(StatusCode, Json<Dataset>), CoreError> {
    req.validate()?;

    let dataset = state
        .datasets
        .create_dataset(
            NewDataset {
                owner_id: user.user_id,
                name: req.name,
                description: req.description,
                share_mode: req.share_mode,
            },
            state.clock.now(),
        )
        .await?;

    tracing::info!(dataset_id = dataset.id, owner_id = %dataset.owner_id, "Dataset created");
    Ok((StatusCode::CREATED, Json(dataset)))
}

/// GET /datasets/{id}: Dataset with its current lock.
pub async fn get_dataset(
    State(state): State<AppState>,
    user: AuthUser,
    Path(dataset_id): Path<i64>,
) -> Result<Json<DatasetResponse>, CoreError> {
    let dataset = find_dataset(&state, dataset_id).await?;
    if !dataset.can_read(&user.user_id) && !user.is_admin {
        return Err(CoreError::Permission { dataset_id });
    }
    let lock = state.locks.current(dataset_id).await?;
    Ok(Json(DatasetResponse { dataset, lock }))
}

/// POST /datasets/{id}/add-images
pub async fn add_images(
    State(state): State<AppState>,
    user: AuthUser,
    Path(dataset_id): Path<i64>,
    Json(req): Json<AddImagesRequest>,
) -> Result<Json<MutationResponse>, CoreError> {
    req.validate()?;
    let mutation = Mutation::AddImages {
        source_dataset_id: req.source_dataset_id,
        image_names: req.image_names,
    };
    run_mutation(&state, &user, dataset_id, mutation).await
}

/// POST /datasets/{id}/image-labels/apply
pub async fn apply_label(
    State(state): State<AppState>,
    user: AuthUser,
    Path(dataset_id): Path<i64>,
    Json(req): Json<LabelImagesRequest>,
) -> Result<Json<MutationResponse>, CoreError> {
    req.validate()?;
    let mutation = Mutation::ApplyLabel {
        label_id: req.label_id,
        image_names: req.image_names,
    };
    run_mutation(&state, &user, dataset_id, mutation).await
}

/// POST /datasets/{id}/image-labels/remove
pub async fn remove_label(
    State(state): State<AppState>,
    user: AuthUser,
    Path(dataset_id): Path<i64>,
    Json(req): Json<LabelImagesRequest>,
) -> Result<Json<MutationResponse>, CoreError> {
    req.validate()?;
    let mutation = Mutation::RemoveLabel {
        label_id: req.label_id,
        image_names: req.image_names,
    };
    run_mutation(&state, &user, dataset_id, mutation).await
}

async fn run_mutation(
    state: &AppState,
    user: &AuthUser,
    dataset_id: i64,
    mutation: Mutation,
) -> Result<Json<MutationResponse>, CoreError> {
    let report = state
        .mutations
        .execute(dataset_id, &user.user_id, &mutation, &state.shutdown)
        .await?;

    Ok(Json(MutationResponse {
        dataset_id,
        requested: report.requested,
        matched: report.matched,
        affected: report.affected,
        chunks: report.chunks,
        change_id: report.change.map(|c| c.id),
    }))
}

/// POST /datasets/{id}/jobs: Run a mutation in the background.
pub async fn enqueue_job(
    State(state): State<AppState>,
    user: AuthUser,
    Path(dataset_id): Path<i64>,
    Json(mutation): Json<Mutation>,
) -> Result<(StatusCode, Json<EnqueuedResponse>), CoreError> {
    state
        .mutations
        .check(dataset_id, &user.user_id, &mutation)
        .await?;

    let job = state
        .queue
        .enqueue(NewJob {
            dataset_id,
            user_id: user.user_id,
            payload: mutation.into(),
        })
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(EnqueuedResponse {
            job_id: job.id,
            state: job.state,
        }),
    ))
}

/// POST /datasets/{id}/external-jobs: Track a submitted pipeline job; it holds the dataset lock until reconciled.
pub async fn register_external_job(
    State(state): State<AppState>,
    user: AuthUser,
    Path(dataset_id): Path<i64>,
    Json(req): Json<RegisterExternalJobRequest>,
) -> Result<(StatusCode, Json<ExternalJob>), CoreError> {
    req.validate()?;

    let dataset = find_dataset(&state, dataset_id).await?;
    if !dataset.can_write(&user.user_id) {
        return Err(CoreError::Permission { dataset_id });
    }

    let registration = state
        .external_jobs
        .register_external_job(
            NewExternalJob {
                dataset_id,
                user_id: user.user_id,
                external_id: req.external_id,
                app_name: req.app_name,
            },
            state.clock.now(),
            state.locks.lease_deadline(),
        )
        .await?;

    match registration {
        Registration::Registered(job) => {
            tracing::info!(dataset_id, external_id = %job.external_id, "External job registered");
            Ok((StatusCode::CREATED, Json(job)))
        }
        Registration::Locked(lock) => Err(CoreError::LockedDataset {
            dataset_id,
            holder: lock.holder,
        }),
        Registration::Duplicate(existing) => Err(CoreError::Conflict(format!(
            "external job {} is already tracked on dataset {}",
            existing.external_id, existing.dataset_id
        ))),
    }
}

/// DELETE /datasets/{id}/lock: Operator release of an orphaned lock.
pub async fn force_unlock(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    Path(dataset_id): Path<i64>,
) -> Result<Json<Value>, CoreError> {
    find_dataset(&state, dataset_id).await?;

    let released = state
        .locks
        .force_release(dataset_id)
        .await?
        .ok_or_else(|| CoreError::not_found("Lock on dataset", dataset_id))?;

    state
        .datasets
        .append_change(
            NewChange {
                dataset_id,
                user_id: admin.user_id,
                kind: ChangeKind::ForceUnlock,
                summary: format!("Lock held by {} released by operator", released.holder),
                job_id: None,
            },
            state.clock.now(),
        )
        .await?;

    Ok(Json(json!({ "released": released })))
}

async fn find_dataset(state: &AppState, dataset_id: i64) -> Result<Dataset, CoreError> {
    state
        .datasets
        .get_dataset(dataset_id)
        .await?
        .ok_or_else(|| CoreError::not_found("Dataset", dataset_id))
}
