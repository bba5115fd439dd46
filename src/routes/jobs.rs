use std::collections::HashMap;

use axum::extract::{Path, Query, State};
use axum::Json;
use strum::IntoEnumIterator;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::error::CoreError;
use crate::models::job::{Job, JobState};
use crate::models::requests::{JobDashboardResponse, JobListQuery, StateCount};
use crate::routes::auth::{AdminUser, AuthUser};

const DEFAULT_LIMIT: i64 = 50;
const MAX_LIMIT: i64 = 500;

/// GET /jobs: Read-only queue dashboard.
pub async fn list_jobs(
    State(state): State<AppState>,
    _admin: AdminUser,
    Query(query): Query<JobListQuery>,
) -> Result<Json<JobDashboardResponse>, CoreError> {
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);

    let counted: HashMap<JobState, i64> = state.queue.counts().await?.into_iter().collect();
    let counts = JobState::iter()
        .map(|s| StateCount {
            state: s,
            count: counted.get(&s).copied().unwrap_or(0),
        })
        .collect();
    let jobs = state.queue.list(query.state, limit).await?;

    Ok(Json(JobDashboardResponse { counts, jobs }))
}

/// GET /jobs/{id}: Job detail for admins and the enqueuing user.
pub async fn get_job(
    State(state): State<AppState>,
    user: AuthUser,
    Path(job_id): Path<Uuid>,
) -> Result<Json<Job>, CoreError> {
    let job = state
        .queue
        .get(job_id)
        .await?
        .filter(|job| user.is_admin || job.user_id == user.user_id)
        .ok_or_else(|| CoreError::not_found("Job", job_id))?;

    Ok(Json(job))
}
