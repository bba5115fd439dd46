use axum::routing::{delete, get, post};
use axum::Router;

use crate::app_state::AppState;

pub mod auth;
pub mod datasets;
pub mod health;
pub mod jobs;
pub mod metrics;

/// API routes. The binary adds `/metrics` and the tower-http layers.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/datasets", post(datasets::create_dataset))
        .route("/datasets/{id}", get(datasets::get_dataset))
        .route("/datasets/{id}/add-images", post(datasets::add_images))
        .route("/datasets/{id}/image-labels/apply", post(datasets::apply_label))
        .route("/datasets/{id}/image-labels/remove", post(datasets::remove_label))
        .route("/datasets/{id}/jobs", post(datasets::enqueue_job))
        .route(
            "/datasets/{id}/external-jobs",
            post(datasets::register_external_job),
        )
        .route("/datasets/{id}/lock", delete(datasets::force_unlock))
        .route("/jobs", get(jobs::list_jobs))
        .route("/jobs/{id}", get(jobs::get_job))
        .with_state(state)
}
