use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use uuid::Uuid;

use crate::models::dataset::LockHolder;

/// Failures from the storage layer.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    /// The caller's claim on the job was reclaimed by the visibility timeout.
    #[error("Claim on job {job_id} is no longer held")]
    ClaimLost { job_id: Uuid },

    #[error("Corrupt row: {0}")]
    Corrupt(String),
}

/// Domain errors surfaced to API callers and job handlers.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Permission denied on dataset {dataset_id}")]
    Permission { dataset_id: i64 },

    #[error("Dataset {dataset_id} is locked by {holder}")]
    LockedDataset { dataset_id: i64, holder: LockHolder },

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Store unavailable: {0}")]
    Store(#[from] StoreError),

    #[error("Queue unavailable: {0}")]
    Queue(String),

    #[error("Operation cancelled")]
    Cancelled,
}

impl CoreError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        CoreError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            CoreError::Permission { .. } => (StatusCode::FORBIDDEN, "permission"),
            CoreError::LockedDataset { .. } => (StatusCode::CONFLICT, "locked_dataset"),
            CoreError::NotFound { .. } => (StatusCode::NOT_FOUND, "not_found"),
            CoreError::Validation(_) => (StatusCode::UNPROCESSABLE_ENTITY, "validation"),
            CoreError::Conflict(_) => (StatusCode::CONFLICT, "conflict"),
            CoreError::Store(_) => (StatusCode::SERVICE_UNAVAILABLE, "store_unavailable"),
            CoreError::Queue(_) => (StatusCode::SERVICE_UNAVAILABLE, "queue_unavailable"),
            CoreError::Cancelled => (StatusCode::SERVICE_UNAVAILABLE, "cancelled"),
        }
    }
}

impl From<garde::Report> for CoreError {
    fn from(report: garde::Report) -> Self {
        CoreError::Validation(report.to_string())
    }
}

impl IntoResponse for CoreError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }
        (status, Json(json!({ "error": code, "message": self.to_string() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (CoreError::Permission { dataset_id: 1 }, StatusCode::FORBIDDEN),
            (
                CoreError::LockedDataset {
                    dataset_id: 1,
                    holder: LockHolder::from_raw("job:x"),
                },
                StatusCode::CONFLICT,
            ),
            (CoreError::not_found("Label", 3), StatusCode::NOT_FOUND),
            (CoreError::Validation("bad".into()), StatusCode::UNPROCESSABLE_ENTITY),
            (CoreError::Conflict("again".into()), StatusCode::CONFLICT),
            (CoreError::Cancelled, StatusCode::SERVICE_UNAVAILABLE),
        ];
        for (error, expected) in cases {
            assert_eq!(error.into_response().status(), expected);
        }
    }

    #[test]
    fn test_not_found_message() {
        assert_eq!(CoreError::not_found("Dataset", 42).to_string(), "Dataset 42 not found");
    }
}
