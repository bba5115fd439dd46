use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumIter, EnumString};
use uuid::Uuid;

use crate::models::external_job::ExternalStatus;
use crate::models::mutation::Mutation;

/// State of a job in the durable queue.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, EnumString, Display, AsRefStr, EnumIter, PartialEq, Eq,
    Hash,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobState {
    Enqueued,
    Processing,
    AwaitingRetry,
    Succeeded,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed)
    }
}

/// Batch Cursor checkpoint persisted with the job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobProgress {
    /// Items covered by committed chunks.
    pub items: u64,
    /// Of those, items that resolved to an image.
    pub matched: u64,
}

/// Follow-up work queued when an external pipeline job is reconciled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalOutput {
    pub external_job_id: i64,
    pub external_id: String,
    pub app_name: String,
    pub status: ExternalStatus,
}

/// What a queued job does.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobPayload {
    Mutation(Mutation),
    ExternalOutput(ExternalOutput),
}

impl JobPayload {
    /// Metric and log label.
    pub fn name(&self) -> &'static str {
        match self {
            JobPayload::Mutation(mutation) => mutation.name(),
            JobPayload::ExternalOutput(_) => "external_output",
        }
    }
}

impl From<Mutation> for JobPayload {
    fn from(mutation: Mutation) -> Self {
        JobPayload::Mutation(mutation)
    }
}

/// A background dataset job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub dataset_id: i64,
    pub user_id: String,
    pub payload: JobPayload,
    pub state: JobState,
    pub attempts: u32,
    pub claimed_by: Option<String>,
    #[serde(skip_serializing)]
    pub claim_token: Option<Uuid>,
    pub visibility_deadline: Option<DateTime<Utc>>,
    pub available_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub progress: JobProgress,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewJob {
    pub dataset_id: i64,
    pub user_id: String,
    pub payload: JobPayload,
}

/// Proof of a live claim. Every transition out of Processing must present it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClaimToken {
    pub job_id: Uuid,
    pub token: Uuid,
}

impl Job {
    pub fn claim(&self) -> Option<ClaimToken> {
        self.claim_token.map(|token| ClaimToken {
            job_id: self.id,
            token,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mutation_payload_keeps_its_kind() {
        let payload = JobPayload::from(Mutation::RemoveLabel {
            label_id: 4,
            image_names: vec!["a".to_string()],
        });
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["type"], "mutation");
        assert_eq!(json["kind"], "remove_label");
        assert_eq!(serde_json::from_value::<JobPayload>(json).unwrap(), payload);
    }

    #[test]
    fn test_external_output_payload() {
        let json = serde_json::json!({
            "type": "external_output",
            "external_job_id": 7,
            "external_id": "j-1",
            "app_name": "sfinder",
            "status": "failed"
        });
        let payload: JobPayload = serde_json::from_value(json).unwrap();
        assert_eq!(payload.name(), "external_output");
        assert!(matches!(
            payload,
            JobPayload::ExternalOutput(ExternalOutput { status: ExternalStatus::Failed, .. })
        ));
    }
}
