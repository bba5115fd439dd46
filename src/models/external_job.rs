use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use uuid::Uuid;

use crate::models::dataset::LockHolder;
use crate::models::job::{ExternalOutput, JobPayload, NewJob};

/// Coarse status of a process in the external pipeline.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, EnumString, Display, AsRefStr, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ExternalStatus {
    Running,
    Succeeded,
    Failed,
}

impl ExternalStatus {
    /// Map the pipeline's task state. Anything not known to be in flight or
    /// successful counts as a failure.
    pub fn from_pipeline_state(state: &str) -> Self {
        match state.to_ascii_uppercase().as_str() {
            "PENDING" | "STARTED" | "RUNNING" | "RETRY" => ExternalStatus::Running,
            "SUCCESS" | "SUCCEEDED" | "COMPLETED" => ExternalStatus::Succeeded,
            _ => ExternalStatus::Failed,
        }
    }

    pub fn is_terminal(self) -> bool {
        self != ExternalStatus::Running
    }
}

/// Handle on a long-running external process working on a dataset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalJob {
    pub id: i64,
    pub dataset_id: i64,
    pub user_id: String,
    pub external_id: String,
    pub app_name: String,
    pub status: ExternalStatus,
    /// Raw state/status strings from the last successful poll.
    pub last_state: Option<String>,
    pub last_status: Option<String>,
    pub reconciled: bool,
    pub started_at: DateTime<Utc>,
    pub last_polled_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Queue job collecting the output, set on reconcile.
    pub result_job_id: Option<Uuid>,
}

impl ExternalJob {
    pub fn lock_holder(&self) -> LockHolder {
        LockHolder::external(&self.external_id)
    }

    /// Queue job that collects this handle's output once it finished.
    pub fn output_job(&self) -> NewJob {
        NewJob {
            dataset_id: self.dataset_id,
            user_id: self.user_id.clone(),
            payload: JobPayload::ExternalOutput(ExternalOutput {
                external_job_id: self.id,
                external_id: self.external_id.clone(),
                app_name: self.app_name.clone(),
                status: self.status,
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewExternalJob {
    pub dataset_id: i64,
    pub user_id: String,
    pub external_id: String,
    pub app_name: String,
}

/// Status report returned by the pipeline for one external id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub status: ExternalStatus,
    pub state: String,
    pub detail: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_flight_states() {
        for state in ["PENDING", "STARTED", "RUNNING", "running"] {
            assert_eq!(ExternalStatus::from_pipeline_state(state), ExternalStatus::Running);
        }
    }

    #[test]
    fn test_terminal_states() {
        assert_eq!(ExternalStatus::from_pipeline_state("SUCCESS"), ExternalStatus::Succeeded);
        assert_eq!(ExternalStatus::from_pipeline_state("FAILURE"), ExternalStatus::Failed);
        assert_eq!(ExternalStatus::from_pipeline_state("REVOKED"), ExternalStatus::Failed);
        assert!(ExternalStatus::Failed.is_terminal());
        assert!(!ExternalStatus::Running.is_terminal());
    }
}
