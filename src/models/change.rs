use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, EnumString, Display, AsRefStr, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ChangeKind {
    AddImage,
    ApplyLabel,
    RemoveLabel,
    ExternalJobSucceeded,
    ExternalJobFailed,
    ExternalOutputCollected,
    ForceUnlock,
}

/// Append-only audit record. Never updated or deleted once written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Change {
    pub id: i64,
    pub dataset_id: i64,
    pub user_id: String,
    pub kind: ChangeKind,
    pub summary: String,
    /// Set when the change was produced by a background job; at most one change per job.
    pub job_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewChange {
    pub dataset_id: i64,
    pub user_id: String,
    pub kind: ChangeKind,
    pub summary: String,
    pub job_id: Option<Uuid>,
}
