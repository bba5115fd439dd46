use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use uuid::Uuid;

use crate::models::job::ClaimToken;

/// Who besides the owner may see or change a dataset.
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, EnumString, Display, AsRefStr, PartialEq, Eq,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ShareMode {
    #[default]
    Private,
    ReadOnly,
    ReadWrite,
}

/// A curated collection of images owned by one user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dataset {
    pub id: i64,
    pub owner_id: String,
    pub name: String,
    pub description: String,
    pub share_mode: ShareMode,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl Dataset {
    /// Owners always write; everyone else only on ReadWrite datasets.
    pub fn can_write(&self, user_id: &str) -> bool {
        self.owner_id == user_id || self.share_mode == ShareMode::ReadWrite
    }

    pub fn can_read(&self, user_id: &str) -> bool {
        self.owner_id == user_id || self.share_mode != ShareMode::Private
    }
}

#[derive(Debug, Clone)]
pub struct NewDataset {
    pub owner_id: String,
    pub name: String,
    pub description: String,
    pub share_mode: ShareMode,
}

/// An image row. Names are unique within a dataset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Image {
    pub id: i64,
    pub dataset_id: i64,
    pub name: String,
    pub path: String,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct NewImage {
    pub dataset_id: i64,
    pub name: String,
    pub path: String,
    pub metadata: serde_json::Value,
}

/// Global label catalog entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Label {
    pub id: i64,
    pub name: String,
    pub color: String,
}

/// Identity of whoever holds a dataset lock lease.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LockHolder(String);

impl LockHolder {
    /// A synchronous API request; unique per call.
    pub fn request() -> Self {
        Self(format!("request:{}", Uuid::new_v4()))
    }

    /// A background job, keyed on its claim. A worker whose claim was
    /// reclaimed can then only release its own lease, never its successor's.
    pub fn job(claim: ClaimToken) -> Self {
        Self(format!("job:{}:{}", claim.job_id, claim.token))
    }

    /// A long-running process in the external pipeline.
    pub fn external(external_id: &str) -> Self {
        Self(format!("external:{external_id}"))
    }

    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for LockHolder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Persisted lease on a dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetLock {
    pub dataset_id: i64,
    pub holder: LockHolder,
    pub acquired_at: DateTime<Utc>,
    pub lease_expires_at: DateTime<Utc>,
}

impl DatasetLock {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.lease_expires_at <= now
    }
}
