use garde::Validate;
use serde::{Deserialize, Serialize};

use crate::models::change::ChangeKind;

/// A batched structural change to a dataset's images or labels.
///
/// The same value is accepted synchronously by the API and persisted as a
/// background job payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Mutation {
    /// Copy images (with their labels) from another dataset by name.
    AddImages {
        #[garde(skip)]
        source_dataset_id: i64,
        #[garde(length(min = 1), inner(length(min = 1, max = 255)))]
        image_names: Vec<String>,
    },
    ApplyLabel {
        #[garde(skip)]
        label_id: i64,
        #[garde(length(min = 1), inner(length(min = 1, max = 255)))]
        image_names: Vec<String>,
    },
    RemoveLabel {
        #[garde(skip)]
        label_id: i64,
        #[garde(length(min = 1), inner(length(min = 1, max = 255)))]
        image_names: Vec<String>,
    },
}

impl Mutation {
    pub fn image_names(&self) -> &[String] {
        match self {
            Mutation::AddImages { image_names, .. }
            | Mutation::ApplyLabel { image_names, .. }
            | Mutation::RemoveLabel { image_names, .. } => image_names,
        }
    }

    pub fn change_kind(&self) -> ChangeKind {
        match self {
            Mutation::AddImages { .. } => ChangeKind::AddImage,
            Mutation::ApplyLabel { .. } => ChangeKind::ApplyLabel,
            Mutation::RemoveLabel { .. } => ChangeKind::RemoveLabel,
        }
    }

    /// Label id for the label variants.
    pub fn label_id(&self) -> Option<i64> {
        match self {
            Mutation::ApplyLabel { label_id, .. } | Mutation::RemoveLabel { label_id, .. } => {
                Some(*label_id)
            }
            Mutation::AddImages { .. } => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Mutation::AddImages { .. } => "add_images",
            Mutation::ApplyLabel { .. } => "apply_label",
            Mutation::RemoveLabel { .. } => "remove_label",
        }
    }
}

/// Result of one chunk's transaction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkOutcome {
    /// Requested names that resolved to an image row.
    pub matched: u64,
    /// Rows inserted or deleted.
    pub affected: u64,
}
