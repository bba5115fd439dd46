//! Shared setup for tests that run against the in-memory store.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use astroview_jobs::app_state::AppState;
use astroview_jobs::db::MemoryStore;
use astroview_jobs::db::store::DatasetStore;
use astroview_jobs::models::dataset::{Dataset, Label, NewDataset, NewImage, ShareMode};
use astroview_jobs::routes::auth::Claims;
use astroview_jobs::services::clock::{Clock, ManualClock};
use astroview_jobs::services::queue::QueueSettings;
use astroview_jobs::services::runner::{DatasetJobHandler, JobRunner};
use chrono::{TimeZone, Utc};

pub const OWNER: &str = "owner";
pub const LEASE: Duration = Duration::from_secs(300);

pub struct World {
    pub store: Arc<MemoryStore>,
    pub clock: Arc<ManualClock>,
    pub state: AppState,
}

impl World {
    /// Chunk size 2 and a one-minute visibility timeout keep scenarios small.
    pub fn new() -> Self {
        Self::with_settings(
            2,
            QueueSettings {
                visibility_timeout: Duration::from_secs(60),
                ..QueueSettings::default()
            },
        )
    }

    pub fn with_settings(batch_size: usize, settings: QueueSettings) -> Self {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap(),
        ));
        let state = AppState::new(
            store.clone(),
            clock.clone(),
            settings,
            LEASE,
            batch_size,
            "test-secret",
        );
        Self {
            store,
            clock,
            state,
        }
    }

    pub async fn dataset(&self, owner: &str, share_mode: ShareMode) -> Dataset {
        self.store
            .create_dataset(
                NewDataset {
                    owner_id: owner.to_string(),
                    name: format!("{owner}'s dataset"),
                    description: String::new(),
                    share_mode,
                },
                self.clock.now(),
            )
            .await
            .expect("create dataset")
    }

    /// Dataset owned by [`OWNER`] holding the named images.
    pub async fn dataset_with_images(&self, image_names: &[&str]) -> Dataset {
        let dataset = self.dataset(OWNER, ShareMode::Private).await;
        self.images(dataset.id, image_names);
        dataset
    }

    pub fn images(&self, dataset_id: i64, image_names: &[&str]) {
        for name in image_names {
            self.store.insert_image(NewImage {
                dataset_id,
                name: name.to_string(),
                path: format!("/data/{dataset_id}/{name}.fits"),
                metadata: serde_json::json!({ "ra": 83.8, "dec": -5.4 }),
            });
        }
    }

    pub fn label(&self, name: &str) -> Label {
        self.store.insert_label(name, "#ff8800")
    }

    pub fn runner(&self) -> JobRunner {
        JobRunner::new(
            self.state.queue.clone(),
            Arc::new(DatasetJobHandler::new(self.state.mutations.clone())),
        )
    }

    pub fn token(&self, user_id: &str, role: &str) -> String {
        let claims = Claims {
            sub: user_id.to_string(),
            role: role.to_string(),
            exp: (Utc::now().timestamp() + 3600) as u64,
        };
        self.state.jwt.sign(&claims).expect("sign token")
    }
}

pub fn names(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}
