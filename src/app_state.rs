use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::db::store::{DatasetStore, ExternalJobStore, JobStore, LockStore};
use crate::routes::auth::JwtKeys;
use crate::services::{
    clock::Clock,
    lock::LockGuard,
    mutation::MutationService,
    queue::{JobQueue, QueueError, QueueSettings},
};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub datasets: Arc<dyn DatasetStore>,
    pub external_jobs: Arc<dyn ExternalJobStore>,
    pub queue: JobQueue,
    pub locks: LockGuard,
    pub mutations: MutationService,
    pub clock: Arc<dyn Clock>,
    pub jwt: Arc<JwtKeys>,
    /// Cancelled on shutdown; in-flight mutations stop between chunks.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new<S>(
        store: Arc<S>,
        clock: Arc<dyn Clock>,
        queue_settings: QueueSettings,
        lock_lease: Duration,
        batch_size: usize,
        jwt_secret: &str,
    ) -> Self
    where
        S: DatasetStore + LockStore + JobStore + ExternalJobStore + 'static,
    {
        let locks = LockGuard::new(store.clone(), clock.clone(), lock_lease);
        let mutations = MutationService::new(store.clone(), locks.clone(), clock.clone(), batch_size);
        let queue = JobQueue::new(store.clone(), clock.clone(), queue_settings);

        Self {
            datasets: store.clone(),
            external_jobs: store,
            queue,
            locks,
            mutations,
            clock,
            jwt: Arc::new(JwtKeys::new(jwt_secret)),
            shutdown: CancellationToken::new(),
        }
    }

    /// Wire everything from configuration, including the optional Redis signal.
    pub fn from_config<S>(
        store: Arc<S>,
        clock: Arc<dyn Clock>,
        config: &AppConfig,
    ) -> Result<Self, QueueError>
    where
        S: DatasetStore + LockStore + JobStore + ExternalJobStore + 'static,
    {
        let mut state = Self::new(
            store,
            clock,
            config.queue_settings(),
            config.lock_lease(),
            config.labeling_batch_size,
            &config.jwt_secret,
        );
        if let Some(redis_url) = &config.redis_url {
            state.queue = state.queue.with_redis(redis_url)?;
        }
        Ok(state)
    }
}
