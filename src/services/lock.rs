use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;

use crate::db::store::{LockAttempt, LockStore};
use crate::error::CoreError;
use crate::models::dataset::{DatasetLock, LockHolder};
use crate::services::clock::Clock;

/// Releases a lease when the future holding it is dropped before it could
/// release inline, e.g. a request handler cancelled by a client disconnect.
struct ReleaseOnDrop {
    store: Arc<dyn LockStore>,
    dataset_id: i64,
    holder: Option<LockHolder>,
}

impl ReleaseOnDrop {
    fn disarm(&mut self) {
        self.holder = None;
    }
}

impl Drop for ReleaseOnDrop {
    fn drop(&mut self) {
        let Some(holder) = self.holder.take() else {
            return;
        };
        let dataset_id = self.dataset_id;
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            // The lease still expires on its own.
            tracing::warn!(dataset_id, holder = %holder, "No runtime left to release abandoned dataset lock");
            return;
        };

        let store = self.store.clone();
        handle.spawn(async move {
            match store.release(dataset_id, &holder).await {
                Ok(released) => {
                    tracing::info!(dataset_id, holder = %holder, released, "Released dataset lock of abandoned work")
                }
                Err(e) => {
                    tracing::warn!(dataset_id, holder = %holder, error = %e, "Failed to release abandoned dataset lock")
                }
            }
        });
    }
}

/// Dataset Lock Guard: persisted, lease-based single-writer lock per dataset.
///
/// A lease that is not renewed expires, and any caller may then take it over.
#[derive(Clone)]
pub struct LockGuard {
    store: Arc<dyn LockStore>,
    clock: Arc<dyn Clock>,
    lease: Duration,
}

impl LockGuard {
    pub fn new(store: Arc<dyn LockStore>, clock: Arc<dyn Clock>, lease: Duration) -> Self {
        Self {
            store,
            clock,
            lease,
        }
    }

    pub fn lease(&self) -> Duration {
        self.lease
    }

    /// When a lease taken or renewed now runs out.
    pub fn lease_deadline(&self) -> chrono::DateTime<chrono::Utc> {
        self.clock.after(self.lease)
    }

    /// Take the lock or fail fast with [`CoreError::LockedDataset`].
    pub async fn acquire(
        &self,
        dataset_id: i64,
        holder: &LockHolder,
    ) -> Result<DatasetLock, CoreError> {
        let attempt = self
            .store
            .try_acquire(dataset_id, holder, self.clock.now(), self.lease_deadline())
            .await?;

        match attempt {
            LockAttempt::Granted(lock) => {
                tracing::debug!(dataset_id, holder = %holder, "Dataset lock acquired");
                Ok(lock)
            }
            LockAttempt::Held(lock) => {
                tracing::info!(
                    dataset_id,
                    holder = %lock.holder,
                    requested_by = %holder,
                    "Dataset is locked"
                );
                Err(CoreError::LockedDataset {
                    dataset_id,
                    holder: lock.holder,
                })
            }
        }
    }

    /// Push the lease out by another full period. False if it was lost.
    pub async fn renew(&self, dataset_id: i64, holder: &LockHolder) -> Result<bool, CoreError> {
        Ok(self
            .store
            .renew(dataset_id, holder, self.lease_deadline())
            .await?)
    }

    pub async fn release(&self, dataset_id: i64, holder: &LockHolder) -> Result<bool, CoreError> {
        let released = self.store.release(dataset_id, holder).await?;
        tracing::debug!(dataset_id, holder = %holder, released, "Dataset lock released");
        Ok(released)
    }

    pub async fn force_release(&self, dataset_id: i64) -> Result<Option<DatasetLock>, CoreError> {
        let previous = self.store.force_release(dataset_id).await?;
        if let Some(lock) = &previous {
            tracing::warn!(dataset_id, holder = %lock.holder, "Dataset lock force-released");
        }
        Ok(previous)
    }

    pub async fn current(&self, dataset_id: i64) -> Result<Option<DatasetLock>, CoreError> {
        Ok(self.store.current_lock(dataset_id).await?)
    }

    /// Run `work` while holding the lock, renewing the lease every third of
    /// its duration. The lock is released whether `work` succeeds or fails,
    /// and also when the returned future is dropped halfway.
    pub async fn with_lock<T, F, Fut>(
        &self,
        dataset_id: i64,
        holder: &LockHolder,
        work: F,
    ) -> Result<T, CoreError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, CoreError>>,
    {
        self.acquire(dataset_id, holder).await?;
        let mut abandoned = ReleaseOnDrop {
            store: self.store.clone(),
            dataset_id,
            holder: Some(holder.clone()),
        };

        let mut renew = tokio::time::interval((self.lease / 3).max(Duration::from_millis(10)));
        renew.set_missed_tick_behavior(MissedTickBehavior::Skip);
        renew.tick().await;

        let work = work();
        tokio::pin!(work);
        let result = loop {
            tokio::select! {
                result = &mut work => break result,
                _ = renew.tick() => match self.renew(dataset_id, holder).await {
                    Ok(true) => {}
                    Ok(false) => tracing::warn!(dataset_id, holder = %holder, "Dataset lease lost while held"),
                    Err(e) => tracing::warn!(dataset_id, error = %e, "Failed to renew dataset lease"),
                },
            }
        };

        if let Err(e) = self.release(dataset_id, holder).await {
            // The lease still expires on its own.
            tracing::warn!(dataset_id, holder = %holder, error = %e, "Failed to release dataset lock");
        }
        abandoned.disarm();
        result
    }
}
