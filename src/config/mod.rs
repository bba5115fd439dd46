use std::net::SocketAddr;
use std::time::Duration;

use serde::Deserialize;

use crate::services::queue::QueueSettings;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:3000"). Optional for worker processes.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// PostgreSQL connection string
    pub database_url: String,

    /// Redis connection string for the queue wake-up signal. Workers poll without it.
    #[serde(default)]
    pub redis_url: Option<String>,

    /// HS256 secret for bearer tokens
    pub jwt_secret: String,

    /// Base URL of the external processing pipeline API
    pub pipeline_api_url: String,

    /// Items per mutation chunk transaction
    #[serde(default = "default_batch_size")]
    pub labeling_batch_size: usize,

    /// Worker tasks per worker process
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    #[serde(default = "default_poll_interval")]
    pub job_poll_interval_secs: u64,

    #[serde(default = "default_fourteen_days")]
    pub job_visibility_timeout_secs: u64,

    /// Retention of Succeeded/Failed jobs
    #[serde(default = "default_fourteen_days")]
    pub job_expiration_secs: u64,

    #[serde(default = "default_expiration_check")]
    pub job_expiration_check_secs: u64,

    #[serde(default = "default_max_attempts")]
    pub job_max_attempts: u32,

    /// Whether this worker process competes to run the External Job Watcher.
    /// Only the process holding the watcher's advisory lock polls.
    #[serde(default = "default_true")]
    pub watcher_enabled: bool,

    #[serde(default = "default_watcher_interval")]
    pub watcher_interval_secs: u64,

    /// Where the worker process exposes Prometheus metrics. Not exported when unset.
    #[serde(default)]
    pub worker_metrics_addr: Option<SocketAddr>,

    /// Dataset lock lease; holders renew every third of it
    #[serde(default = "default_lock_lease")]
    pub lock_lease_secs: u64,

    /// Root of dataset file storage; external job output lands below it
    #[serde(default = "default_storage_dir")]
    pub storage_dir: String,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_batch_size() -> usize {
    crate::services::mutation::LABELING_BATCH_SIZE
}

fn default_worker_count() -> usize {
    2
}

fn default_poll_interval() -> u64 {
    15
}

fn default_fourteen_days() -> u64 {
    14 * 24 * 60 * 60
}

fn default_expiration_check() -> u64 {
    60 * 60
}

fn default_max_attempts() -> u32 {
    3
}

fn default_true() -> bool {
    true
}

fn default_watcher_interval() -> u64 {
    10
}

fn default_lock_lease() -> u64 {
    300
}

fn default_storage_dir() -> String {
    "./storage".to_string()
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    pub fn queue_settings(&self) -> QueueSettings {
        QueueSettings {
            poll_interval: Duration::from_secs(self.job_poll_interval_secs),
            visibility_timeout: Duration::from_secs(self.job_visibility_timeout_secs),
            expiration: Duration::from_secs(self.job_expiration_secs),
            max_attempts: self.job_max_attempts.max(1),
        }
    }

    pub fn lock_lease(&self) -> Duration {
        Duration::from_secs(self.lock_lease_secs)
    }

    pub fn expiration_check_interval(&self) -> Duration {
        Duration::from_secs(self.job_expiration_check_secs.max(1))
    }

    pub fn watcher_interval(&self) -> Duration {
        Duration::from_secs(self.watcher_interval_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_minimal_env() {
        let vars = vec![
            ("DATABASE_URL".to_string(), "postgres://localhost/astroview".to_string()),
            ("JWT_SECRET".to_string(), "secret".to_string()),
            ("PIPELINE_API_URL".to_string(), "http://pipeline:8080/caesar/api/v1.0".to_string()),
        ];
        let config: AppConfig = envy::from_iter(vars).unwrap();

        assert_eq!(config.bind_addr, "0.0.0.0:3000");
        assert_eq!(config.labeling_batch_size, 250);
        assert!(config.redis_url.is_none());
        assert!(config.watcher_enabled);
        assert_eq!(config.storage_dir, "./storage");

        let queue = config.queue_settings();
        assert_eq!(queue.poll_interval, Duration::from_secs(15));
        assert_eq!(queue.visibility_timeout, Duration::from_secs(1_209_600));
        assert_eq!(queue.max_attempts, 3);
    }
}
