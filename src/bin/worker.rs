use std::sync::Arc;
use std::time::Duration;

use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::task::JoinSet;
use tracing_subscriber::EnvFilter;

use astroview_jobs::{
    app_state::AppState,
    config::AppConfig,
    db::{self, postgres::WATCHER_LOCK_KEY, PgStore},
    routes,
    services::{
        clock::SystemClock,
        output::OutputCollector,
        pipeline::HttpPipelineClient,
        runner::{DatasetJobHandler, JobRunner},
        watcher::ExternalJobWatcher,
    },
};

const PIPELINE_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting astroview-jobs worker");

    let config = AppConfig::from_env().expect("Failed to load configuration");

    if let Some(addr) = config.worker_metrics_addr {
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .expect("Failed to install Prometheus exporter");
        routes::metrics::describe();
        tracing::info!(%addr, "Worker metrics exported");
    }

    tracing::info!("Connecting to PostgreSQL");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");
    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run database migrations");

    let store = Arc::new(PgStore::new(db_pool));
    let clock = Arc::new(SystemClock);
    let state = AppState::from_config(store.clone(), clock.clone(), &config)
        .expect("Failed to initialize job queue");
    let shutdown = state.shutdown.clone();

    let pipeline = Arc::new(
        HttpPipelineClient::new(&config.pipeline_api_url, PIPELINE_TIMEOUT)
            .expect("Failed to initialize pipeline client"),
    );
    let outputs = OutputCollector::new(
        pipeline.clone(),
        store.clone(),
        clock.clone(),
        &config.storage_dir,
    );
    let runner = JobRunner::new(
        state.queue.clone(),
        Arc::new(DatasetJobHandler::new(state.mutations.clone()).with_outputs(outputs)),
    );

    let mut tasks = JoinSet::new();
    for n in 0..config.worker_count.max(1) {
        let runner = runner.clone();
        let cancel = shutdown.clone();
        let worker_id = format!("{}:{}", hostname(), n);
        tasks.spawn(async move { runner.run_worker(worker_id, cancel).await });
    }

    {
        let runner = runner.clone();
        let cancel = shutdown.clone();
        let every = config.expiration_check_interval();
        tasks.spawn(async move { runner.run_housekeeping(every, cancel).await });
    }

    if config.watcher_enabled {
        let watcher = ExternalJobWatcher::new(
            store.clone(),
            pipeline,
            state.locks.clone(),
            clock,
            config.watcher_interval(),
        )
        .with_retention(config.queue_settings().expiration);
        let cancel = shutdown.clone();
        let retry_every = config.watcher_interval();
        tasks.spawn(async move {
            // Every worker may compete, but only the advisory lock holder polls.
            let lease = loop {
                match store.try_session_lock(WATCHER_LOCK_KEY).await {
                    Ok(Some(lease)) => break lease,
                    Ok(None) => tracing::debug!("External job watcher runs elsewhere"),
                    Err(e) => tracing::warn!(error = %e, "Failed to take the watcher lock"),
                }
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(retry_every) => {}
                }
            };

            watcher.run(cancel).await;
            if let Err(e) = lease.release().await {
                tracing::warn!(error = %e, "Failed to release the watcher lock");
            }
        });
    }

    tracing::info!(workers = config.worker_count, watcher = config.watcher_enabled, "Worker ready");

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }
    tracing::info!("Shutdown requested, waiting for tasks to stop");
    shutdown.cancel();

    while let Some(result) = tasks.join_next().await {
        if let Err(e) = result {
            tracing::error!(error = %e, "Worker task panicked");
        }
    }
    tracing::info!("Worker stopped");
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| format!("worker-{}", std::process::id()))
}
