use std::sync::Arc;

use axum::extract::State;
use axum::response::IntoResponse;
use metrics_exporter_prometheus::PrometheusHandle;

/// GET /metrics: Prometheus text exposition of queue, mutation and watcher metrics.
pub async fn prometheus_metrics(State(handle): State<Arc<PrometheusHandle>>) -> impl IntoResponse {
    handle.render()
}

/// Register descriptions for every metric the services emit.
pub fn describe() {
    metrics::describe_counter!(
        "dataset_mutation_chunks_total",
        "Mutation chunk transactions committed"
    );
    metrics::describe_counter!("dataset_mutations_total", "Mutation invocations completed");
    metrics::describe_counter!("jobs_enqueued_total", "Background jobs enqueued");
    metrics::describe_counter!("jobs_succeeded_total", "Background jobs that succeeded");
    metrics::describe_counter!("jobs_retried_total", "Job attempts sent to AwaitingRetry");
    metrics::describe_counter!("jobs_failed_total", "Background jobs marked Failed");
    metrics::describe_counter!(
        "jobs_reclaimed_total",
        "Processing jobs reclaimed after their visibility deadline"
    );
    metrics::describe_counter!("jobs_purged_total", "Expired jobs deleted");
    metrics::describe_counter!(
        "watcher_poll_errors_total",
        "Failed status polls against the external pipeline"
    );
    metrics::describe_counter!(
        "watcher_reconciled_total",
        "External jobs reconciled after reaching a terminal state"
    );
    metrics::describe_counter!(
        "external_outputs_collected_total",
        "External job output archives stored"
    );
    metrics::describe_histogram!(
        "job_processing_seconds",
        "Time spent in a job handler per attempt"
    );
}
