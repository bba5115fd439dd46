//! External Job Watcher reconciliation with a scripted pipeline.

mod helpers;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use astroview_jobs::db::store::{DatasetStore, ExternalJobStore, Registration};
use astroview_jobs::models::change::ChangeKind;
use astroview_jobs::models::dataset::LockHolder;
use astroview_jobs::models::external_job::{ExternalJob, ExternalStatus, NewExternalJob, StatusReport};
use astroview_jobs::models::job::{ExternalOutput, JobPayload, JobState};
use astroview_jobs::services::clock::Clock;
use astroview_jobs::services::output::{OutputCollector, OUTPUT_ARCHIVE};
use astroview_jobs::services::pipeline::{PipelineClient, PipelineError};
use astroview_jobs::services::runner::{DatasetJobHandler, JobRunner, RunOutcome};
use astroview_jobs::services::watcher::{ExternalJobWatcher, TickReport};
use helpers::{World, LEASE, OWNER};
use tokio_util::sync::CancellationToken;

/// Pipeline double answering from maps; unknown ids get a 503.
#[derive(Default)]
struct FakePipeline {
    statuses: Mutex<HashMap<String, StatusReport>>,
    outputs: Mutex<HashMap<String, Vec<u8>>>,
    calls: AtomicUsize,
}

impl FakePipeline {
    fn set(&self, external_id: &str, state: &str, detail: &str) {
        let report = StatusReport {
            status: ExternalStatus::from_pipeline_state(state),
            state: state.to_string(),
            detail: detail.to_string(),
        };
        self.statuses
            .lock()
            .unwrap()
            .insert(external_id.to_string(), report);
    }

    fn set_output(&self, external_id: &str, archive: &[u8]) {
        self.outputs
            .lock()
            .unwrap()
            .insert(external_id.to_string(), archive.to_vec());
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PipelineClient for FakePipeline {
    async fn get_status(&self, external_id: &str) -> Result<StatusReport, PipelineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.statuses
            .lock()
            .unwrap()
            .get(external_id)
            .cloned()
            .ok_or(PipelineError::Status {
                status: 503,
                body: "pipeline unavailable".to_string(),
            })
    }

    async fn download_output(&self, external_id: &str) -> Result<Vec<u8>, PipelineError> {
        self.outputs
            .lock()
            .unwrap()
            .get(external_id)
            .cloned()
            .ok_or(PipelineError::Status {
                status: 404,
                body: "no output".to_string(),
            })
    }
}

fn watcher(world: &World, pipeline: &Arc<FakePipeline>) -> ExternalJobWatcher {
    ExternalJobWatcher::new(
        world.store.clone(),
        pipeline.clone(),
        world.state.locks.clone(),
        world.clock.clone(),
        Duration::from_secs(10),
    )
}

async fn register(world: &World, dataset_id: i64, external_id: &str) -> Registration {
    world
        .store
        .register_external_job(
            NewExternalJob {
                dataset_id,
                user_id: OWNER.to_string(),
                external_id: external_id.to_string(),
                app_name: "sfinder".to_string(),
            },
            world.clock.now(),
            world.clock.after(LEASE),
        )
        .await
        .unwrap()
}

/// Register a running external job holding the dataset's lock.
async fn track(world: &World, dataset_id: i64, external_id: &str) -> ExternalJob {
    match register(world, dataset_id, external_id).await {
        Registration::Registered(job) => job,
        other => panic!("unexpected registration {other:?}"),
    }
}

fn storage_root() -> std::path::PathBuf {
    std::env::temp_dir().join(format!("astroview-watcher-{}", uuid::Uuid::new_v4()))
}

#[tokio::test]
async fn test_terminal_job_reconciled_once() {
    let world = World::new();
    let dataset = world.dataset_with_images(&["a"]).await;
    let job = track(&world, dataset.id, "j-42").await;
    let pipeline = Arc::new(FakePipeline::default());
    pipeline.set("j-42", "SUCCESS", "Process terminated with success");
    let watcher = watcher(&world, &pipeline);
    let cancel = CancellationToken::new();

    let report = watcher.tick(&cancel).await.unwrap();
    assert_eq!(
        report,
        TickReport {
            polled: 1,
            running: 0,
            reconciled: 1,
            errors: 0
        }
    );

    let changes = world.store.list_changes(dataset.id).await.unwrap();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].kind, ChangeKind::ExternalJobSucceeded);
    assert_eq!(
        changes[0].summary,
        "sfinder job j-42 finished: SUCCESS (Process terminated with success)"
    );
    assert!(world.state.locks.current(dataset.id).await.unwrap().is_none());

    // Later ticks no longer see the handle, and a direct retry is a no-op.
    let report = watcher.tick(&cancel).await.unwrap();
    assert_eq!(report.polled, 0);
    assert_eq!(pipeline.calls(), 1);
    let status = StatusReport {
        status: ExternalStatus::Succeeded,
        state: "SUCCESS".to_string(),
        detail: String::new(),
    };
    assert!(world
        .store
        .reconcile(job.id, &status, world.clock.now())
        .await
        .unwrap()
        .is_none());
    assert_eq!(world.store.list_changes(dataset.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_overlapping_ticks_write_one_change() {
    let world = World::new();
    let dataset = world.dataset_with_images(&["a"]).await;
    track(&world, dataset.id, "j-1").await;
    let pipeline = Arc::new(FakePipeline::default());
    pipeline.set("j-1", "FAILURE", "Process terminated with error");
    let first = watcher(&world, &pipeline);
    let second = first.clone();
    let cancel = CancellationToken::new();

    let (a, b) = tokio::join!(first.tick(&cancel), second.tick(&cancel));
    assert_eq!(a.unwrap().reconciled + b.unwrap().reconciled, 1);

    let changes = world.store.list_changes(dataset.id).await.unwrap();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].kind, ChangeKind::ExternalJobFailed);
}

#[tokio::test]
async fn test_poll_error_retries_next_tick() {
    let world = World::new();
    let dataset = world.dataset_with_images(&["a"]).await;
    track(&world, dataset.id, "j-7").await;
    let pipeline = Arc::new(FakePipeline::default());
    let watcher = watcher(&world, &pipeline);
    let cancel = CancellationToken::new();

    let report = watcher.tick(&cancel).await.unwrap();
    assert_eq!(report.errors, 1);
    assert!(world.store.list_changes(dataset.id).await.unwrap().is_empty());
    assert!(world.state.locks.current(dataset.id).await.unwrap().is_some());
    let pending = world.store.list_unreconciled().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert!(pending[0].last_polled_at.is_none());

    pipeline.set("j-7", "SUCCESS", "done");
    let report = watcher.tick(&cancel).await.unwrap();
    assert_eq!(report.reconciled, 1);
    assert_eq!(world.store.list_changes(dataset.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_one_failing_handle_does_not_block_others() {
    let world = World::new();
    let first = world.dataset_with_images(&["a"]).await;
    let second = world.dataset_with_images(&["a"]).await;
    track(&world, first.id, "broken").await;
    track(&world, second.id, "fine").await;
    let pipeline = Arc::new(FakePipeline::default());
    pipeline.set("fine", "SUCCESS", "done");

    let report = watcher(&world, &pipeline)
        .tick(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.polled, 2);
    assert_eq!(report.errors, 1);
    assert_eq!(report.reconciled, 1);
    assert_eq!(world.store.list_changes(second.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_running_job_keeps_its_lease() {
    let world = World::new();
    let dataset = world.dataset_with_images(&["a"]).await;
    track(&world, dataset.id, "j-9").await;
    let pipeline = Arc::new(FakePipeline::default());
    pipeline.set("j-9", "STARTED", "Job is running");
    let watcher = watcher(&world, &pipeline);

    world.clock.advance(chrono::Duration::seconds(200));
    let report = watcher.tick(&CancellationToken::new()).await.unwrap();
    assert_eq!(report.running, 1);

    let lock = world.state.locks.current(dataset.id).await.unwrap().unwrap();
    assert_eq!(lock.holder, LockHolder::external("j-9"));
    assert_eq!(lock.lease_expires_at, world.clock.after(LEASE));

    let pending = world.store.list_unreconciled().await.unwrap();
    assert_eq!(pending[0].last_state.as_deref(), Some("STARTED"));
    assert_eq!(pending[0].last_polled_at, Some(world.clock.now()));
    assert_eq!(pending[0].status, ExternalStatus::Running);
}

#[tokio::test]
async fn test_cancelled_tick_polls_nothing() {
    let world = World::new();
    let dataset = world.dataset_with_images(&["a"]).await;
    track(&world, dataset.id, "j-3").await;
    let pipeline = Arc::new(FakePipeline::default());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let report = watcher(&world, &pipeline).tick(&cancel).await.unwrap();
    assert_eq!(report, TickReport::default());
    assert_eq!(pipeline.calls(), 0);
}

#[tokio::test]
async fn test_reconcile_enqueues_one_output_job() {
    let world = World::new();
    let dataset = world.dataset_with_images(&["a"]).await;
    let job = track(&world, dataset.id, "j-5").await;
    let pipeline = Arc::new(FakePipeline::default());
    pipeline.set("j-5", "SUCCESS", "done");
    let first = watcher(&world, &pipeline);
    let second = first.clone();
    let cancel = CancellationToken::new();

    let (a, b) = tokio::join!(first.tick(&cancel), second.tick(&cancel));
    assert_eq!(a.unwrap().reconciled + b.unwrap().reconciled, 1);
    first.tick(&cancel).await.unwrap();

    let queued = world.state.queue.list(None, 10).await.unwrap();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].state, JobState::Enqueued);
    assert_eq!(queued[0].dataset_id, dataset.id);
    assert_eq!(
        queued[0].payload,
        JobPayload::ExternalOutput(ExternalOutput {
            external_job_id: job.id,
            external_id: "j-5".to_string(),
            app_name: "sfinder".to_string(),
            status: ExternalStatus::Succeeded,
        })
    );

    // The handle points at its output job.
    let again = register(&world, dataset.id, "j-5").await;
    assert!(matches!(again, Registration::Duplicate(h) if h.result_job_id == Some(queued[0].id)));
}

#[tokio::test]
async fn test_output_job_stores_archive() {
    let world = World::new();
    let dataset = world.dataset_with_images(&["a"]).await;
    let job = track(&world, dataset.id, "j-8").await;
    let pipeline = Arc::new(FakePipeline::default());
    pipeline.set("j-8", "SUCCESS", "done");
    pipeline.set_output("j-8", b"archive bytes");
    watcher(&world, &pipeline)
        .tick(&CancellationToken::new())
        .await
        .unwrap();

    let root = storage_root();
    let outputs = OutputCollector::new(
        pipeline.clone(),
        world.store.clone(),
        world.clock.clone(),
        &root,
    );
    let runner = JobRunner::new(
        world.state.queue.clone(),
        Arc::new(DatasetJobHandler::new(world.state.mutations.clone()).with_outputs(outputs.clone())),
    );

    let outcome = runner.run_once("w1", &CancellationToken::new()).await.unwrap();
    assert!(matches!(outcome, RunOutcome::Finished { state: JobState::Succeeded, .. }));

    let archive = outputs.job_dir(dataset.id, job.id).join(OUTPUT_ARCHIVE);
    assert_eq!(tokio::fs::read(&archive).await.unwrap(), b"archive bytes");

    let changes = world.store.list_changes(dataset.id).await.unwrap();
    assert_eq!(changes.len(), 2);
    assert_eq!(changes[1].kind, ChangeKind::ExternalOutputCollected);
    assert_eq!(
        changes[1].summary,
        "sfinder job j-8 output stored (13 bytes, succeeded)"
    );
    tokio::fs::remove_dir_all(&root).await.unwrap();
}

#[tokio::test]
async fn test_missing_output_fails_without_retry() {
    let world = World::new();
    let dataset = world.dataset_with_images(&["a"]).await;
    track(&world, dataset.id, "j-404").await;
    let pipeline = Arc::new(FakePipeline::default());
    pipeline.set("j-404", "FAILURE", "crashed");
    watcher(&world, &pipeline)
        .tick(&CancellationToken::new())
        .await
        .unwrap();

    let root = storage_root();
    let outputs = OutputCollector::new(pipeline.clone(), world.store.clone(), world.clock.clone(), &root);
    let runner = JobRunner::new(
        world.state.queue.clone(),
        Arc::new(DatasetJobHandler::new(world.state.mutations.clone()).with_outputs(outputs)),
    );

    let outcome = runner.run_once("w1", &CancellationToken::new()).await.unwrap();
    assert!(matches!(outcome, RunOutcome::Finished { state: JobState::Failed, .. }));
    let _ = tokio::fs::remove_dir_all(&root).await;
}

#[tokio::test]
async fn test_reconciled_handles_purged_after_retention() {
    let world = World::new();
    let dataset = world.dataset_with_images(&["a"]).await;
    track(&world, dataset.id, "j-old").await;
    track(&world, world.dataset_with_images(&["a"]).await.id, "j-live").await;
    let pipeline = Arc::new(FakePipeline::default());
    pipeline.set("j-old", "SUCCESS", "done");
    pipeline.set("j-live", "RUNNING", "busy");
    let watcher = watcher(&world, &pipeline).with_retention(Duration::from_secs(3600));
    watcher.tick(&CancellationToken::new()).await.unwrap();

    world.clock.advance(chrono::Duration::seconds(3599));
    assert_eq!(watcher.purge_reconciled().await.unwrap(), 0);

    world.clock.advance(chrono::Duration::seconds(1));
    assert_eq!(watcher.purge_reconciled().await.unwrap(), 1);

    // Running handles stay, and so does the audit trail.
    let pending = world.store.list_unreconciled().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].external_id, "j-live");
    assert_eq!(world.store.list_changes(dataset.id).await.unwrap().len(), 1);

    // A purged id may be registered again.
    track(&world, dataset.id, "j-old").await;
}
