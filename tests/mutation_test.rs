//! Mutation Applier behavior against the in-memory store.

mod helpers;

use astroview_jobs::db::store::DatasetStore;
use astroview_jobs::error::{CoreError, StoreError};
use astroview_jobs::models::change::ChangeKind;
use astroview_jobs::models::dataset::{LockHolder, ShareMode};
use astroview_jobs::models::job::ClaimToken;
use astroview_jobs::models::mutation::Mutation;
use astroview_jobs::services::clock::Clock;
use helpers::{names, World, OWNER};
use tokio_util::sync::CancellationToken;

fn apply(label_id: i64, images: &[&str]) -> Mutation {
    Mutation::ApplyLabel {
        label_id,
        image_names: names(images),
    }
}

#[tokio::test]
async fn test_apply_label_in_three_chunks_writes_one_change() {
    let world = World::new();
    let dataset = world.dataset_with_images(&["a", "b", "c", "d", "e"]).await;
    let label = world.label("L");

    let report = world
        .state
        .mutations
        .execute(
            dataset.id,
            OWNER,
            &apply(label.id, &["a", "b", "c", "d", "e"]),
            &CancellationToken::new(),
        )
        .await
        .expect("apply label");

    assert_eq!(report.chunks, 3);
    assert_eq!(report.matched, 5);
    assert_eq!(report.affected, 5);
    assert_eq!(world.store.committed_chunks(), 3);
    for name in ["a", "b", "c", "d", "e"] {
        assert_eq!(world.store.labels_of(dataset.id, name), vec![label.id]);
    }

    let changes = world.store.list_changes(dataset.id).await.unwrap();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].kind, ChangeKind::ApplyLabel);
    assert_eq!(changes[0].summary, "5 images, label L");
    assert_eq!(changes[0].user_id, OWNER);
    assert!(changes[0].job_id.is_none());
}

#[tokio::test]
async fn test_add_images_skips_missing_names() {
    let world = World::new();
    let source = world.dataset_with_images(&["a", "b", "x"]).await;
    let target = world.dataset(OWNER, ShareMode::Private).await;
    let label = world.label("galaxy");
    world
        .state
        .mutations
        .execute(
            source.id,
            OWNER,
            &apply(label.id, &["a"]),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    let mutation = Mutation::AddImages {
        source_dataset_id: source.id,
        image_names: names(&["a", "b", "z"]),
    };
    let report = world
        .state
        .mutations
        .execute(target.id, OWNER, &mutation, &CancellationToken::new())
        .await
        .expect("add images");

    assert_eq!(report.matched, 2);
    assert_eq!(world.store.image_names(target.id), vec!["a", "b"]);
    assert_eq!(world.store.labels_of(target.id, "a"), vec![label.id]);
    assert!(world.store.labels_of(target.id, "b").is_empty());

    let changes = world.store.list_changes(target.id).await.unwrap();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].kind, ChangeKind::AddImage);
    assert_eq!(
        changes[0].summary,
        format!("2 images added from dataset {}", source.id)
    );
}

#[tokio::test]
async fn test_add_images_twice_does_not_duplicate() {
    let world = World::new();
    let source = world.dataset_with_images(&["a", "b"]).await;
    let target = world.dataset(OWNER, ShareMode::Private).await;
    let mutation = Mutation::AddImages {
        source_dataset_id: source.id,
        image_names: names(&["a", "b"]),
    };
    let cancel = CancellationToken::new();

    world.state.mutations.execute(target.id, OWNER, &mutation, &cancel).await.unwrap();
    let second = world.state.mutations.execute(target.id, OWNER, &mutation, &cancel).await.unwrap();

    assert_eq!(second.affected, 0);
    assert_eq!(world.store.image_names(target.id), vec!["a", "b"]);
}

#[tokio::test]
async fn test_apply_label_is_idempotent() {
    let world = World::new();
    let dataset = world.dataset_with_images(&["a", "b", "c"]).await;
    let label = world.label("star");
    let mutation = apply(label.id, &["a", "b", "c"]);
    let cancel = CancellationToken::new();

    world.state.mutations.execute(dataset.id, OWNER, &mutation, &cancel).await.unwrap();
    let second = world.state.mutations.execute(dataset.id, OWNER, &mutation, &cancel).await.unwrap();

    assert_eq!(second.matched, 3);
    assert_eq!(second.affected, 0);
    assert_eq!(world.store.association_count(), 3);
}

#[tokio::test]
async fn test_remove_missing_association_is_noop() {
    let world = World::new();
    let dataset = world.dataset_with_images(&["a", "b"]).await;
    let label = world.label("artifact");

    let report = world
        .state
        .mutations
        .execute(
            dataset.id,
            OWNER,
            &Mutation::RemoveLabel {
                label_id: label.id,
                image_names: names(&["a", "b"]),
            },
            &CancellationToken::new(),
        )
        .await
        .expect("remove label");

    assert_eq!(report.affected, 0);
    let changes = world.store.list_changes(dataset.id).await.unwrap();
    assert_eq!(changes[0].kind, ChangeKind::RemoveLabel);
}

#[tokio::test]
async fn test_remove_label_deletes_associations() {
    let world = World::new();
    let dataset = world.dataset_with_images(&["a", "b", "c"]).await;
    let label = world.label("artifact");
    let cancel = CancellationToken::new();
    world
        .state
        .mutations
        .execute(dataset.id, OWNER, &apply(label.id, &["a", "b", "c"]), &cancel)
        .await
        .unwrap();

    let report = world
        .state
        .mutations
        .execute(
            dataset.id,
            OWNER,
            &Mutation::RemoveLabel {
                label_id: label.id,
                image_names: names(&["a", "c"]),
            },
            &cancel,
        )
        .await
        .unwrap();

    assert_eq!(report.affected, 2);
    assert_eq!(world.store.labels_of(dataset.id, "b"), vec![label.id]);
    assert!(world.store.labels_of(dataset.id, "a").is_empty());
}

#[tokio::test]
async fn test_locked_dataset_rejects_mutation() {
    let world = World::new();
    let dataset = world.dataset_with_images(&["a", "b"]).await;
    let label = world.label("L");
    let holder = LockHolder::job(ClaimToken {
        job_id: uuid::Uuid::new_v4(),
        token: uuid::Uuid::new_v4(),
    });
    world.state.locks.acquire(dataset.id, &holder).await.unwrap();

    let err = world
        .state
        .mutations
        .execute(dataset.id, OWNER, &apply(label.id, &["a", "b"]), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, CoreError::LockedDataset { holder: h, .. } if h == holder));
    assert_eq!(world.store.association_count(), 0);
    assert!(world.store.list_changes(dataset.id).await.unwrap().is_empty());
    // The holder's lease is untouched.
    assert_eq!(
        world.state.locks.current(dataset.id).await.unwrap().map(|l| l.holder),
        Some(holder)
    );
}

#[tokio::test]
async fn test_permission_checked_before_any_chunk() {
    let world = World::new();
    let private = world.dataset("someone-else", ShareMode::Private).await;
    let read_only = world.dataset("someone-else", ShareMode::ReadOnly).await;
    world.images(private.id, &["a"]);
    world.images(read_only.id, &["a"]);
    let label = world.label("L");
    let cancel = CancellationToken::new();

    for dataset in [&private, &read_only] {
        let err = world
            .state
            .mutations
            .execute(dataset.id, OWNER, &apply(label.id, &["a"]), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Permission { dataset_id } if dataset_id == dataset.id));
    }
    assert_eq!(world.store.committed_chunks(), 0);
    assert!(world.store.list_changes(private.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_read_write_share_admits_other_users() {
    let world = World::new();
    let shared = world.dataset("someone-else", ShareMode::ReadWrite).await;
    world.images(shared.id, &["a"]);
    let label = world.label("L");

    let report = world
        .state
        .mutations
        .execute(shared.id, OWNER, &apply(label.id, &["a"]), &CancellationToken::new())
        .await
        .expect("shared write");

    assert_eq!(report.affected, 1);
    let changes = world.store.list_changes(shared.id).await.unwrap();
    assert_eq!(changes[0].user_id, OWNER);
}

#[tokio::test]
async fn test_private_source_cannot_be_copied() {
    let world = World::new();
    let source = world.dataset("someone-else", ShareMode::Private).await;
    world.images(source.id, &["a"]);
    let target = world.dataset(OWNER, ShareMode::Private).await;

    let err = world
        .state
        .mutations
        .execute(
            target.id,
            OWNER,
            &Mutation::AddImages {
                source_dataset_id: source.id,
                image_names: names(&["a"]),
            },
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, CoreError::Permission { dataset_id } if dataset_id == source.id));
    assert!(world.store.image_names(target.id).is_empty());
}

#[tokio::test]
async fn test_missing_label_and_dataset() {
    let world = World::new();
    let dataset = world.dataset_with_images(&["a"]).await;
    let cancel = CancellationToken::new();

    let err = world
        .state
        .mutations
        .execute(dataset.id, OWNER, &apply(999, &["a"]), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::NotFound { entity: "Label", .. }));

    let err = world
        .state
        .mutations
        .execute(12345, OWNER, &apply(1, &["a"]), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::NotFound { entity: "Dataset", .. }));
}

#[tokio::test]
async fn test_empty_name_list_is_rejected() {
    let world = World::new();
    let dataset = world.dataset_with_images(&["a"]).await;
    let label = world.label("L");

    let err = world
        .state
        .mutations
        .execute(dataset.id, OWNER, &apply(label.id, &[]), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Validation(_)));
}

#[tokio::test]
async fn test_transient_failure_keeps_committed_chunks_only() {
    let world = World::new();
    let dataset = world.dataset_with_images(&["a", "b", "c", "d", "e"]).await;
    let label = world.label("L");
    world.store.fail_chunk_after(1);

    let err = world
        .state
        .mutations
        .execute(
            dataset.id,
            OWNER,
            &apply(label.id, &["a", "b", "c", "d", "e"]),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, CoreError::Store(StoreError::Database(_))));
    assert_eq!(world.store.committed_chunks(), 1);
    assert_eq!(world.store.association_count(), 2);
    assert!(world.store.list_changes(dataset.id).await.unwrap().is_empty());
    assert!(world.state.locks.current(dataset.id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_cancellation_stops_before_next_chunk() {
    let world = World::new();
    let dataset = world.dataset_with_images(&["a", "b", "c"]).await;
    let label = world.label("L");
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = world
        .state
        .mutations
        .execute(dataset.id, OWNER, &apply(label.id, &["a", "b", "c"]), &cancel)
        .await
        .unwrap_err();

    assert!(matches!(err, CoreError::Cancelled));
    assert_eq!(world.store.committed_chunks(), 0);
    assert!(world.state.locks.current(dataset.id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_completion_bumps_modified_time() {
    let world = World::new();
    let dataset = world.dataset_with_images(&["a"]).await;
    let label = world.label("L");
    world.clock.advance(chrono::Duration::minutes(5));

    world
        .state
        .mutations
        .execute(dataset.id, OWNER, &apply(label.id, &["a"]), &CancellationToken::new())
        .await
        .unwrap();

    let reloaded = world.store.get_dataset(dataset.id).await.unwrap().unwrap();
    assert_eq!(reloaded.modified_at, world.clock.now());
    assert!(reloaded.modified_at > dataset.modified_at);
}
