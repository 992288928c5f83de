//! End-to-end batch lifecycles against the in-memory collaborators

use serde_json::json;
use std::sync::{Arc, OnceLock};

use docbatch_core::{
    BatchError, BatchEventKind, BatchId, BatchStatus, ConflictPolicy, ErrorCode, ItemOutcome, NodeId, OperationType,
    UserId,
};
use docbatch_engine::BatchCoordinator;
use docbatch_test_utils::{ids, Harness};

fn children_of(harness: &Harness, parent: &str) -> Vec<String> {
    harness
        .repository()
        .snapshot(&harness.project)
        .into_iter()
        .filter(|node| node.parent_id.as_ref().map(NodeId::as_str) == Some(parent))
        .map(|node| node.id.to_string())
        .collect()
}

#[tokio::test]
async fn test_atomic_delete_completes() {
    let harness = Harness::new(2, 2);
    let request = harness
        .request(OperationType::Delete, &["f1-d1", "f2-d1"])
        .with_atomic(true);

    let response = harness.submit(request).await;
    assert_eq!(response.status, BatchStatus::Executing);
    assert_eq!(response.preflight_summary.total, 2);
    assert_eq!(response.preflight_summary.conflicted, 0);
    assert!(response.preflight_summary.is_clean());

    let batch = harness.wait(response.batch_id).await;
    assert_eq!(batch.status, BatchStatus::Completed);
    assert_eq!(batch.counts().succeeded, 2);
    assert!(batch.failure.is_none());
    for id in ["f1-d1", "f2-d1"] {
        assert!(harness.repository().is_deleted(&NodeId::new(id)));
    }
    assert_eq!(children_of(&harness, "f1"), vec!["f1-d2"]);
    assert_eq!(
        harness.events(&response.batch_id),
        vec![BatchEventKind::Created, BatchEventKind::Completed]
    );
}

#[tokio::test]
async fn test_skip_conflicts_move_of_locked_node_is_partial() {
    let harness = Harness::new(2, 2);
    let bob = UserId::new("bob");
    harness.backend.locks.lock(&NodeId::new("f1-d1"), &bob);

    let request = harness
        .request(OperationType::Move, &["f1-d1"])
        .with_policy(ConflictPolicy::SkipConflicts)
        .with_payload("newParentId", json!("f2"));
    let response = harness.submit(request).await;
    assert_eq!(response.preflight_summary.locked, 1);
    assert_eq!(response.preflight_summary.valid, 0);

    let batch = harness.wait(response.batch_id).await;
    assert_eq!(batch.status, BatchStatus::PartiallyCompleted);
    let item = batch.result_of(&NodeId::new("f1-d1")).expect("item recorded");
    assert_eq!(item.outcome, ItemOutcome::Skipped);
    assert_eq!(item.error, Some(ErrorCode::LockConflict));
    assert!(item.reason.contains("bob"));
    assert_eq!(children_of(&harness, "f1"), vec!["f1-d1", "f1-d2"]);
}

#[tokio::test]
async fn test_cancel_after_forty_of_hundred() {
    let harness = Harness::new(2, 100);
    let running: Arc<OnceLock<(BatchCoordinator, BatchId)>> = Arc::new(OnceLock::new());
    let slot = Arc::clone(&running);
    harness.backend.repository.on_mutation(move |count| {
        if count == 40 {
            let (coordinator, batch_id) = slot.get().expect("batch registered before execution");
            coordinator.cancel(*batch_id).expect("cancellable while executing");
        }
    });

    let targets: Vec<String> = (1..=100).map(|d| format!("f1-d{d}")).collect();
    let targets: Vec<&str> = targets.iter().map(String::as_str).collect();
    let request = harness
        .request(OperationType::Move, &targets)
        .with_payload("newParentId", json!("f2"));
    let response = harness.submit(request).await;
    running
        .set((harness.coordinator.clone(), response.batch_id))
        .expect("slot empty");

    let batch = harness.wait(response.batch_id).await;
    assert_eq!(batch.status, BatchStatus::Cancelled);
    let counts = batch.counts();
    assert_eq!(counts.succeeded, 40);
    assert_eq!(counts.cancelled, 60);
    assert_eq!(batch.item_results.len(), 100);
    assert!(batch.cancelled_at.is_some());
    assert_eq!(harness.repository().mutation_count(), 40);

    for result in batch.item_results.iter().skip(40) {
        assert_eq!(result.outcome, ItemOutcome::Cancelled);
        assert_eq!(result.error, Some(ErrorCode::Cancelled));
    }
    let expected: Vec<String> = (41..=100).map(|d| format!("f1-d{d}")).collect();
    assert_eq!(children_of(&harness, "f1"), expected);
    assert_eq!(children_of(&harness, "f2").len(), 140);
    assert_eq!(
        harness.events(&response.batch_id),
        vec![BatchEventKind::Created, BatchEventKind::Cancelled]
    );
}

#[tokio::test]
async fn test_cancel_requires_running_batch() {
    let harness = Harness::new(1, 1);
    let batch = harness
        .run(harness.request(OperationType::Delete, &["f1-d1"]))
        .await;

    let err = harness.coordinator.cancel(batch.id).unwrap_err();
    assert!(matches!(
        err,
        BatchError::InvalidState {
            status: BatchStatus::Completed,
            ..
        }
    ));
    assert_eq!(err.code(), ErrorCode::InvalidState);

    let unknown = BatchId::new();
    assert!(matches!(harness.coordinator.cancel(unknown), Err(BatchError::NotFound(id)) if id == unknown));
}

#[tokio::test]
async fn test_folder_delete_with_descendants() {
    let harness = Harness::new(2, 3);
    let request = harness
        .request(OperationType::Delete, &["f1"])
        .with_descendants(true);

    let response = harness.submit(request).await;
    assert_eq!(response.preflight_summary.total, 4);

    let batch = harness.wait(response.batch_id).await;
    assert_eq!(batch.status, BatchStatus::Completed);
    assert_eq!(
        batch.expanded_target_ids.as_slice(),
        ids(&["f1", "f1-d1", "f1-d2", "f1-d3"]).as_slice()
    );
    assert_eq!(harness.repository().snapshot(&harness.project).len(), 4);
}

#[tokio::test]
async fn test_copy_next_to_source_and_deep_copy() {
    let harness = Harness::new(2, 2);

    let next_to_source = harness
        .run(harness.request(OperationType::Copy, &["f1-d1"]))
        .await;
    assert_eq!(next_to_source.status, BatchStatus::Completed);
    let rows = children_of(&harness, "f1");
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[0], "f1-d1");
    assert!(rows[1].starts_with("f1-d1-copy"));

    let deep = harness
        .run(
            harness
                .request(OperationType::Copy, &["f2"])
                .with_descendants(true)
                .with_payload("newParentId", json!("f1")),
        )
        .await;
    assert_eq!(deep.status, BatchStatus::Completed);
    let folder_clone = children_of(&harness, "f1")
        .into_iter()
        .find(|id| id.starts_with("f2-copy"))
        .expect("folder cloned into f1");
    assert_eq!(children_of(&harness, &folder_clone).len(), 2);
}

#[tokio::test]
async fn test_move_carries_descendants_and_respects_position() {
    let harness = Harness::new(3, 1);
    harness
        .repository()
        .insert(
            &harness.project,
            "f1-sub",
            Some(&NodeId::new("f1")),
            docbatch_core::NodeKind::Folder,
            "Sub",
        )
        .expect("insert subfolder");

    let batch = harness
        .run(
            harness
                .request(OperationType::Move, &["f1"])
                .with_descendants(true)
                .with_payload("newParentId", json!("f3"))
                .with_payload("position", json!(0)),
        )
        .await;
    assert_eq!(batch.status, BatchStatus::Completed);
    assert_eq!(children_of(&harness, "f3"), vec!["f1", "f3-d1"]);
    assert_eq!(children_of(&harness, "f1"), vec!["f1-d1", "f1-sub"]);
    let carried = batch.result_of(&NodeId::new("f1-d1")).expect("descendant recorded");
    assert_eq!(carried.outcome, ItemOutcome::Succeeded);
    assert!(carried.reason.contains("with parent"));
    assert_eq!(harness.repository().mutation_count(), 1);
}
