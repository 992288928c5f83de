//! All-or-nothing batches: abort, rollback and cancellation

use pretty_assertions::assert_eq;
use proptest::prelude::*;
use serde_json::json;
use std::sync::{Arc, OnceLock};

use docbatch_core::{
    BatchEventKind, BatchId, BatchStatus, ErrorCode, ItemOutcome, NodeId, OperationType, ReversalKind, UserId,
};
use docbatch_engine::BatchCoordinator;
use docbatch_test_utils::Harness;

fn bob() -> UserId {
    UserId::new("bob")
}

#[tokio::test]
async fn test_atomic_move_rolls_back_on_lock() {
    let harness = Harness::new(2, 4);
    let before = harness.shape();
    harness.backend.locks.lock(&NodeId::new("f1-d3"), &bob());

    let request = harness
        .request(OperationType::Move, &["f1-d1", "f1-d2", "f1-d3", "f1-d4"])
        .with_atomic(true)
        .with_payload("newParentId", json!("f2"));
    let batch = harness.run(request).await;

    assert_eq!(batch.status, BatchStatus::Failed);
    assert_eq!(batch.failure.as_ref().map(|f| f.code), Some(ErrorCode::LockConflict));
    assert_eq!(harness.shape(), before);

    assert_eq!(batch.outcome_of(&NodeId::new("f1-d4")), Some(ItemOutcome::Skipped));
    let rolled_back: Vec<&str> = batch.reversals.iter().map(|r| r.target_id.as_str()).collect();
    assert_eq!(rolled_back, vec!["f1-d2", "f1-d1"]);
    assert!(batch
        .reversals
        .iter()
        .all(|r| r.succeeded && r.kind == ReversalKind::Rollback));
    assert!(batch.undo_failure.is_none());
    assert_eq!(
        harness.events(&batch.id),
        vec![BatchEventKind::Created, BatchEventKind::Failed]
    );
}

#[tokio::test]
async fn test_atomic_delete_rolls_back_on_permission_failure() {
    let harness = Harness::new(2, 3);
    let before = harness.shape();
    harness
        .backend
        .permissions
        .deny_node(&harness.user, &NodeId::new("f2-d1"));

    let batch = harness
        .run(
            harness
                .request(OperationType::Delete, &["f1"])
                .with_descendants(true)
                .with_atomic(true),
        )
        .await;
    assert_eq!(batch.status, BatchStatus::Completed);

    let undone = harness.coordinator.undo(&harness.user, batch.id).await.expect("undo");
    assert_eq!(undone.status, BatchStatus::Undone);
    assert_eq!(harness.shape(), before);

    let batch = harness
        .run(
            harness
                .request(OperationType::Delete, &["f1-d1", "f1-d2", "f2-d1", "f2-d2"])
                .with_atomic(true),
        )
        .await;
    assert_eq!(batch.status, BatchStatus::Failed);
    assert_eq!(batch.failure.as_ref().map(|f| f.code), Some(ErrorCode::PermissionDenied));
    assert_eq!(harness.shape(), before);
    for id in ["f1-d1", "f1-d2"] {
        assert!(!harness.repository().is_deleted(&NodeId::new(id)));
    }
}

#[tokio::test]
async fn test_atomic_cancel_restores_tree() {
    let harness = Harness::new(2, 5);
    let before = harness.shape();
    let running: Arc<OnceLock<(BatchCoordinator, BatchId)>> = Arc::new(OnceLock::new());
    let slot = Arc::clone(&running);
    harness.backend.repository.on_mutation(move |count| {
        if count == 2 {
            if let Some((coordinator, batch_id)) = slot.get() {
                coordinator.cancel(*batch_id).expect("cancellable");
            }
        }
    });

    let request = harness
        .request(OperationType::Move, &["f1-d1", "f1-d2", "f1-d3", "f1-d4", "f1-d5"])
        .with_atomic(true)
        .with_payload("newParentId", json!("f2"));
    let response = harness.submit(request).await;
    running
        .set((harness.coordinator.clone(), response.batch_id))
        .expect("slot empty");

    let batch = harness.wait(response.batch_id).await;
    assert_eq!(batch.status, BatchStatus::Cancelled);
    assert_eq!(batch.counts().succeeded, 2);
    assert_eq!(batch.counts().cancelled, 3);
    assert_eq!(batch.reversals.len(), 2);
    assert!(batch.failure.is_none());
    assert_eq!(harness.shape(), before);
}

#[tokio::test]
async fn test_incomplete_rollback_is_annotated() {
    let harness = Harness::new(2, 3);
    let locks = Arc::clone(&harness.backend.locks);
    harness.backend.repository.on_mutation(move |count| {
        if count == 1 {
            // someone grabs the moved node and the next target
            locks.lock(&NodeId::new("f1-d1"), &bob());
            locks.lock(&NodeId::new("f1-d2"), &bob());
        }
    });

    let batch = harness
        .run(
            harness
                .request(OperationType::Move, &["f1-d1", "f1-d2", "f1-d3"])
                .with_atomic(true)
                .with_payload("newParentId", json!("f2")),
        )
        .await;

    assert_eq!(batch.status, BatchStatus::Failed);
    let annotation = batch.undo_failure.as_ref().expect("rollback failure recorded");
    assert_eq!(annotation.kind, ReversalKind::Rollback);
    assert_eq!(annotation.failed_targets, vec![NodeId::new("f1-d1")]);
    assert_eq!(batch.reversals.len(), 1);
    assert!(!batch.reversals[0].succeeded);
    assert_eq!(
        harness.events(&batch.id),
        vec![BatchEventKind::Created, BatchEventKind::Failed, BatchEventKind::UndoFailed]
    );
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_atomic_delete_is_all_or_nothing(docs in 2usize..7, blocked in 0usize..7, block in any::<bool>()) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async {
            let harness = Harness::new(1, docs);
            let before = harness.shape();
            let blocked = blocked % docs;
            if block {
                harness
                    .backend
                    .locks
                    .lock(&harness.tree.documents[blocked], &bob());
            }

            let targets: Vec<String> = harness.tree.documents.iter().map(ToString::to_string).collect();
            let targets: Vec<&str> = targets.iter().map(String::as_str).collect();
            let batch = harness
                .run(harness.request(OperationType::Delete, &targets).with_atomic(true))
                .await;

            let after = harness.shape();
            if block {
                prop_assert_eq!(batch.status, BatchStatus::Failed);
                prop_assert_eq!(after, before);
            } else {
                prop_assert_eq!(batch.status, BatchStatus::Completed);
                prop_assert_eq!(after, vec!["-/f1@0".to_string()]);
            }
            Ok(())
        })?;
    }
}
