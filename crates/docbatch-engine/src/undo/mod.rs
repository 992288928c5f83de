//! Undo manager
//!
//! Reverses a finished batch by replaying its undo log newest first. The
//! same replay serves atomic rollback inside the executor.

mod log;
mod plan;

pub use log::UndoLog;
pub use plan::{anchored_position, plan_compensations, CompensatingAction, Compensation};

use chrono::Utc;
use dashmap::DashSet;
use std::sync::Arc;
use std::time::Duration;

use docbatch_core::{
    BatchError, BatchEvent, BatchEventKind, BatchId, BatchOperation, BatchStatus, NodeId, ReversalKind,
    ReversalRecord, UndoFailure, UserId,
};

use crate::collaborators::{Collaborators, Mutation};
use crate::retry::retry_transient;
use crate::store::BatchStore;

/// Applies compensating actions recorded by the executor
pub struct UndoManager {
    collaborators: Collaborators,
    store: Arc<dyn BatchStore>,
    log: Arc<UndoLog>,
    running: DashSet<BatchId>,
    event_timeout: Duration,
}

impl UndoManager {
    #[must_use]
    pub fn new(
        collaborators: Collaborators,
        store: Arc<dyn BatchStore>,
        log: Arc<UndoLog>,
        event_timeout: Duration,
    ) -> Self {
        Self {
            collaborators,
            store,
            log,
            running: DashSet::new(),
            event_timeout,
        }
    }

    /// Reverse every succeeded item of a `Completed`/`PartiallyCompleted` batch
    ///
    /// Entries reversed by an earlier, partially failed attempt are skipped.
    ///
    /// # Errors
    /// - `NotFound` for unknown batches
    /// - `InvalidState` outside `Completed`/`PartiallyCompleted`, or while
    ///   another undo of the same batch runs
    /// - `PermissionDenied` if the user cannot edit the project
    /// - `UndoFailed` if some compensations could not be applied; the batch
    ///   keeps its status and carries an `undo_failure` annotation
    pub async fn undo(&self, user: &UserId, batch_id: BatchId) -> Result<Arc<BatchOperation>, BatchError> {
        let batch = self.store.load(&batch_id).ok_or(BatchError::NotFound(batch_id))?;
        if !batch.status.is_undoable() {
            return Err(BatchError::InvalidState {
                batch_id,
                status: batch.status,
                action: "undo",
            });
        }
        if !self
            .collaborators
            .permissions
            .can_edit_project(user, &batch.project_id)
            .await
        {
            return Err(BatchError::PermissionDenied(format!(
                "{user} may not edit project {}",
                batch.project_id
            )));
        }

        let Some(_running) = RunningGuard::acquire(&self.running, batch_id) else {
            return Err(BatchError::InvalidState {
                batch_id,
                status: batch.status,
                action: "undo concurrently",
            });
        };

        tracing::info!(%batch_id, "undo started");
        let plan = plan_compensations(&self.log.entries(&batch_id), &batch.reversed_seqs());
        let records = self.compensate(&batch, plan, ReversalKind::Undo, user).await;
        let failed: Vec<NodeId> = records
            .iter()
            .filter(|r| !r.succeeded)
            .map(|r| r.target_id.clone())
            .collect();

        let updated = self.store.update(&batch_id, &mut |record| {
            for reversal in &records {
                record.record_reversal(reversal.clone())?;
            }
            if failed.is_empty() {
                record.annotate_undo_failure(None)?;
                record.transition(BatchStatus::Undone)?;
            } else {
                record.annotate_undo_failure(Some(UndoFailure {
                    kind: ReversalKind::Undo,
                    failed_targets: failed.clone(),
                    message: format!("{} compensating action(s) failed", failed.len()),
                    at: Utc::now(),
                }))?;
            }
            Ok(())
        })?;

        if failed.is_empty() {
            tracing::info!(%batch_id, reversed = records.len(), "batch undone");
            self.collaborators
                .publish(BatchEvent::from_batch(BatchEventKind::Undone, &updated), self.event_timeout)
                .await;
            Ok(updated)
        } else {
            tracing::warn!(%batch_id, failed = failed.len(), "undo partially failed");
            self.collaborators
                .publish(BatchEvent::from_batch(BatchEventKind::UndoFailed, &updated), self.event_timeout)
                .await;
            Err(BatchError::UndoFailed {
                batch_id,
                failed: failed.len(),
            })
        }
    }

    /// Replay the whole log of a batch that is still executing
    pub(crate) async fn rollback(&self, batch: &BatchOperation) -> Vec<ReversalRecord> {
        let plan = plan_compensations(&self.log.entries(&batch.id), &batch.reversed_seqs());
        tracing::info!(batch_id = %batch.id, steps = plan.len(), "rolling back");
        self.compensate(batch, plan, ReversalKind::Rollback, &batch.created_by).await
    }

    async fn compensate(
        &self,
        batch: &BatchOperation,
        plan: Vec<Compensation>,
        kind: ReversalKind,
        user: &UserId,
    ) -> Vec<ReversalRecord> {
        let mut records = Vec::with_capacity(plan.len());
        for step in plan {
            let outcome = self.apply(batch, &step, user).await;
            if let Err(reason) = &outcome {
                tracing::warn!(batch_id = %batch.id, node = %step.target_id, %reason, "compensation failed");
            }
            records.push(ReversalRecord {
                seq: step.seq,
                target_id: step.target_id,
                kind,
                succeeded: outcome.is_ok(),
                reason: outcome.unwrap_or_else(|reason| reason),
                at: Utc::now(),
            });
        }
        records
    }

    async fn apply(&self, batch: &BatchOperation, step: &Compensation, user: &UserId) -> Result<String, String> {
        let subject = step.action.subject();
        match self.collaborators.foreign_lock(subject, user).await {
            Ok(None) => {}
            Ok(Some(owner)) => return Err(format!("{subject} is locked by {owner}")),
            Err(err) => return Err(err.to_string()),
        }

        let repository = &self.collaborators.repository;
        let mutation = match &step.action {
            CompensatingAction::MoveBack {
                node,
                parent,
                position,
                prior_siblings,
            } => {
                let current = retry_transient(&batch.retry, None, || {
                    repository.children(&batch.project_id, parent.as_ref())
                })
                .await
                .result
                .map_err(|err| err.to_string())?;
                Mutation::Move {
                    parent: parent.clone(),
                    position: Some(anchored_position(node, *position, prior_siblings, &current)),
                }
            }
            action => action.mutation(),
        };
        let attempted = retry_transient(&batch.retry, None, || repository.mutate(subject, mutation.clone())).await;
        match attempted.result {
            Ok(_) => Ok(match &step.action {
                CompensatingAction::Restore(_) => "restored".to_string(),
                CompensatingAction::MoveBack { .. } => "moved back".to_string(),
                CompensatingAction::RemoveClone(clone_id) => format!("removed clone {clone_id}"),
            }),
            Err(err) => Err(format!("{err} after {} attempt(s)", attempted.attempts)),
        }
    }
}

impl std::fmt::Debug for UndoManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UndoManager")
            .field("running", &self.running.len())
            .finish_non_exhaustive()
    }
}

struct RunningGuard<'a> {
    running: &'a DashSet<BatchId>,
    batch_id: BatchId,
}

impl<'a> RunningGuard<'a> {
    fn acquire(running: &'a DashSet<BatchId>, batch_id: BatchId) -> Option<Self> {
        running.insert(batch_id).then_some(Self { running, batch_id })
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.running.remove(&self.batch_id);
    }
}
