//! The `BatchOperation` aggregate and its satellite records
//!
//! A batch record is created once at submission, then only ever moves
//! forward: item results are appended, status advances along the state
//! machine, and after a terminal status the only permitted change is undo
//! bookkeeping. Collections are persistent (`im`) or shared (`Arc`) so a
//! snapshot is cheap to clone for concurrent readers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

use crate::config::RetryPolicy;
use crate::error::{ErrorCode, RecordError, TransitionError};
use crate::state_machine;
use crate::types::{BatchId, ConflictPolicy, DocumentNode, NodeId, Operation, OperationType, ProjectId, UserId, Version};

/// Batch lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BatchStatus {
    Preflighting,
    Preflighted,
    Executing,
    Completed,
    PartiallyCompleted,
    Failed,
    Cancelled,
    Undone,
}

impl BatchStatus {
    /// Execution has finished (undo may still follow)
    #[inline]
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::PartiallyCompleted | Self::Failed | Self::Cancelled | Self::Undone
        )
    }

    /// Cancellation is accepted
    #[inline]
    #[must_use]
    pub fn is_cancellable(self) -> bool {
        matches!(self, Self::Preflighted | Self::Executing)
    }

    /// Undo is accepted
    #[inline]
    #[must_use]
    pub fn is_undoable(self) -> bool {
        matches!(self, Self::Completed | Self::PartiallyCompleted)
    }
}

/// Per-item execution outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ItemOutcome {
    Succeeded,
    Skipped,
    Failed,
    Cancelled,
}

/// Data sufficient to reverse one applied item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum UndoData {
    /// Soft-deleted node; restore the pre-delete record
    Deleted { record: DocumentNode },
    /// Moved node; put it back under its prior parent at its prior index
    Moved {
        prior_parent: Option<NodeId>,
        prior_position: usize,
        prior_siblings: Vec<NodeId>,
    },
    /// Copied node; remove the clone
    Copied { clone_id: NodeId },
}

/// One append-only undo log entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UndoEntry {
    /// Position in the batch's log; replay runs in descending order
    pub seq: u64,
    pub target_id: NodeId,
    /// Live version right before the mutation
    pub prior_version: Version,
    /// Expected version that was ignored under `ForceOverwrite`
    pub overwritten_expectation: Option<Version>,
    pub data: UndoData,
    pub recorded_at: DateTime<Utc>,
}

/// Outcome of one item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemResult {
    pub target_id: NodeId,
    pub outcome: ItemOutcome,
    /// Always present, also on success
    pub reason: String,
    pub error: Option<ErrorCode>,
    pub undo_data: Option<UndoData>,
    pub attempts: u32,
    pub finished_at: DateTime<Utc>,
}

impl ItemResult {
    /// Successful item
    #[must_use]
    pub fn succeeded(target_id: NodeId, reason: impl Into<String>, undo_data: Option<UndoData>, attempts: u32) -> Self {
        Self {
            target_id,
            outcome: ItemOutcome::Succeeded,
            reason: reason.into(),
            error: None,
            undo_data,
            attempts,
            finished_at: Utc::now(),
        }
    }

    /// Non-successful item
    #[must_use]
    pub fn unsuccessful(
        target_id: NodeId,
        outcome: ItemOutcome,
        error: Option<ErrorCode>,
        reason: impl Into<String>,
        attempts: u32,
    ) -> Self {
        Self {
            target_id,
            outcome,
            reason: reason.into(),
            error,
            undo_data: None,
            attempts,
            finished_at: Utc::now(),
        }
    }
}

/// Why a reversal ran
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReversalKind {
    /// Automatic rollback of an atomic batch
    Rollback,
    /// Client-requested undo
    Undo,
}

/// Result of one compensating action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReversalRecord {
    /// Undo log sequence number that was replayed
    pub seq: u64,
    pub target_id: NodeId,
    pub kind: ReversalKind,
    pub succeeded: bool,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// Informational annotation left by a reversal that could not fully apply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UndoFailure {
    pub kind: ReversalKind,
    pub failed_targets: Vec<NodeId>,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Batch-level failure reason
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchFailure {
    pub code: ErrorCode,
    pub message: String,
}

/// One non-valid preflight target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreflightIssue {
    pub target_id: NodeId,
    pub code: ErrorCode,
    pub message: String,
}

/// Preflight tallies; each target lands in exactly one bucket
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreflightSummary {
    pub total: usize,
    pub valid: usize,
    pub conflicted: usize,
    pub locked: usize,
    pub missing: usize,
    pub issues: Vec<PreflightIssue>,
}

impl PreflightSummary {
    /// Whether every target passed
    #[inline]
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.valid == self.total
    }
}

/// Tally of recorded outcomes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutcomeCounts {
    pub succeeded: usize,
    pub skipped: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl OutcomeCounts {
    /// Add one outcome
    #[inline]
    pub fn add(&mut self, outcome: ItemOutcome) {
        match outcome {
            ItemOutcome::Succeeded => self.succeeded += 1,
            ItemOutcome::Skipped => self.skipped += 1,
            ItemOutcome::Failed => self.failed += 1,
            ItemOutcome::Cancelled => self.cancelled += 1,
        }
    }

    /// Total recorded
    #[inline]
    #[must_use]
    pub fn total(&self) -> usize {
        self.succeeded + self.skipped + self.failed + self.cancelled
    }

    /// Terminal status for a finished, non-cancelled, non-atomic run
    ///
    /// Everything succeeded is `Completed`; nothing succeeded with at least
    /// one failure is `Failed`; anything else (including all-skipped) is
    /// `PartiallyCompleted`.
    #[must_use]
    pub fn settled_status(&self) -> BatchStatus {
        if self.succeeded == self.total() {
            BatchStatus::Completed
        } else if self.succeeded == 0 && self.failed > 0 {
            BatchStatus::Failed
        } else {
            BatchStatus::PartiallyCompleted
        }
    }
}

/// Frozen, ordered, deduplicated target list with O(1) membership
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "Vec<NodeId>", into = "Vec<NodeId>")]
pub struct TargetList(Arc<TargetListInner>);

#[derive(Debug, PartialEq, Eq, Default)]
struct TargetListInner {
    order: Vec<NodeId>,
    index: HashSet<NodeId>,
}

impl TargetList {
    /// Build from IDs, dropping repeats and keeping first-seen order
    #[must_use]
    pub fn new(ids: impl IntoIterator<Item = NodeId>) -> Self {
        let mut inner = TargetListInner::default();
        for id in ids {
            if inner.index.insert(id.clone()) {
                inner.order.push(id);
            }
        }
        Self(Arc::new(inner))
    }

    /// Membership
    #[inline]
    #[must_use]
    pub fn contains(&self, id: &NodeId) -> bool {
        self.0.index.contains(id)
    }

    /// IDs in order
    #[inline]
    #[must_use]
    pub fn as_slice(&self) -> &[NodeId] {
        &self.0.order
    }

    /// Iterate in order
    #[inline]
    pub fn iter(&self) -> std::slice::Iter<'_, NodeId> {
        self.0.order.iter()
    }

    /// Count
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.order.len()
    }

    /// Whether empty
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.order.is_empty()
    }

    /// Whether every ID of `other` is contained here
    #[must_use]
    pub fn is_superset_of(&self, other: &TargetList) -> bool {
        other.iter().all(|id| self.contains(id))
    }
}

impl From<Vec<NodeId>> for TargetList {
    fn from(ids: Vec<NodeId>) -> Self {
        Self::new(ids)
    }
}

impl From<TargetList> for Vec<NodeId> {
    fn from(list: TargetList) -> Self {
        list.0.order.clone()
    }
}

impl<'a> IntoIterator for &'a TargetList {
    type Item = &'a NodeId;
    type IntoIter = std::slice::Iter<'a, NodeId>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// The aggregate root for one logical batch request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchOperation {
    pub id: BatchId,
    pub project_id: ProjectId,
    #[serde(rename = "type")]
    pub op_type: OperationType,
    pub operation: Operation,
    pub requested_target_ids: TargetList,
    pub expanded_target_ids: TargetList,
    pub atomic: bool,
    pub conflict_policy: ConflictPolicy,
    pub expected_versions: im::HashMap<NodeId, Version>,
    pub client_request_id: Option<String>,
    pub retry: RetryPolicy,
    pub status: BatchStatus,
    pub preflight_summary: PreflightSummary,
    pub item_results: im::Vector<ItemResult>,
    outcome_index: im::HashMap<NodeId, ItemOutcome>,
    pub reversals: im::Vector<ReversalRecord>,
    pub undo_failure: Option<UndoFailure>,
    pub failure: Option<BatchFailure>,
    pub created_by: UserId,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub undone_at: Option<DateTime<Utc>>,
}

/// Submission-time inputs for a new batch record
#[derive(Debug, Clone)]
pub struct NewBatch {
    pub project_id: ProjectId,
    pub operation: Operation,
    pub requested: TargetList,
    pub expanded: TargetList,
    pub atomic: bool,
    pub conflict_policy: ConflictPolicy,
    pub expected_versions: im::HashMap<NodeId, Version>,
    pub client_request_id: Option<String>,
    pub retry: RetryPolicy,
    pub created_by: UserId,
}

impl BatchOperation {
    /// Create a record in `Preflighting`
    ///
    /// The expanded list is widened to include every requested ID so the
    /// superset invariant holds by construction.
    #[must_use]
    pub fn new(init: NewBatch) -> Self {
        let expanded = if init.expanded.is_superset_of(&init.requested) {
            init.expanded
        } else {
            TargetList::new(init.requested.iter().chain(init.expanded.iter()).cloned())
        };

        Self {
            id: BatchId::new(),
            project_id: init.project_id,
            op_type: init.operation.op_type(),
            operation: init.operation,
            requested_target_ids: init.requested,
            expanded_target_ids: expanded,
            atomic: init.atomic,
            conflict_policy: init.conflict_policy,
            expected_versions: init.expected_versions,
            client_request_id: init.client_request_id,
            retry: init.retry,
            status: BatchStatus::Preflighting,
            preflight_summary: PreflightSummary::default(),
            item_results: im::Vector::new(),
            outcome_index: im::HashMap::new(),
            reversals: im::Vector::new(),
            undo_failure: None,
            failure: None,
            created_by: init.created_by,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            cancelled_at: None,
            undone_at: None,
        }
    }

    /// Advance the status, stamping the matching timestamp
    ///
    /// # Errors
    /// Returns `TransitionError` for any move the state machine forbids.
    pub fn transition(&mut self, to: BatchStatus) -> Result<(), TransitionError> {
        state_machine::validate_transition(self.status, to)?;
        let now = Utc::now();
        match to {
            BatchStatus::Executing => self.started_at = Some(now),
            BatchStatus::Completed | BatchStatus::PartiallyCompleted | BatchStatus::Failed => {
                self.completed_at = Some(now);
            }
            BatchStatus::Cancelled => {
                self.cancelled_at = Some(now);
                self.completed_at = Some(now);
            }
            BatchStatus::Undone => self.undone_at = Some(now),
            BatchStatus::Preflighting | BatchStatus::Preflighted => {}
        }
        self.status = to;
        Ok(())
    }

    /// Append one item outcome
    ///
    /// # Errors
    /// Rejects unknown targets, second outcomes for a target and writes
    /// outside `Executing`.
    pub fn record_item(&mut self, result: ItemResult) -> Result<(), RecordError> {
        if self.status != BatchStatus::Executing {
            return Err(RecordError::Frozen(self.status, "item results"));
        }
        if !self.expanded_target_ids.contains(&result.target_id) {
            return Err(RecordError::UnknownTarget(result.target_id));
        }
        if self.outcome_index.contains_key(&result.target_id) {
            return Err(RecordError::DuplicateResult(result.target_id));
        }
        self.outcome_index.insert(result.target_id.clone(), result.outcome);
        self.item_results.push_back(result);
        Ok(())
    }

    /// Append one reversal record
    ///
    /// # Errors
    /// Only rollback (while executing) and undo (after success) may write.
    pub fn record_reversal(&mut self, record: ReversalRecord) -> Result<(), RecordError> {
        let allowed = match record.kind {
            ReversalKind::Rollback => self.status == BatchStatus::Executing,
            ReversalKind::Undo => self.status.is_undoable(),
        };
        if !allowed {
            return Err(RecordError::Frozen(self.status, "reversal records"));
        }
        self.reversals.push_back(record);
        Ok(())
    }

    /// Set or clear the undo-failure annotation
    ///
    /// # Errors
    /// Rejected once the batch is `Undone`.
    pub fn annotate_undo_failure(&mut self, failure: Option<UndoFailure>) -> Result<(), RecordError> {
        if self.status == BatchStatus::Undone {
            return Err(RecordError::Frozen(self.status, "undo annotations"));
        }
        self.undo_failure = failure;
        Ok(())
    }

    /// Recorded outcome for a target
    #[inline]
    #[must_use]
    pub fn outcome_of(&self, id: &NodeId) -> Option<ItemOutcome> {
        self.outcome_index.get(id).copied()
    }

    /// Full result for a target
    #[must_use]
    pub fn result_of(&self, id: &NodeId) -> Option<&ItemResult> {
        self.item_results.iter().find(|r| &r.target_id == id)
    }

    /// Targets without an outcome, in expansion order
    pub fn unprocessed(&self) -> impl Iterator<Item = &NodeId> + '_ {
        self.expanded_target_ids
            .iter()
            .filter(move |id| !self.outcome_index.contains_key(*id))
    }

    /// Number of recorded outcomes
    #[inline]
    #[must_use]
    pub fn processed(&self) -> usize {
        self.item_results.len()
    }

    /// Number of targets
    #[inline]
    #[must_use]
    pub fn total(&self) -> usize {
        self.expanded_target_ids.len()
    }

    /// Outcome tally
    #[must_use]
    pub fn counts(&self) -> OutcomeCounts {
        let mut counts = OutcomeCounts::default();
        for result in &self.item_results {
            counts.add(result.outcome);
        }
        counts
    }

    /// Sequence numbers already reversed successfully
    #[must_use]
    pub fn reversed_seqs(&self) -> HashSet<u64> {
        self.reversals
            .iter()
            .filter(|r| r.succeeded)
            .map(|r| r.seq)
            .collect()
    }

    /// Progress snapshot with the last `recent` outcomes
    #[must_use]
    pub fn progress(&self, recent: usize) -> BatchProgress {
        let skip = self.item_results.len().saturating_sub(recent);
        BatchProgress {
            batch_id: self.id,
            status: self.status,
            processed: self.processed(),
            total: self.total(),
            counts: self.counts(),
            recent_outcomes: self
                .item_results
                .iter()
                .skip(skip)
                .map(|r| RecentOutcome {
                    target_id: r.target_id.clone(),
                    outcome: r.outcome,
                    reason: r.reason.clone(),
                    error: r.error,
                })
                .collect(),
            failure: self.failure.clone(),
            undo_failure: self.undo_failure.clone(),
        }
    }
}

/// One entry of `BatchProgress::recent_outcomes`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecentOutcome {
    pub target_id: NodeId,
    pub outcome: ItemOutcome,
    pub reason: String,
    pub error: Option<ErrorCode>,
}

/// Read-only progress view returned to pollers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchProgress {
    pub batch_id: BatchId,
    pub status: BatchStatus,
    pub processed: usize,
    pub total: usize,
    pub counts: OutcomeCounts,
    pub recent_outcomes: Vec<RecentOutcome>,
    pub failure: Option<BatchFailure>,
    pub undo_failure: Option<UndoFailure>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(raw: &[&str]) -> Vec<NodeId> {
        raw.iter().map(|s| NodeId::new(*s)).collect()
    }

    fn new_batch(requested: &[&str], expanded: &[&str]) -> BatchOperation {
        BatchOperation::new(NewBatch {
            project_id: ProjectId::new("p"),
            operation: Operation::Delete,
            requested: TargetList::new(ids(requested)),
            expanded: TargetList::new(ids(expanded)),
            atomic: false,
            conflict_policy: ConflictPolicy::FailFast,
            expected_versions: im::HashMap::new(),
            client_request_id: None,
            retry: RetryPolicy::default(),
            created_by: UserId::new("u"),
        })
    }

    fn executing(requested: &[&str]) -> BatchOperation {
        let mut op = new_batch(requested, requested);
        op.transition(BatchStatus::Preflighted).unwrap();
        op.transition(BatchStatus::Executing).unwrap();
        op
    }

    #[test]
    fn target_list_dedups_in_first_seen_order() {
        let list = TargetList::new(ids(&["b", "a", "b", "c", "a"]));
        assert_eq!(list.as_slice(), ids(&["b", "a", "c"]).as_slice());
        assert!(list.contains(&NodeId::new("c")));
    }

    #[test]
    fn expanded_always_covers_requested() {
        let op = new_batch(&["a", "b"], &["a", "x"]);
        assert!(op.expanded_target_ids.is_superset_of(&op.requested_target_ids));
        assert_eq!(op.expanded_target_ids.as_slice(), ids(&["a", "b", "x"]).as_slice());
    }

    #[test]
    fn record_item_enforces_invariants() {
        let mut op = executing(&["a", "b"]);
        op.record_item(ItemResult::succeeded(NodeId::new("a"), "deleted", None, 1))
            .unwrap();

        let dup = op.record_item(ItemResult::succeeded(NodeId::new("a"), "deleted", None, 1));
        assert_eq!(dup, Err(RecordError::DuplicateResult(NodeId::new("a"))));

        let unknown = op.record_item(ItemResult::succeeded(NodeId::new("z"), "deleted", None, 1));
        assert_eq!(unknown, Err(RecordError::UnknownTarget(NodeId::new("z"))));

        assert_eq!(op.unprocessed().cloned().collect::<Vec<_>>(), ids(&["b"]));
        assert_eq!(op.outcome_of(&NodeId::new("a")), Some(ItemOutcome::Succeeded));
    }

    #[test]
    fn terminal_record_rejects_items() {
        let mut op = executing(&["a"]);
        op.record_item(ItemResult::succeeded(NodeId::new("a"), "deleted", None, 1))
            .unwrap();
        op.transition(BatchStatus::Completed).unwrap();

        let late = op.record_item(ItemResult::succeeded(NodeId::new("a"), "again", None, 1));
        assert!(matches!(late, Err(RecordError::Frozen(BatchStatus::Completed, _))));
        assert!(op.completed_at.is_some());
    }

    #[test]
    fn settled_status_rules() {
        let mut all_ok = OutcomeCounts::default();
        all_ok.add(ItemOutcome::Succeeded);
        assert_eq!(all_ok.settled_status(), BatchStatus::Completed);

        let mut mixed = all_ok;
        mixed.add(ItemOutcome::Failed);
        assert_eq!(mixed.settled_status(), BatchStatus::PartiallyCompleted);

        let mut only_skipped = OutcomeCounts::default();
        only_skipped.add(ItemOutcome::Skipped);
        assert_eq!(only_skipped.settled_status(), BatchStatus::PartiallyCompleted);

        let mut only_failed = OutcomeCounts::default();
        only_failed.add(ItemOutcome::Failed);
        only_failed.add(ItemOutcome::Skipped);
        assert_eq!(only_failed.settled_status(), BatchStatus::Failed);
    }

    #[test]
    fn progress_reports_recent_tail() {
        let mut op = executing(&["a", "b", "c"]);
        for id in ["a", "b", "c"] {
            op.record_item(ItemResult::succeeded(NodeId::new(id), "deleted", None, 1))
                .unwrap();
        }

        let progress = op.progress(2);
        assert_eq!(progress.processed, 3);
        assert_eq!(progress.total, 3);
        let recent: Vec<_> = progress.recent_outcomes.iter().map(|r| r.target_id.as_str()).collect();
        assert_eq!(recent, vec!["b", "c"]);
    }

    #[test]
    fn record_roundtrips_through_json() {
        let mut op = executing(&["a", "b"]);
        op.record_item(ItemResult::succeeded(NodeId::new("a"), "deleted", None, 1))
            .unwrap();

        let json = serde_json::to_string(&op).unwrap();
        let back: BatchOperation = serde_json::from_str(&json).unwrap();
        assert_eq!(back.expanded_target_ids, op.expanded_target_ids);
        assert_eq!(back.outcome_of(&NodeId::new("a")), Some(ItemOutcome::Succeeded));
        assert_eq!(back.item_results.len(), 1);
    }
}
