//! Lifecycle events published to the event bus

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::batch::{BatchOperation, BatchStatus, OutcomeCounts};
use crate::types::{BatchId, OperationType, ProjectId};

/// Lifecycle milestone
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BatchEventKind {
    Created,
    Completed,
    PartiallyCompleted,
    Failed,
    Cancelled,
    Undone,
    UndoFailed,
}

impl BatchEventKind {
    /// Event announcing a terminal status, if that status has one
    #[must_use]
    pub fn for_status(status: BatchStatus) -> Option<Self> {
        match status {
            BatchStatus::Completed => Some(Self::Completed),
            BatchStatus::PartiallyCompleted => Some(Self::PartiallyCompleted),
            BatchStatus::Failed => Some(Self::Failed),
            BatchStatus::Cancelled => Some(Self::Cancelled),
            BatchStatus::Undone => Some(Self::Undone),
            BatchStatus::Preflighting | BatchStatus::Preflighted | BatchStatus::Executing => None,
        }
    }
}

/// Event envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchEvent {
    pub kind: BatchEventKind,
    pub batch_id: BatchId,
    pub project_id: ProjectId,
    #[serde(rename = "type")]
    pub op_type: OperationType,
    pub status: BatchStatus,
    pub counts: OutcomeCounts,
    pub at: DateTime<Utc>,
}

impl BatchEvent {
    /// Build an event from the current record
    #[must_use]
    pub fn from_batch(kind: BatchEventKind, batch: &BatchOperation) -> Self {
        Self {
            kind,
            batch_id: batch.id,
            project_id: batch.project_id.clone(),
            op_type: batch.op_type,
            status: batch.status,
            counts: batch.counts(),
            at: Utc::now(),
        }
    }
}
