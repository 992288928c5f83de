//! Batch lifecycle transitions
//!
//! Preflighting -> Preflighted -> Executing -> {Completed, PartiallyCompleted,
//! Failed, Cancelled}; Completed and PartiallyCompleted may later become
//! Undone. Every other move is rejected.

use crate::batch::BatchStatus;
use crate::error::TransitionError;

/// Validates a status transition.
///
/// # Errors
/// Returns `TransitionError` if `to` is not reachable from `from` in one step.
pub fn validate_transition(from: BatchStatus, to: BatchStatus) -> Result<(), TransitionError> {
    if allowed(from, to) {
        Ok(())
    } else {
        Err(TransitionError { from, to })
    }
}

/// Statuses reachable from `from` in one step
#[must_use]
pub fn allowed_transitions(from: BatchStatus) -> &'static [BatchStatus] {
    use BatchStatus::*;
    match from {
        Preflighting => &[Preflighted],
        Preflighted => &[Executing],
        Executing => &[Completed, PartiallyCompleted, Failed, Cancelled],
        Completed | PartiallyCompleted => &[Undone],
        Failed | Cancelled | Undone => &[],
    }
}

fn allowed(from: BatchStatus, to: BatchStatus) -> bool {
    allowed_transitions(from).contains(&to)
}
