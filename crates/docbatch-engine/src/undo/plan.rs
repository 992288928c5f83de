//! Compensation planning
//!
//! A pure function of the undo log: it never looks at the forward path or
//! the live tree.

use std::collections::HashSet;

use docbatch_core::{DocumentNode, NodeId, UndoData, UndoEntry};

use crate::collaborators::Mutation;

/// Inverse of one applied item
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompensatingAction {
    /// Undo a soft delete
    Restore(DocumentNode),
    /// Undo a move
    ///
    /// `position` is the recorded index; `prior_siblings` lets the applier
    /// anchor the node next to its former neighbours instead.
    MoveBack {
        node: NodeId,
        parent: Option<NodeId>,
        position: usize,
        prior_siblings: Vec<NodeId>,
    },
    /// Undo a copy
    RemoveClone(NodeId),
}

impl CompensatingAction {
    /// Node the compensating write targets
    #[must_use]
    pub fn subject(&self) -> &NodeId {
        match self {
            Self::Restore(record) => &record.id,
            Self::MoveBack { node, .. } => node,
            Self::RemoveClone(clone_id) => clone_id,
        }
    }

    /// Repository mutation that performs it
    #[must_use]
    pub fn mutation(&self) -> Mutation {
        match self {
            Self::Restore(record) => Mutation::Restore(record.clone()),
            Self::MoveBack { parent, position, .. } => Mutation::Move {
                parent: parent.clone(),
                position: Some(*position),
            },
            Self::RemoveClone(_) => Mutation::Purge,
        }
    }
}

/// One planned step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Compensation {
    pub seq: u64,
    pub target_id: NodeId,
    pub action: CompensatingAction,
}

/// Compensations for `entries` newest first, skipping sequence numbers
/// already reversed
#[must_use]
pub fn plan_compensations(entries: &[UndoEntry], already_reversed: &HashSet<u64>) -> Vec<Compensation> {
    let mut plan: Vec<Compensation> = entries
        .iter()
        .filter(|entry| !already_reversed.contains(&entry.seq))
        .map(|entry| Compensation {
            seq: entry.seq,
            target_id: entry.target_id.clone(),
            action: inverse(entry),
        })
        .collect();
    plan.sort_by(|a, b| b.seq.cmp(&a.seq));
    plan
}

fn inverse(entry: &UndoEntry) -> CompensatingAction {
    match &entry.data {
        UndoData::Deleted { record } => CompensatingAction::Restore(record.clone()),
        UndoData::Moved {
            prior_parent,
            prior_position,
            prior_siblings,
        } => CompensatingAction::MoveBack {
            node: entry.target_id.clone(),
            parent: prior_parent.clone(),
            position: *prior_position,
            prior_siblings: prior_siblings.clone(),
        },
        UndoData::Copied { clone_id } => CompensatingAction::RemoveClone(clone_id.clone()),
    }
}

/// Index at which `node` goes back among `current` siblings
///
/// Right after the nearest former predecessor still present, else right
/// before the nearest former successor, else the recorded `fallback`.
#[must_use]
pub fn anchored_position(node: &NodeId, fallback: usize, prior_siblings: &[NodeId], current: &[NodeId]) -> usize {
    let current: Vec<&NodeId> = current.iter().filter(|id| *id != node).collect();
    let index_of = |sibling: &NodeId| current.iter().position(|id| *id == sibling);

    let Some(own) = prior_siblings.iter().position(|id| id == node) else {
        return fallback.min(current.len());
    };
    prior_siblings[..own]
        .iter()
        .rev()
        .find_map(|sibling| index_of(sibling).map(|i| i + 1))
        .or_else(|| prior_siblings[own + 1..].iter().find_map(|sibling| index_of(sibling)))
        .unwrap_or_else(|| fallback.min(current.len()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use docbatch_core::Version;

    fn entry(seq: u64, data: UndoData) -> UndoEntry {
        UndoEntry {
            seq,
            target_id: NodeId::new(format!("n{seq}")),
            prior_version: Version(1),
            overwritten_expectation: None,
            data,
            recorded_at: Utc::now(),
        }
    }

    fn moved(position: usize) -> UndoData {
        UndoData::Moved {
            prior_parent: Some(NodeId::new("f1")),
            prior_position: position,
            prior_siblings: vec![],
        }
    }

    #[test]
    fn replays_newest_first() {
        let entries = vec![entry(0, moved(0)), entry(1, moved(0)), entry(2, moved(3))];
        let plan = plan_compensations(&entries, &HashSet::new());
        let seqs: Vec<_> = plan.iter().map(|c| c.seq).collect();
        assert_eq!(seqs, vec![2, 1, 0]);
        assert_eq!(
            plan[0].action.mutation(),
            Mutation::Move {
                parent: Some(NodeId::new("f1")),
                position: Some(3)
            }
        );
    }

    #[test]
    fn skips_already_reversed() {
        let entries = vec![entry(0, moved(0)), entry(1, moved(1))];
        let plan = plan_compensations(&entries, &HashSet::from([1]));
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].seq, 0);
    }

    #[test]
    fn anchors_next_to_former_neighbours() {
        let ids = |raw: &[&str]| raw.iter().map(|id| NodeId::new(*id)).collect::<Vec<_>>();
        let node = NodeId::new("b");

        // predecessor present
        assert_eq!(anchored_position(&node, 0, &ids(&["a", "b", "c"]), &ids(&["x", "a", "c"])), 2);
        // only the successor is back
        assert_eq!(anchored_position(&node, 0, &ids(&["b", "c"]), &ids(&["a", "c"])), 1);
        // neither: recorded index, clamped
        assert_eq!(anchored_position(&node, 5, &ids(&["a", "b"]), &ids(&["z"])), 1);
        // the node itself is ignored when reordering within its parent
        assert_eq!(anchored_position(&node, 0, &ids(&["a", "b"]), &ids(&["b", "a"])), 1);
    }

    #[test]
    fn copy_is_undone_on_the_clone() {
        let entries = vec![entry(
            0,
            UndoData::Copied {
                clone_id: NodeId::new("clone"),
            },
        )];
        let plan = plan_compensations(&entries, &HashSet::new());
        assert_eq!(plan[0].action.subject(), &NodeId::new("clone"));
        assert_eq!(plan[0].action.mutation(), Mutation::Purge);
    }
}
