//! Forward mutation per operation variant
//!
//! Selected once when a run starts. Each variant knows how to turn a live
//! node into a repository mutation and how to capture what undo needs.

use docbatch_core::{DocumentNode, NodeId, Operation, ParentRef, Placement, RepositoryError, UndoData};

use crate::collaborators::{DocumentRepository, Mutation, MutationOutcome};

/// Where a node is placed by this item
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Slot {
    /// Independent root; `ordinal` counts roots already placed by the run
    Root { ordinal: usize },
    /// Descendant cloned under its parent's clone
    UnderClone(NodeId),
}

#[derive(Debug, Clone)]
pub(crate) enum ItemMutator {
    Delete,
    Move(Placement),
    Copy(Placement),
}

/// Mutation plus the state captured before it runs
#[derive(Debug, Clone)]
pub(crate) struct Prepared {
    pub(crate) mutation: Mutation,
    capture: Capture,
}

#[derive(Debug, Clone)]
enum Capture {
    Deleted(DocumentNode),
    Moved {
        prior_parent: Option<NodeId>,
        prior_position: usize,
        prior_siblings: Vec<NodeId>,
    },
    Copied,
}

impl ItemMutator {
    pub(crate) fn for_operation(operation: &Operation) -> Self {
        match operation {
            Operation::Delete => Self::Delete,
            Operation::Move { placement } => Self::Move(placement.clone()),
            Operation::Copy { placement } => Self::Copy(placement.clone()),
        }
    }

    /// Descendants of a target follow it instead of being placed on their own
    pub(crate) fn follows_parent(&self) -> bool {
        matches!(self, Self::Move(_) | Self::Copy(_))
    }

    /// Moving a node moves its whole subtree
    pub(crate) fn carries_subtree(&self) -> bool {
        matches!(self, Self::Move(_))
    }

    /// Items touch disjoint nodes and never depend on each other
    pub(crate) fn is_order_independent(&self) -> bool {
        matches!(self, Self::Delete)
    }

    pub(crate) fn verb(&self) -> &'static str {
        match self {
            Self::Delete => "deleted",
            Self::Move(_) => "moved",
            Self::Copy(_) => "copied",
        }
    }

    /// Build the mutation for `node` and capture its undo state
    pub(crate) async fn prepare(
        &self,
        repository: &dyn DocumentRepository,
        node: &DocumentNode,
        slot: &Slot,
    ) -> Result<Prepared, RepositoryError> {
        match self {
            Self::Delete => Ok(Prepared {
                mutation: Mutation::SoftDelete,
                capture: Capture::Deleted(node.clone()),
            }),
            Self::Move(placement) => {
                let prior_siblings = repository
                    .children(&node.project_id, node.parent_id.as_ref())
                    .await?;
                let ordinal = match slot {
                    Slot::Root { ordinal } => *ordinal,
                    Slot::UnderClone(_) => 0,
                };
                Ok(Prepared {
                    mutation: Mutation::Move {
                        parent: resolve_parent(&placement.parent, node),
                        position: placement.position_for(ordinal),
                    },
                    capture: Capture::Moved {
                        prior_parent: node.parent_id.clone(),
                        prior_position: node.position,
                        prior_siblings,
                    },
                })
            }
            Self::Copy(placement) => {
                let (parent, position) = match slot {
                    Slot::UnderClone(clone_parent) => (Some(clone_parent.clone()), None),
                    Slot::Root { ordinal } => {
                        let position = match (&placement.parent, placement.position_for(*ordinal)) {
                            (_, Some(position)) => Some(position),
                            // Without a destination the clone lands right after its source
                            (ParentRef::Unchanged, None) => Some(node.position + 1),
                            (_, None) => None,
                        };
                        (resolve_parent(&placement.parent, node), position)
                    }
                };
                Ok(Prepared {
                    mutation: Mutation::Clone { parent, position },
                    capture: Capture::Copied,
                })
            }
        }
    }
}

impl Prepared {
    /// Undo data for the applied mutation
    pub(crate) fn into_undo(self, outcome: &MutationOutcome) -> Result<UndoData, RepositoryError> {
        match self.capture {
            Capture::Deleted(record) => Ok(UndoData::Deleted { record }),
            Capture::Moved {
                prior_parent,
                prior_position,
                prior_siblings,
            } => Ok(UndoData::Moved {
                prior_parent,
                prior_position,
                prior_siblings,
            }),
            Capture::Copied => outcome
                .created
                .clone()
                .map(|clone_id| UndoData::Copied { clone_id })
                .ok_or_else(|| RepositoryError::Other("clone did not report the created node".to_string())),
        }
    }
}

fn resolve_parent(parent: &ParentRef, node: &DocumentNode) -> Option<NodeId> {
    match parent {
        ParentRef::Unchanged => node.parent_id.clone(),
        ParentRef::Root => None,
        ParentRef::Node(id) => Some(id.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docbatch_core::{NodeKind, ProjectId, Version};

    fn node(position: usize) -> DocumentNode {
        DocumentNode {
            id: NodeId::new("d"),
            project_id: ProjectId::new("p"),
            parent_id: Some(NodeId::new("f1")),
            kind: NodeKind::Document,
            title: "d".into(),
            content: String::new(),
            version: Version(1),
            position,
        }
    }

    #[test]
    fn parent_resolution() {
        let n = node(0);
        assert_eq!(resolve_parent(&ParentRef::Unchanged, &n), Some(NodeId::new("f1")));
        assert_eq!(resolve_parent(&ParentRef::Root, &n), None);
        assert_eq!(
            resolve_parent(&ParentRef::Node(NodeId::new("f2")), &n),
            Some(NodeId::new("f2"))
        );
    }

    #[test]
    fn copy_without_clone_id_is_an_error() {
        let prepared = Prepared {
            mutation: Mutation::Clone {
                parent: None,
                position: None,
            },
            capture: Capture::Copied,
        };
        let outcome = MutationOutcome {
            version: Version(1),
            created: None,
        };
        assert!(prepared.into_undo(&outcome).is_err());
    }
}
