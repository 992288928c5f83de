//! In-memory document tree
//!
//! Sibling order is the order of each parent's child list; a node's
//! `position` is derived from it on every read. Soft-deleted nodes leave
//! their parent's list but keep their record (and their own child list) so
//! they can be restored in place.
//!
//! Test hooks: per-mutation latency, scripted transient failures, concurrent
//! edit simulation and a callback after every applied mutation.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use docbatch_core::{DocumentNode, NodeId, NodeKind, ProjectId, RepositoryError, Version};

use crate::collaborators::{DocumentRepository, Mutation, MutationOutcome};

type MutationHook = Arc<dyn Fn(usize) + Send + Sync>;
type ListKey = (ProjectId, Option<NodeId>);

#[derive(Debug, Clone)]
struct Stored {
    node: DocumentNode,
    deleted: bool,
}

#[derive(Debug, Default)]
struct Tree {
    nodes: HashMap<NodeId, Stored>,
    children: HashMap<ListKey, Vec<NodeId>>,
    clones: u64,
}

impl Tree {
    fn position(&self, node: &DocumentNode) -> usize {
        self.children
            .get(&(node.project_id.clone(), node.parent_id.clone()))
            .and_then(|list| list.iter().position(|id| id == &node.id))
            .unwrap_or(0)
    }

    fn snapshot(&self, stored: &Stored) -> DocumentNode {
        DocumentNode {
            position: self.position(&stored.node),
            ..stored.node.clone()
        }
    }

    fn live(&self, id: &NodeId) -> Result<&Stored, RepositoryError> {
        self.nodes
            .get(id)
            .filter(|stored| !stored.deleted)
            .ok_or_else(|| RepositoryError::NotFound(id.clone()))
    }

    fn stored_mut(&mut self, id: &NodeId) -> Result<&mut Stored, RepositoryError> {
        self.nodes
            .get_mut(id)
            .ok_or_else(|| RepositoryError::NotFound(id.clone()))
    }

    fn detach(&mut self, id: &NodeId) -> Result<(), RepositoryError> {
        let node = &self.stored_mut(id)?.node;
        let key = (node.project_id.clone(), node.parent_id.clone());
        if let Some(list) = self.children.get_mut(&key) {
            list.retain(|child| child != id);
        }
        Ok(())
    }

    fn attach(&mut self, id: &NodeId, parent: Option<NodeId>, position: Option<usize>) -> Result<(), RepositoryError> {
        let stored = self.stored_mut(id)?;
        stored.node.parent_id.clone_from(&parent);
        let key = (stored.node.project_id.clone(), parent);
        let list = self.children.entry(key).or_default();
        match position {
            Some(position) => list.insert(position.min(list.len()), id.clone()),
            None => list.push(id.clone()),
        }
        Ok(())
    }

    fn bump(&mut self, id: &NodeId) -> Result<Version, RepositoryError> {
        let stored = self.stored_mut(id)?;
        stored.node.version = stored.node.version.next();
        Ok(stored.node.version)
    }

    /// Destination must be a live folder of the same project that is not
    /// `moving` itself or one of its descendants
    fn check_destination(
        &self,
        project_id: &ProjectId,
        parent: Option<&NodeId>,
        moving: Option<&NodeId>,
    ) -> Result<(), RepositoryError> {
        let Some(parent) = parent else {
            return Ok(());
        };
        let folder = self
            .live(parent)
            .map_err(|_| RepositoryError::Rejected(format!("destination {parent} does not exist")))?;
        if &folder.node.project_id != project_id || !folder.node.kind.is_container() {
            return Err(RepositoryError::Rejected(format!("{parent} is not a folder of {project_id}")));
        }

        let mut cursor = Some(parent.clone());
        while let Some(current) = cursor {
            if Some(&current) == moving {
                return Err(RepositoryError::Rejected(format!("{parent} lies inside the moved node")));
            }
            cursor = self.nodes.get(&current).and_then(|s| s.node.parent_id.clone());
        }
        Ok(())
    }

    fn apply(&mut self, id: &NodeId, mutation: Mutation) -> Result<MutationOutcome, RepositoryError> {
        match mutation {
            Mutation::SoftDelete => {
                self.live(id)?;
                self.detach(id)?;
                self.stored_mut(id)?.deleted = true;
                Ok(changed(self.bump(id)?))
            }
            Mutation::Restore(record) => {
                let stored = self.stored_mut(id)?;
                if !stored.deleted {
                    return Err(RepositoryError::Rejected(format!("{id} is not deleted")));
                }
                let version = stored.node.version.next();
                stored.node = DocumentNode {
                    version,
                    parent_id: None,
                    ..record.clone()
                };
                stored.deleted = false;
                self.attach(id, record.parent_id, Some(record.position))?;
                Ok(changed(version))
            }
            Mutation::Move { parent, position } => {
                let project_id = self.live(id)?.node.project_id.clone();
                self.check_destination(&project_id, parent.as_ref(), Some(id))?;
                self.detach(id)?;
                self.attach(id, parent, position)?;
                Ok(changed(self.bump(id)?))
            }
            Mutation::Clone { parent, position } => {
                let source = self.live(id)?.node.clone();
                self.check_destination(&source.project_id, parent.as_ref(), None)?;
                self.clones += 1;
                let clone_id = NodeId::new(format!("{id}-copy{}", self.clones));
                self.nodes.insert(
                    clone_id.clone(),
                    Stored {
                        node: DocumentNode {
                            id: clone_id.clone(),
                            version: Version(1),
                            ..source
                        },
                        deleted: false,
                    },
                );
                self.attach(&clone_id, parent, position)?;
                Ok(MutationOutcome {
                    version: Version(1),
                    created: Some(clone_id),
                })
            }
            Mutation::Purge => {
                let project_id = self.live(id)?.node.project_id.clone();
                let has_children = self
                    .children
                    .get(&(project_id, Some(id.clone())))
                    .is_some_and(|list| !list.is_empty());
                if has_children {
                    return Err(RepositoryError::Rejected(format!("{id} still has children")));
                }
                let version = self.live(id)?.node.version.next();
                self.detach(id)?;
                self.nodes.remove(id);
                Ok(changed(version))
            }
        }
    }

    fn preorder(&self, project_id: &ProjectId, parent: Option<&NodeId>, out: &mut Vec<DocumentNode>) {
        let Some(list) = self.children.get(&(project_id.clone(), parent.cloned())) else {
            return;
        };
        for id in list {
            if let Some(stored) = self.nodes.get(id).filter(|s| !s.deleted) {
                out.push(self.snapshot(stored));
                self.preorder(project_id, Some(id), out);
            }
        }
    }
}

fn changed(version: Version) -> MutationOutcome {
    MutationOutcome { version, created: None }
}

/// IDs created by [`MemoryDocumentRepository::seed_project`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SeededTree {
    pub folders: Vec<NodeId>,
    pub documents: Vec<NodeId>,
}

/// Reference `DocumentRepository`
#[derive(Default)]
pub struct MemoryDocumentRepository {
    tree: RwLock<Tree>,
    latency: Mutex<Duration>,
    transient: DashMap<NodeId, u32>,
    mutations: AtomicUsize,
    hooks: RwLock<Vec<MutationHook>>,
}

impl MemoryDocumentRepository {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a node under `parent` (or the project root)
    ///
    /// # Errors
    /// `Rejected` if the ID exists or the parent is not a live folder.
    pub fn insert(
        &self,
        project_id: &ProjectId,
        id: impl Into<NodeId>,
        parent: Option<&NodeId>,
        kind: NodeKind,
        title: impl Into<String>,
    ) -> Result<NodeId, RepositoryError> {
        let id = id.into();
        let mut tree = self.tree.write();
        if tree.nodes.contains_key(&id) {
            return Err(RepositoryError::Rejected(format!("{id} already exists")));
        }
        tree.check_destination(project_id, parent, None)?;
        tree.nodes.insert(
            id.clone(),
            Stored {
                node: DocumentNode {
                    id: id.clone(),
                    project_id: project_id.clone(),
                    parent_id: None,
                    kind,
                    title: title.into(),
                    content: String::new(),
                    version: Version(1),
                    position: 0,
                },
                deleted: false,
            },
        );
        tree.attach(&id, parent.cloned(), None)?;
        Ok(id)
    }

    /// Build `folders` root folders `f1..fN`, each holding documents `fI-d1..fI-dM`
    ///
    /// # Errors
    /// `Rejected` if any of the IDs already exist.
    pub fn seed_project(
        &self,
        project_id: &ProjectId,
        folders: usize,
        docs_per_folder: usize,
    ) -> Result<SeededTree, RepositoryError> {
        let mut seeded = SeededTree::default();
        for f in 1..=folders {
            let folder = self.insert(project_id, format!("f{f}"), None, NodeKind::Folder, format!("Folder {f}"))?;
            for d in 1..=docs_per_folder {
                let doc = self.insert(
                    project_id,
                    format!("f{f}-d{d}"),
                    Some(&folder),
                    NodeKind::Document,
                    format!("Chapter {f}.{d}"),
                )?;
                seeded.documents.push(doc);
            }
            seeded.folders.push(folder);
        }
        Ok(seeded)
    }

    /// Live nodes of a project in pre-order
    #[must_use]
    pub fn snapshot(&self, project_id: &ProjectId) -> Vec<DocumentNode> {
        let tree = self.tree.read();
        let mut out = Vec::new();
        tree.preorder(project_id, None, &mut out);
        out
    }

    /// Whether the node exists in soft-deleted state
    #[must_use]
    pub fn is_deleted(&self, id: &NodeId) -> bool {
        self.tree.read().nodes.get(id).is_some_and(|s| s.deleted)
    }

    /// Simulate a concurrent edit: bump the version of a live node
    ///
    /// # Errors
    /// `NotFound` if the node is absent or deleted.
    pub fn touch(&self, id: &NodeId) -> Result<Version, RepositoryError> {
        let mut tree = self.tree.write();
        tree.live(id)?;
        tree.bump(id)
    }

    /// Delay applied before every mutation
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    /// Fail the next `times` mutations of `id` with a transient error
    pub fn fail_transiently(&self, id: &NodeId, times: u32) {
        self.transient.insert(id.clone(), times);
    }

    /// Call `hook` with the running count after every applied mutation
    pub fn on_mutation(&self, hook: impl Fn(usize) + Send + Sync + 'static) {
        self.hooks.write().push(Arc::new(hook));
    }

    /// Mutations applied so far
    #[must_use]
    pub fn mutation_count(&self) -> usize {
        self.mutations.load(Ordering::SeqCst)
    }

    fn take_transient_failure(&self, id: &NodeId) -> bool {
        match self.transient.get_mut(id) {
            Some(mut remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }
}

impl std::fmt::Debug for MemoryDocumentRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryDocumentRepository")
            .field("nodes", &self.tree.read().nodes.len())
            .field("mutations", &self.mutation_count())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl DocumentRepository for MemoryDocumentRepository {
    async fn read(&self, id: &NodeId) -> Result<Option<DocumentNode>, RepositoryError> {
        let tree = self.tree.read();
        Ok(tree
            .nodes
            .get(id)
            .filter(|stored| !stored.deleted)
            .map(|stored| tree.snapshot(stored)))
    }

    async fn children(&self, project_id: &ProjectId, parent: Option<&NodeId>) -> Result<Vec<NodeId>, RepositoryError> {
        let tree = self.tree.read();
        Ok(tree
            .children
            .get(&(project_id.clone(), parent.cloned()))
            .cloned()
            .unwrap_or_default())
    }

    async fn version(&self, id: &NodeId) -> Result<Option<Version>, RepositoryError> {
        Ok(self.tree.read().live(id).ok().map(|stored| stored.node.version))
    }

    async fn mutate(&self, id: &NodeId, mutation: Mutation) -> Result<MutationOutcome, RepositoryError> {
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if self.take_transient_failure(id) {
            return Err(RepositoryError::Transient(format!("{id}: storage busy")));
        }

        let outcome = self.tree.write().apply(id, mutation)?;
        let count = self.mutations.fetch_add(1, Ordering::SeqCst) + 1;
        let hooks: Vec<MutationHook> = self.hooks.read().clone();
        for hook in hooks {
            hook(count);
        }
        Ok(outcome)
    }
}
