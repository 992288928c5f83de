//! Core types for batch document operations
//!
//! Defines the fundamental vocabulary shared by the engine and its
//! collaborators:
//! - Identifiers (batches, nodes, projects, users) and version tags
//! - Document tree nodes as seen through the repository port
//! - Operation kinds, conflict policies and typed payloads
//! - The inbound submission request

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use ulid::Ulid;

use crate::config::RetryPolicy;

/// Unique batch identifier (ULID for sortability)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(pub Ulid);

impl BatchId {
    /// Generate new batch ID
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for BatchId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for BatchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            /// Create from anything string-like
            #[inline]
            #[must_use]
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Borrow the raw identifier
            #[inline]
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(
    /// Document tree node identifier, assigned by the document repository
    NodeId
);
string_id!(
    /// Owning project identifier
    ProjectId
);
string_id!(
    /// Caller identity as resolved by the authentication layer
    UserId
);

/// Optimistic concurrency tag of a document node
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Version(pub u64);

impl Version {
    /// The version that follows this one
    #[inline]
    #[must_use]
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Kind of tree node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    /// Container node (volume, part, folder)
    Folder,
    /// Leaf document (chapter, note)
    Document,
}

impl NodeKind {
    /// Whether this node can contain children
    #[inline]
    #[must_use]
    pub fn is_container(self) -> bool {
        matches!(self, Self::Folder)
    }
}

/// Snapshot of one document tree node
///
/// `position` is the 0-based index among the parent's live children at the
/// time the snapshot was read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentNode {
    pub id: NodeId,
    pub project_id: ProjectId,
    pub parent_id: Option<NodeId>,
    pub kind: NodeKind,
    pub title: String,
    #[serde(default)]
    pub content: String,
    pub version: Version,
    pub position: usize,
}

/// Batch operation kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    Delete,
    Move,
    Copy,
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Delete => "delete",
            Self::Move => "move",
            Self::Copy => "copy",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for OperationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "delete" => Ok(Self::Delete),
            "move" => Ok(Self::Move),
            "copy" => Ok(Self::Copy),
            other => Err(format!("unknown operation type: {other}")),
        }
    }
}

/// Caller-selected rule for version/lock conflicts found during execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConflictPolicy {
    /// Abort the remaining batch on the first conflict
    #[default]
    FailFast,
    /// Record conflicted items as skipped and continue (non-atomic only)
    SkipConflicts,
    /// Ignore version mismatches; editing locks are still honored
    ForceOverwrite,
}

impl std::str::FromStr for ConflictPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace(['-', '_'], "").as_str() {
            "failfast" => Ok(Self::FailFast),
            "skipconflicts" | "skip" => Ok(Self::SkipConflicts),
            "forceoverwrite" | "force" => Ok(Self::ForceOverwrite),
            other => Err(format!("unknown conflict policy: {other}")),
        }
    }
}

/// Destination parent for Move/Copy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind", content = "id")]
pub enum ParentRef {
    /// Keep the node's current parent
    Unchanged,
    /// Project root
    Root,
    /// A specific folder
    Node(NodeId),
}

/// Where a moved or copied root lands
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Placement {
    pub parent: ParentRef,
    /// 0-based sibling index; `None` appends
    pub position: Option<usize>,
}

impl Placement {
    /// Position for the `ordinal`-th root placed by one batch
    ///
    /// Roots sharing a requested position are inserted consecutively.
    #[inline]
    #[must_use]
    pub fn position_for(&self, ordinal: usize) -> Option<usize> {
        self.position.map(|p| p + ordinal)
    }

    /// Explicit destination folder, if any
    #[inline]
    #[must_use]
    pub fn destination(&self) -> Option<&NodeId> {
        match &self.parent {
            ParentRef::Node(id) => Some(id),
            ParentRef::Unchanged | ParentRef::Root => None,
        }
    }
}

/// Typed operation parsed once from the submission payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum Operation {
    Delete,
    Move { placement: Placement },
    Copy { placement: Placement },
}

impl Operation {
    /// Parse the JSON payload for the given operation type
    ///
    /// # Errors
    /// Returns a human-readable message if the payload shape does not match
    /// the operation type.
    pub fn from_payload(op_type: OperationType, payload: &Map<String, Value>) -> Result<Self, String> {
        match op_type {
            OperationType::Delete => {
                if let Some(key) = payload.keys().next() {
                    return Err(format!("delete takes no payload, found key `{key}`"));
                }
                Ok(Self::Delete)
            }
            OperationType::Move => {
                let placement = parse_placement(payload)?;
                if placement.parent == ParentRef::Unchanged && placement.position.is_none() {
                    return Err("move payload requires `newParentId` or `position`".to_string());
                }
                Ok(Self::Move { placement })
            }
            OperationType::Copy => Ok(Self::Copy {
                placement: parse_placement(payload)?,
            }),
        }
    }

    /// Operation kind of this payload
    #[inline]
    #[must_use]
    pub fn op_type(&self) -> OperationType {
        match self {
            Self::Delete => OperationType::Delete,
            Self::Move { .. } => OperationType::Move,
            Self::Copy { .. } => OperationType::Copy,
        }
    }

    /// Placement for Move/Copy
    #[inline]
    #[must_use]
    pub fn placement(&self) -> Option<&Placement> {
        match self {
            Self::Delete => None,
            Self::Move { placement } | Self::Copy { placement } => Some(placement),
        }
    }
}

fn parse_placement(payload: &Map<String, Value>) -> Result<Placement, String> {
    for key in payload.keys() {
        if key != "newParentId" && key != "position" {
            return Err(format!("unknown payload key `{key}`"));
        }
    }

    let parent = match payload.get("newParentId") {
        None => ParentRef::Unchanged,
        Some(Value::Null) => ParentRef::Root,
        Some(Value::String(id)) if !id.is_empty() => ParentRef::Node(NodeId::new(id.clone())),
        Some(other) => return Err(format!("`newParentId` must be a non-empty string or null, got {other}")),
    };

    let position = match payload.get("position") {
        None | Some(Value::Null) => None,
        Some(Value::Number(n)) => {
            let raw = n
                .as_u64()
                .ok_or_else(|| format!("`position` must be a non-negative integer, got {n}"))?;
            Some(usize::try_from(raw).map_err(|_| format!("`position` out of range: {raw}"))?)
        }
        Some(other) => return Err(format!("`position` must be an integer, got {other}")),
    };

    Ok(Placement { parent, position })
}

/// Inbound submission contract
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRequest {
    pub project_id: ProjectId,
    #[serde(rename = "type")]
    pub op_type: OperationType,
    pub target_ids: Vec<NodeId>,
    #[serde(default)]
    pub atomic: bool,
    #[serde(default)]
    pub payload: Map<String, Value>,
    #[serde(default)]
    pub conflict_policy: ConflictPolicy,
    #[serde(default)]
    pub expected_versions: HashMap<NodeId, Version>,
    #[serde(default)]
    pub client_request_id: Option<String>,
    #[serde(default)]
    pub include_descendants: bool,
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
}

impl SubmitRequest {
    /// Create a request with defaults (non-atomic, fail-fast, no payload)
    #[must_use]
    pub fn new(project_id: impl Into<ProjectId>, op_type: OperationType, target_ids: Vec<NodeId>) -> Self {
        Self {
            project_id: project_id.into(),
            op_type,
            target_ids,
            atomic: false,
            payload: Map::new(),
            conflict_policy: ConflictPolicy::default(),
            expected_versions: HashMap::new(),
            client_request_id: None,
            include_descendants: false,
            retry: None,
        }
    }

    /// With atomic mode
    #[inline]
    #[must_use]
    pub fn with_atomic(mut self, atomic: bool) -> Self {
        self.atomic = atomic;
        self
    }

    /// With conflict policy
    #[inline]
    #[must_use]
    pub fn with_policy(mut self, policy: ConflictPolicy) -> Self {
        self.conflict_policy = policy;
        self
    }

    /// With one payload entry
    #[inline]
    #[must_use]
    pub fn with_payload(mut self, key: &str, value: Value) -> Self {
        self.payload.insert(key.to_string(), value);
        self
    }

    /// With an expected version for one target
    #[inline]
    #[must_use]
    pub fn expect_version(mut self, id: impl Into<NodeId>, version: Version) -> Self {
        self.expected_versions.insert(id.into(), version);
        self
    }

    /// With idempotency key
    #[inline]
    #[must_use]
    pub fn with_client_request_id(mut self, key: impl Into<String>) -> Self {
        self.client_request_id = Some(key.into());
        self
    }

    /// With descendant expansion
    #[inline]
    #[must_use]
    pub fn with_descendants(mut self, include: bool) -> Self {
        self.include_descendants = include;
        self
    }

    /// With per-batch retry override
    #[inline]
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }
}
