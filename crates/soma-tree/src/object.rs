// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Element kinds, references and the data carried by each tree element.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The variant of a tree element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectKind {
    /// Synthetic root every repository hangs off.
    Root,
    /// Top-level configuration container.
    Repository,
    /// Environment-scoped slice of a repository.
    Bucket,
    /// Container of groups, clusters and nodes.
    Group,
    /// Container of nodes.
    Cluster,
    /// Leaf element, backed by a registered node.
    Node,
    /// Placeholder returned for absent objects.
    Fault,
}

impl ObjectKind {
    /// Get the kind as its wire/database string.
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::Root => "root",
            ObjectKind::Repository => "repository",
            ObjectKind::Bucket => "bucket",
            ObjectKind::Group => "group",
            ObjectKind::Cluster => "cluster",
            ObjectKind::Node => "node",
            ObjectKind::Fault => "fault",
        }
    }

    /// Whether check instances are computed for elements of this kind.
    pub fn carries_instances(&self) -> bool {
        matches!(
            self,
            ObjectKind::Group | ObjectKind::Cluster | ObjectKind::Node
        )
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ObjectKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "root" => Ok(ObjectKind::Root),
            "repository" => Ok(ObjectKind::Repository),
            "bucket" => Ok(ObjectKind::Bucket),
            "group" => Ok(ObjectKind::Group),
            "cluster" => Ok(ObjectKind::Cluster),
            "node" => Ok(ObjectKind::Node),
            "fault" => Ok(ObjectKind::Fault),
            other => Err(format!("unknown object kind '{}'", other)),
        }
    }
}

/// A typed reference to a tree element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectRef {
    /// Element kind.
    pub kind: ObjectKind,
    /// Element id.
    pub id: Uuid,
}

impl ObjectRef {
    /// Create a new reference.
    pub fn new(kind: ObjectKind, id: Uuid) -> Self {
        Self { kind, id }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.id)
    }
}

/// Placement state of groups, clusters and nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ObjectState {
    /// Directly below a bucket.
    #[default]
    Standalone,
    /// Member of a group.
    Grouped,
    /// Member of a cluster.
    Clustered,
    /// Not part of any bucket.
    Unassigned,
}

impl ObjectState {
    /// Get the state as its database string.
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectState::Standalone => "standalone",
            ObjectState::Grouped => "grouped",
            ObjectState::Clustered => "clustered",
            ObjectState::Unassigned => "unassigned",
        }
    }
}

impl FromStr for ObjectState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "standalone" => Ok(ObjectState::Standalone),
            "grouped" => Ok(ObjectState::Grouped),
            "clustered" => Ok(ObjectState::Clustered),
            "unassigned" => Ok(ObjectState::Unassigned),
            other => Err(format!("unknown object state '{}'", other)),
        }
    }
}

/// Kind-specific element attributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ElementDetail {
    /// The synthetic root.
    Root,
    /// Repository attributes.
    Repository {
        /// Whether the repository accepts work.
        active: bool,
    },
    /// Bucket attributes.
    Bucket {
        /// Environment this bucket belongs to (`prod`, `qa`, ...).
        environment: String,
        /// Frozen buckets reject structural changes upstream.
        frozen: bool,
    },
    /// Groups carry no extra attributes.
    Group,
    /// Clusters carry no extra attributes.
    Cluster,
    /// Node attributes copied from the node registry.
    Node {
        /// Asset id in the inventory.
        asset_id: u64,
        /// Server the node runs on.
        server_id: Uuid,
        /// Whether the node is online.
        online: bool,
    },
    /// Placeholder for absent objects.
    Fault,
}

impl ElementDetail {
    /// The kind this detail belongs to.
    pub fn kind(&self) -> ObjectKind {
        match self {
            ElementDetail::Root => ObjectKind::Root,
            ElementDetail::Repository { .. } => ObjectKind::Repository,
            ElementDetail::Bucket { .. } => ObjectKind::Bucket,
            ElementDetail::Group => ObjectKind::Group,
            ElementDetail::Cluster => ObjectKind::Cluster,
            ElementDetail::Node { .. } => ObjectKind::Node,
            ElementDetail::Fault => ObjectKind::Fault,
        }
    }
}

/// Specification of an element to attach to the tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewElement {
    /// Element id.
    pub id: Uuid,
    /// Element name (node name for nodes).
    pub name: String,
    /// Owning team.
    pub team_id: Uuid,
    /// Kind-specific attributes; determines the element kind.
    pub detail: ElementDetail,
}

impl NewElement {
    /// The kind of the element to attach.
    pub fn kind(&self) -> ObjectKind {
        self.detail.kind()
    }
}

/// A value copy of an element's identity and attributes, carried by actions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementSnapshot {
    /// Element id.
    pub id: Uuid,
    /// Element kind.
    pub kind: ObjectKind,
    /// Element name.
    pub name: String,
    /// Owning team.
    pub team_id: Uuid,
    /// Placement state.
    pub state: ObjectState,
    /// Bucket the element lives in, if any.
    pub bucket_id: Option<Uuid>,
    /// Repository the element lives in, if any.
    pub repository_id: Option<Uuid>,
    /// Kind-specific attributes.
    pub detail: ElementDetail,
}

impl ElementSnapshot {
    /// Reference to the snapshotted element.
    pub fn object_ref(&self) -> ObjectRef {
        ObjectRef::new(self.kind, self.id)
    }
}
