// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Errors recorded on the tree's error stream.

use thiserror::Error;
use uuid::Uuid;

use crate::object::{ObjectKind, ObjectRef};

/// A failed tree mutation.
///
/// The tree never aborts a mutation by returning early from its public
/// operations; it records the error and the owner drains the stream after the job.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum TreeError {
    /// Referenced element does not exist.
    #[error("{0} not found")]
    NotFound(ObjectRef),

    /// Element kind cannot hang below the requested parent kind.
    #[error("{child} cannot be placed below {parent}")]
    InvalidParent {
        /// Kind of the element being placed.
        child: ObjectKind,
        /// Kind of the requested parent.
        parent: ObjectKind,
    },

    /// Element id is already present in the tree.
    #[error("{0} already exists")]
    Duplicate(ObjectRef),

    /// Bucket name lacks the repository prefix.
    #[error("bucket name '{name}' must start with '{prefix}'")]
    BucketPrefix {
        /// Requested bucket name.
        name: String,
        /// Required prefix.
        prefix: String,
    },

    /// Membership across bucket boundaries.
    #[error("{child} and {parent} live in different buckets")]
    CrossBucket {
        /// Member element.
        child: ObjectRef,
        /// Container element.
        parent: ObjectRef,
    },

    /// Group membership would form a cycle.
    #[error("placing {child} below {parent} creates a cycle")]
    Cycle {
        /// Member element.
        child: ObjectRef,
        /// Container element.
        parent: ObjectRef,
    },

    /// Membership change requires a standalone element.
    #[error("{0} is not standalone")]
    NotStandalone(ObjectRef),

    /// Element is not a member of any group or cluster.
    #[error("{0} is not a member")]
    NotMember(ObjectRef),

    /// Mutation addressed to the fault placeholder.
    #[error("mutation addressed to fault placeholder")]
    Fault,

    /// No source property with this instance id on the element.
    #[error("property {instance_id} not found on {object}")]
    PropertyNotFound {
        /// Source instance id.
        instance_id: Uuid,
        /// Element.
        object: ObjectRef,
    },

    /// A local property of this identity and view is already set.
    #[error("property {identity} already set on {object} in view {view}")]
    DuplicateProperty {
        /// Property identity, e.g. `system:retention_days`.
        identity: String,
        /// View.
        view: String,
        /// Element.
        object: ObjectRef,
    },

    /// No source check for this configuration on the element.
    #[error("check configuration {config_id} not found on {object}")]
    CheckNotFound {
        /// Check configuration id.
        config_id: Uuid,
        /// Element.
        object: ObjectRef,
    },

    /// Check configuration already placed on the element.
    #[error("check configuration {config_id} already set on {object}")]
    DuplicateCheck {
        /// Check configuration id.
        config_id: Uuid,
        /// Element.
        object: ObjectRef,
    },

    /// Two checks computed the same instance identity.
    #[error("check instance {instance_id} computed twice on {object}")]
    DuplicateInstance {
        /// Instance id.
        instance_id: Uuid,
        /// Element.
        object: ObjectRef,
    },

    /// The action buffer cap was exceeded.
    #[error("action buffer overflow: more than {0} actions")]
    ActionOverflow(usize),

    /// A loaded check instance diverges from the recomputed state.
    #[error("check instance {instance_id} on {object} diverges from stored state ({reason})")]
    LoadMismatch {
        /// Instance id.
        instance_id: Uuid,
        /// Element.
        object: ObjectRef,
        /// `missing`, `unexpected` or `changed`.
        reason: &'static str,
    },
}
