// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The action and error streams every tree mutation writes to.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::check::Check;
use crate::error::TreeError;
use crate::instance::CheckInstance;
use crate::object::{ElementSnapshot, ObjectRef};
use crate::property::Property;

/// Default cap on buffered actions between two drains.
pub const DEFAULT_ACTION_CAP: usize = 4 * 1024 * 1024;

/// One observable change of the tree. Actions hold values, never references into the tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    /// Element created below a parent.
    Create {
        /// The new element.
        element: ElementSnapshot,
        /// Its parent.
        parent: ObjectRef,
    },
    /// Element removed from the tree.
    Delete {
        /// The removed element as it was.
        element: ElementSnapshot,
    },
    /// Element placement state changed.
    Update {
        /// The element after the change.
        element: ElementSnapshot,
    },
    /// Element renamed.
    Rename {
        /// The element after the rename.
        element: ElementSnapshot,
        /// Previous name.
        old_name: String,
    },
    /// Element became a member of a group or cluster.
    MemberNew {
        /// Group or cluster.
        parent: ObjectRef,
        /// New member.
        child: ObjectRef,
        /// Bucket both live in.
        bucket_id: Uuid,
    },
    /// Element left a group or cluster.
    MemberRemoved {
        /// Group or cluster.
        parent: ObjectRef,
        /// Former member.
        child: ObjectRef,
        /// Bucket both live in.
        bucket_id: Uuid,
    },
    /// Node assigned to a bucket.
    NodeAssignment {
        /// The node after assignment.
        element: ElementSnapshot,
        /// Bucket the node was assigned to.
        bucket_id: Uuid,
    },
    /// Element now hangs below `parent`.
    Attached {
        /// The element.
        element: ElementSnapshot,
        /// Its new parent.
        parent: ObjectRef,
    },
    /// Property attached to an element, locally or by inheritance.
    PropertyNew {
        /// Element.
        object: ObjectRef,
        /// The attachment.
        property: Property,
    },
    /// Property removed from an element.
    PropertyDelete {
        /// Element.
        object: ObjectRef,
        /// The attachment as it was.
        property: Property,
    },
    /// Property value changed at its source.
    PropertyUpdate {
        /// Element.
        object: ObjectRef,
        /// The attachment after the change.
        property: Property,
    },
    /// Check placed on an element.
    CheckNew {
        /// Element.
        object: ObjectRef,
        /// The check.
        check: Check,
    },
    /// Check removed from an element.
    CheckRemoved {
        /// Element.
        object: ObjectRef,
        /// The check as it was.
        check: Check,
    },
    /// New check instance.
    CheckInstanceCreate {
        /// The instance.
        instance: CheckInstance,
    },
    /// Check instance moved to a new version.
    CheckInstanceUpdate {
        /// The instance after the change.
        instance: CheckInstance,
    },
    /// Check instance no longer computed.
    CheckInstanceDelete {
        /// The instance as it was.
        instance: CheckInstance,
    },
}

impl Action {
    /// The action kind as logged.
    pub fn kind(&self) -> &'static str {
        match self {
            Action::Create { .. } => "create",
            Action::Delete { .. } => "delete",
            Action::Update { .. } => "update",
            Action::Rename { .. } => "rename",
            Action::MemberNew { .. } => "member_new",
            Action::MemberRemoved { .. } => "member_removed",
            Action::NodeAssignment { .. } => "node_assignment",
            Action::Attached { .. } => "attached",
            Action::PropertyNew { .. } => "property_new",
            Action::PropertyDelete { .. } => "property_delete",
            Action::PropertyUpdate { .. } => "property_update",
            Action::CheckNew { .. } => "check_new",
            Action::CheckRemoved { .. } => "check_removed",
            Action::CheckInstanceCreate { .. } => "check_instance_create",
            Action::CheckInstanceUpdate { .. } => "check_instance_update",
            Action::CheckInstanceDelete { .. } => "check_instance_delete",
        }
    }

    /// Whether the action concerns checks or check instances.
    pub fn is_check_action(&self) -> bool {
        matches!(
            self,
            Action::CheckNew { .. }
                | Action::CheckRemoved { .. }
                | Action::CheckInstanceCreate { .. }
                | Action::CheckInstanceUpdate { .. }
                | Action::CheckInstanceDelete { .. }
        )
    }

    /// Whether the action concerns check instances.
    pub fn is_instance_action(&self) -> bool {
        matches!(
            self,
            Action::CheckInstanceCreate { .. }
                | Action::CheckInstanceUpdate { .. }
                | Action::CheckInstanceDelete { .. }
        )
    }
}

/// Buffered action and error streams with an explicit action cap.
#[derive(Debug)]
pub(crate) struct Sink {
    actions: VecDeque<Action>,
    errors: Vec<TreeError>,
    cap: usize,
    overflowed: bool,
}

impl Sink {
    pub(crate) fn new(cap: usize) -> Self {
        Self {
            actions: VecDeque::new(),
            errors: Vec::new(),
            cap,
            overflowed: false,
        }
    }

    pub(crate) fn action(&mut self, action: Action) {
        if self.actions.len() >= self.cap {
            if !self.overflowed {
                self.overflowed = true;
                self.errors.push(TreeError::ActionOverflow(self.cap));
            }
            return;
        }
        self.actions.push_back(action);
    }

    pub(crate) fn error(&mut self, error: TreeError) {
        tracing::debug!(error = %error, "tree error recorded");
        self.errors.push(error);
    }

    pub(crate) fn drain_actions(&mut self) -> Vec<Action> {
        self.overflowed = false;
        self.actions.drain(..).collect()
    }

    pub(crate) fn drain_errors(&mut self) -> Vec<TreeError> {
        std::mem::take(&mut self.errors)
    }

    pub(crate) fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub(crate) fn clear(&mut self) {
        self.actions.clear();
        self.errors.clear();
        self.overflowed = false;
    }
}
