// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Check placement and removal.

use uuid::Uuid;

use super::Tree;
use crate::check::{Check, CheckSpec};
use crate::error::TreeError;
use crate::object::ObjectRef;

impl Tree {
    /// Place a check configuration on `target` and on every descendant it inherits to.
    ///
    /// Instances are produced by the next [`Tree::compute_check_instances`].
    pub fn set_check(&mut self, target: ObjectRef, spec: CheckSpec) {
        let Some(id) = self.resolve(target) else {
            return;
        };
        let check = Check::source(&spec, id, target.kind);
        if self
            .arena
            .elements
            .get(&id)
            .is_some_and(|e| e.checks.contains_key(&check.check_id))
        {
            self.sink.error(TreeError::DuplicateCheck {
                config_id: spec.config_id,
                object: target,
            });
            return;
        }
        let before = self.capture(&self.subtree(id));
        if let Some(element) = self.arena.elements.get_mut(&id) {
            element.checks.insert(check.check_id, check);
        }
        self.reinherit(id);
        self.emit_attachment_diff(before);
    }

    /// Remove the check of configuration `config_id` placed on `target`, with its copies.
    pub fn delete_check(&mut self, target: ObjectRef, config_id: Uuid) {
        let Some(id) = self.resolve(target) else {
            return;
        };
        let check_id = Check::source_id(config_id, id);
        let present = self
            .arena
            .elements
            .get(&id)
            .and_then(|e| e.checks.get(&check_id))
            .is_some_and(Check::is_source);
        if !present {
            self.sink.error(TreeError::CheckNotFound {
                config_id,
                object: target,
            });
            return;
        }
        let before = self.capture(&self.subtree(id));
        if let Some(element) = self.arena.elements.get_mut(&id) {
            element.checks.remove(&check_id);
        }
        self.reinherit(id);
        self.emit_attachment_diff(before);
    }
}
