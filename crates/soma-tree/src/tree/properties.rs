// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Property attachment and inheritance.

use uuid::Uuid;

use super::Tree;
use crate::error::TreeError;
use crate::object::ObjectRef;
use crate::property::{Property, PropertySpec};

impl Tree {
    /// Attach a property to `target` and propagate it to descendants.
    pub fn set_property(&mut self, target: ObjectRef, spec: PropertySpec) {
        let Some(id) = self.resolve(target) else {
            return;
        };
        let mut value = spec.value;
        value.canonicalize();
        let identity = value.identity();
        let duplicate = self.arena.elements.get(&id).is_some_and(|e| {
            e.properties.values().any(|p| {
                p.is_source()
                    && (p.instance_id == spec.source_instance_id
                        || (p.view == spec.view && p.value.identity() == identity))
            })
        });
        if duplicate {
            self.sink.error(TreeError::DuplicateProperty {
                identity,
                view: spec.view,
                object: target,
            });
            return;
        }

        let before = self.capture(&self.subtree(id));
        if let Some(element) = self.arena.elements.get_mut(&id) {
            element.properties.insert(
                spec.source_instance_id,
                Property {
                    instance_id: spec.source_instance_id,
                    source_instance_id: spec.source_instance_id,
                    inherited_from: None,
                    view: spec.view,
                    inheritance: spec.inheritance,
                    children_only: spec.children_only,
                    value,
                },
            );
        }
        self.reinherit(id);
        self.emit_attachment_diff(before);
    }

    /// Remove a locally set property and every inherited copy of it.
    pub fn delete_property(&mut self, target: ObjectRef, source_instance_id: Uuid) {
        let Some(id) = self.resolve(target) else {
            return;
        };
        if !self.has_source_property(id, source_instance_id) {
            self.sink.error(TreeError::PropertyNotFound {
                instance_id: source_instance_id,
                object: target,
            });
            return;
        }
        let before = self.capture(&self.subtree(id));
        if let Some(element) = self.arena.elements.get_mut(&id) {
            element.properties.remove(&source_instance_id);
        }
        self.reinherit(id);
        self.emit_attachment_diff(before);
    }

    /// Replace the value of a locally set property; copies follow.
    ///
    /// Flags and view stay as they were set; only the payload changes.
    pub fn update_property(&mut self, target: ObjectRef, spec: PropertySpec) {
        let Some(id) = self.resolve(target) else {
            return;
        };
        if !self.has_source_property(id, spec.source_instance_id) {
            self.sink.error(TreeError::PropertyNotFound {
                instance_id: spec.source_instance_id,
                object: target,
            });
            return;
        }
        let mut value = spec.value;
        value.canonicalize();
        let before = self.capture(&self.subtree(id));
        if let Some(property) = self
            .arena
            .elements
            .get_mut(&id)
            .and_then(|e| e.properties.get_mut(&spec.source_instance_id))
        {
            property.value = value;
        }
        self.reinherit(id);
        self.emit_attachment_diff(before);
    }

    fn has_source_property(&self, id: Uuid, source_instance_id: Uuid) -> bool {
        self.arena.elements.get(&id).is_some_and(|e| {
            e.properties
                .get(&source_instance_id)
                .is_some_and(Property::is_source)
        })
    }
}
