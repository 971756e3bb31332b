// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The repository tree: an arena of typed elements keyed by id.
//!
//! Parent links live in a separate map, children are kept ordered so every
//! traversal, and therefore every action stream, is deterministic.

mod checks;
mod instances;
mod properties;
mod structure;

use std::collections::{BTreeMap, BTreeSet, HashMap};

use uuid::Uuid;

use crate::action::{Action, DEFAULT_ACTION_CAP, Sink};
use crate::check::Check;
use crate::error::TreeError;
use crate::instance::CheckInstance;
use crate::object::{ElementDetail, ElementSnapshot, ObjectKind, ObjectRef, ObjectState};
use crate::property::Property;

/// One element of the tree with everything attached to it.
#[derive(Debug, Clone)]
pub struct Element {
    id: Uuid,
    kind: ObjectKind,
    name: String,
    team_id: Uuid,
    state: ObjectState,
    detail: ElementDetail,
    properties: BTreeMap<Uuid, Property>,
    checks: BTreeMap<Uuid, Check>,
    instances: BTreeMap<Uuid, CheckInstance>,
}

impl Element {
    fn new(id: Uuid, name: String, team_id: Uuid, detail: ElementDetail) -> Self {
        Self {
            id,
            kind: detail.kind(),
            name,
            team_id,
            state: ObjectState::Standalone,
            detail,
            properties: BTreeMap::new(),
            checks: BTreeMap::new(),
            instances: BTreeMap::new(),
        }
    }

    /// Element id.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Element kind.
    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    /// Typed reference.
    pub fn object_ref(&self) -> ObjectRef {
        ObjectRef::new(self.kind, self.id)
    }

    /// Element name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Owning team.
    pub fn team_id(&self) -> Uuid {
        self.team_id
    }

    /// Placement state.
    pub fn state(&self) -> ObjectState {
        self.state
    }

    /// Kind-specific attributes.
    pub fn detail(&self) -> &ElementDetail {
        &self.detail
    }

    /// Properties keyed by instance id, local and inherited.
    pub fn properties(&self) -> impl Iterator<Item = &Property> {
        self.properties.values()
    }

    /// Checks keyed by check id, local and inherited.
    pub fn checks(&self) -> impl Iterator<Item = &Check> {
        self.checks.values()
    }

    /// Computed check instances.
    pub fn instances(&self) -> impl Iterator<Item = &CheckInstance> {
        self.instances.values()
    }
}

#[derive(Debug, Clone, Default)]
struct Arena {
    elements: HashMap<Uuid, Element>,
    parents: HashMap<Uuid, Uuid>,
    children: HashMap<Uuid, BTreeSet<Uuid>>,
    fault: Option<Uuid>,
    /// Last version of each deleted check instance; ids are stable and revive.
    retired: HashMap<Uuid, u32>,
}

/// Properties and checks of one element at a point in time.
type Attachments = (ObjectRef, BTreeMap<Uuid, Property>, BTreeMap<Uuid, Check>);

/// A repository tree with buffered transactions and action/error streams.
#[derive(Debug)]
pub struct Tree {
    arena: Arena,
    snapshot: Option<Arena>,
    sink: Sink,
    loading: bool,
    loaded: BTreeSet<Uuid>,
}

impl Default for Tree {
    fn default() -> Self {
        Self::new()
    }
}

impl Tree {
    /// Id of the synthetic root element.
    pub const ROOT_ID: Uuid = Uuid::nil();

    /// Create a root-only tree with the default action cap.
    pub fn new() -> Self {
        Self::with_action_cap(DEFAULT_ACTION_CAP)
    }

    /// Create a root-only tree buffering at most `cap` actions between drains.
    ///
    /// A fresh tree is in load mode until [`Tree::clear_load_info`] is called.
    pub fn with_action_cap(cap: usize) -> Self {
        let mut arena = Arena::default();
        arena.elements.insert(
            Self::ROOT_ID,
            Element::new(
                Self::ROOT_ID,
                "root".to_string(),
                Uuid::nil(),
                ElementDetail::Root,
            ),
        );
        Self {
            arena,
            snapshot: None,
            sink: Sink::new(cap),
            loading: true,
            loaded: BTreeSet::new(),
        }
    }

    // ------------------------------------------------------------------
    // Transactions and streams
    // ------------------------------------------------------------------

    /// Start buffering mutations so they can be rolled back.
    pub fn begin(&mut self) {
        self.snapshot = Some(self.arena.clone());
    }

    /// Keep all mutations since [`Tree::begin`].
    pub fn commit(&mut self) {
        self.snapshot = None;
    }

    /// Restore the state at [`Tree::begin`] and discard buffered actions and errors.
    pub fn rollback(&mut self) {
        if let Some(arena) = self.snapshot.take() {
            self.arena = arena;
        }
        self.sink.clear();
    }

    /// Take all buffered actions.
    pub fn drain_actions(&mut self) -> Vec<Action> {
        self.sink.drain_actions()
    }

    /// Take all recorded errors.
    pub fn drain_errors(&mut self) -> Vec<TreeError> {
        self.sink.drain_errors()
    }

    /// Whether errors are waiting to be drained.
    pub fn has_errors(&self) -> bool {
        self.sink.has_errors()
    }

    /// Number of instances seeded through [`Tree::load_instance`] since the last clear.
    pub fn loaded_count(&self) -> usize {
        self.loaded.len()
    }

    /// Leave load mode: from now on instance differences are actions, not divergence.
    pub fn clear_load_info(&mut self) {
        self.loading = false;
        self.loaded.clear();
    }

    // ------------------------------------------------------------------
    // Read access
    // ------------------------------------------------------------------

    /// Element by id.
    pub fn element(&self, id: Uuid) -> Option<&Element> {
        self.arena.elements.get(&id)
    }

    /// Parent of an element.
    pub fn parent_of(&self, id: Uuid) -> Option<Uuid> {
        self.arena.parents.get(&id).copied()
    }

    /// Children of an element in id order.
    pub fn children_of(&self, id: Uuid) -> Vec<Uuid> {
        self.arena
            .children
            .get(&id)
            .map(|c| c.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Number of elements including the root.
    pub fn len(&self) -> usize {
        self.arena.elements.len()
    }

    /// Whether the tree holds only the root.
    pub fn is_empty(&self) -> bool {
        self.arena.elements.len() == 1
    }

    /// Value snapshot of an element.
    pub fn snapshot(&self, id: Uuid) -> Option<ElementSnapshot> {
        let element = self.arena.elements.get(&id)?;
        Some(ElementSnapshot {
            id,
            kind: element.kind,
            name: element.name.clone(),
            team_id: element.team_id,
            state: element.state,
            bucket_id: self.ancestor_of_kind(id, ObjectKind::Bucket),
            repository_id: self.ancestor_of_kind(id, ObjectKind::Repository),
            detail: element.detail.clone(),
        })
    }

    /// All check instances in traversal order.
    pub fn check_instances(&self) -> Vec<&CheckInstance> {
        self.subtree(Self::ROOT_ID)
            .into_iter()
            .filter_map(|id| self.arena.elements.get(&id))
            .flat_map(|e| e.instances.values())
            .collect()
    }

    /// Structural invariant violations; empty for a healthy tree.
    pub fn invariant_violations(&self) -> Vec<String> {
        let mut violations = Vec::new();
        for (id, element) in &self.arena.elements {
            if *id == Self::ROOT_ID {
                continue;
            }
            match self.arena.parents.get(id) {
                None => violations.push(format!("{} has no parent", element.object_ref())),
                Some(parent) => {
                    let listed = self
                        .arena
                        .children
                        .get(parent)
                        .is_some_and(|c| c.contains(id));
                    if !listed || !self.arena.elements.contains_key(parent) {
                        violations.push(format!("{} has a dangling parent", element.object_ref()));
                    }
                }
            }
            let mut seen = BTreeSet::new();
            let mut cursor = *id;
            while let Some(parent) = self.arena.parents.get(&cursor) {
                if !seen.insert(cursor) {
                    violations.push(format!("{} is part of a cycle", element.object_ref()));
                    break;
                }
                cursor = *parent;
            }
            if matches!(
                element.kind,
                ObjectKind::Group | ObjectKind::Cluster | ObjectKind::Node
            ) {
                let buckets = self
                    .ancestors(*id)
                    .into_iter()
                    .filter(|a| self.kind_of(*a) == Some(ObjectKind::Bucket))
                    .count();
                if buckets != 1 {
                    violations.push(format!(
                        "{} is in {} buckets",
                        element.object_ref(),
                        buckets
                    ));
                }
            }
        }
        violations.sort();
        violations
    }

    // ------------------------------------------------------------------
    // Internal helpers
    // ------------------------------------------------------------------

    fn kind_of(&self, id: Uuid) -> Option<ObjectKind> {
        self.arena.elements.get(&id).map(|e| e.kind)
    }

    /// Resolve a reference to an existing, mutable element, recording an error otherwise.
    fn resolve(&mut self, target: ObjectRef) -> Option<Uuid> {
        if target.kind == ObjectKind::Fault || Some(target.id) == self.arena.fault {
            self.sink.error(TreeError::Fault);
            return None;
        }
        match self.kind_of(target.id) {
            Some(kind) if kind == target.kind => Some(target.id),
            _ => {
                self.sink.error(TreeError::NotFound(target));
                None
            }
        }
    }

    fn ancestors(&self, id: Uuid) -> Vec<Uuid> {
        let mut out = Vec::new();
        let mut cursor = id;
        while let Some(parent) = self.arena.parents.get(&cursor) {
            if out.contains(parent) {
                break;
            }
            out.push(*parent);
            cursor = *parent;
        }
        out
    }

    /// The element itself or its closest ancestor of `kind`.
    fn ancestor_of_kind(&self, id: Uuid, kind: ObjectKind) -> Option<Uuid> {
        if self.kind_of(id) == Some(kind) {
            return Some(id);
        }
        self.ancestors(id)
            .into_iter()
            .find(|a| self.kind_of(*a) == Some(kind))
    }

    /// Preorder traversal of the subtree below and including `root`.
    fn subtree(&self, root: Uuid) -> Vec<Uuid> {
        let mut out = Vec::new();
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            if !self.arena.elements.contains_key(&id) {
                continue;
            }
            out.push(id);
            if let Some(children) = self.arena.children.get(&id) {
                stack.extend(children.iter().rev().copied());
            }
        }
        out
    }

    fn link(&mut self, child: Uuid, parent: Uuid) {
        self.arena.parents.insert(child, parent);
        self.arena.children.entry(parent).or_default().insert(child);
    }

    fn unlink(&mut self, child: Uuid) {
        if let Some(parent) = self.arena.parents.remove(&child)
            && let Some(children) = self.arena.children.get_mut(&parent)
        {
            children.remove(&child);
        }
    }

    fn capture(&self, ids: &[Uuid]) -> Vec<Attachments> {
        ids.iter()
            .filter_map(|id| self.arena.elements.get(id))
            .map(|e| (e.object_ref(), e.properties.clone(), e.checks.clone()))
            .collect()
    }

    /// Rebuild inherited properties and checks for `root` and everything below it.
    fn reinherit(&mut self, root: Uuid) {
        for id in self.subtree(root) {
            let (properties, checks) = match self.arena.parents.get(&id) {
                Some(parent) => self.inheritable(*parent, id),
                None => (Vec::new(), Vec::new()),
            };
            if let Some(element) = self.arena.elements.get_mut(&id) {
                element.properties.retain(|_, p| p.is_source());
                element.checks.retain(|_, c| c.is_source());
                for property in properties {
                    element.properties.insert(property.instance_id, property);
                }
                for check in checks {
                    element.checks.insert(check.check_id, check);
                }
            }
        }
    }

    /// Copies of everything `parent` passes down, placed on `child`.
    fn inheritable(&self, parent: Uuid, child: Uuid) -> (Vec<Property>, Vec<Check>) {
        let Some(element) = self.arena.elements.get(&parent) else {
            return (Vec::new(), Vec::new());
        };
        let properties = element
            .properties
            .values()
            .filter(|p| p.inherits())
            .map(|p| p.inherited_copy(child, p.inherited_from.unwrap_or(parent)))
            .collect();
        let checks = element
            .checks
            .values()
            .filter(|c| c.inheritance)
            .map(|c| c.inherited_copy(child, c.origin(parent)))
            .collect();
        (properties, checks)
    }

    /// Emit property and check actions for everything that changed since `before`.
    fn emit_attachment_diff(&mut self, before: Vec<Attachments>) {
        for (object, old_properties, old_checks) in before {
            let (new_properties, new_checks) = match self.arena.elements.get(&object.id) {
                Some(e) => (e.properties.clone(), e.checks.clone()),
                None => (BTreeMap::new(), BTreeMap::new()),
            };
            for (instance_id, property) in &old_properties {
                if !new_properties.contains_key(instance_id) {
                    self.sink.action(Action::PropertyDelete {
                        object,
                        property: property.clone(),
                    });
                }
            }
            for (instance_id, property) in &new_properties {
                match old_properties.get(instance_id) {
                    None => self.sink.action(Action::PropertyNew {
                        object,
                        property: property.clone(),
                    }),
                    Some(old) if old != property => self.sink.action(Action::PropertyUpdate {
                        object,
                        property: property.clone(),
                    }),
                    Some(_) => {}
                }
            }
            for (check_id, check) in &old_checks {
                if !new_checks.contains_key(check_id) {
                    self.sink.action(Action::CheckRemoved {
                        object,
                        check: check.clone(),
                    });
                }
            }
            for (check_id, check) in &new_checks {
                if !old_checks.contains_key(check_id) {
                    self.sink.action(Action::CheckNew {
                        object,
                        check: check.clone(),
                    });
                }
            }
        }
    }
}
