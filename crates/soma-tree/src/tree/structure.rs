// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Structural mutations: attach, membership changes, destroy and rename.

use uuid::Uuid;

use super::{Element, Tree};
use crate::action::Action;
use crate::error::TreeError;
use crate::object::{ElementDetail, NewElement, ObjectKind, ObjectRef, ObjectState};

impl Tree {
    /// Look up an element.
    ///
    /// With `absent_ok`, a missing element resolves to the fault placeholder
    /// instead of recording [`TreeError::NotFound`].
    pub fn find(&mut self, target: ObjectRef, absent_ok: bool) -> Option<ObjectRef> {
        if self.kind_of(target.id) == Some(target.kind) {
            return Some(target);
        }
        if absent_ok {
            return Some(self.fault());
        }
        self.sink.error(TreeError::NotFound(target));
        None
    }

    fn fault(&mut self) -> ObjectRef {
        if let Some(id) = self.arena.fault {
            return ObjectRef::new(ObjectKind::Fault, id);
        }
        let id = Uuid::new_v5(&Self::ROOT_ID, b"fault");
        self.arena.elements.insert(
            id,
            Element::new(id, "fault".to_string(), Uuid::nil(), ElementDetail::Fault),
        );
        self.link(id, Self::ROOT_ID);
        self.arena.fault = Some(id);
        ObjectRef::new(ObjectKind::Fault, id)
    }

    /// Attach a new element below `parent`.
    ///
    /// Repositories hang below the root, buckets below a repository, groups,
    /// clusters and nodes below a bucket. Attaching a node is a node assignment.
    pub fn attach(&mut self, element: NewElement, parent: ObjectRef) {
        let kind = element.kind();
        let Some(parent_id) = self.resolve(parent) else {
            return;
        };
        let allowed = matches!(
            (kind, parent.kind),
            (ObjectKind::Repository, ObjectKind::Root)
                | (ObjectKind::Bucket, ObjectKind::Repository)
                | (ObjectKind::Group, ObjectKind::Bucket)
                | (ObjectKind::Cluster, ObjectKind::Bucket)
                | (ObjectKind::Node, ObjectKind::Bucket)
        );
        if !allowed {
            self.sink.error(TreeError::InvalidParent {
                child: kind,
                parent: parent.kind,
            });
            return;
        }
        if self.arena.elements.contains_key(&element.id) {
            self.sink
                .error(TreeError::Duplicate(ObjectRef::new(kind, element.id)));
            return;
        }
        if kind == ObjectKind::Bucket
            && let Some(prefix) = self.bucket_prefix(parent_id)
            && !element.name.starts_with(&prefix)
        {
            self.sink.error(TreeError::BucketPrefix {
                name: element.name,
                prefix,
            });
            return;
        }

        let id = element.id;
        self.arena.elements.insert(
            id,
            Element::new(id, element.name, element.team_id, element.detail),
        );
        self.link(id, parent_id);
        let before = self.capture(&[id]);
        self.reinherit(id);

        let Some(snapshot) = self.snapshot(id) else {
            return;
        };
        if kind == ObjectKind::Node {
            self.sink.action(Action::NodeAssignment {
                element: snapshot.clone(),
                bucket_id: parent_id,
            });
        } else {
            self.sink.action(Action::Create {
                element: snapshot.clone(),
                parent,
            });
        }
        self.sink.action(Action::Attached {
            element: snapshot,
            parent,
        });
        self.emit_attachment_diff(before);
    }

    /// Make a standalone element a member of a group or cluster in the same bucket.
    pub fn reattach(&mut self, child: ObjectRef, parent: ObjectRef) {
        let (Some(child_id), Some(parent_id)) = (self.resolve(child), self.resolve(parent)) else {
            return;
        };
        let allowed = matches!(
            (child.kind, parent.kind),
            (ObjectKind::Group, ObjectKind::Group)
                | (ObjectKind::Cluster, ObjectKind::Group)
                | (ObjectKind::Node, ObjectKind::Group)
                | (ObjectKind::Node, ObjectKind::Cluster)
        );
        if !allowed {
            self.sink.error(TreeError::InvalidParent {
                child: child.kind,
                parent: parent.kind,
            });
            return;
        }
        let bucket = self.ancestor_of_kind(child_id, ObjectKind::Bucket);
        if bucket.is_none() || bucket != self.ancestor_of_kind(parent_id, ObjectKind::Bucket) {
            self.sink.error(TreeError::CrossBucket { child, parent });
            return;
        }
        if child_id == parent_id || self.ancestors(parent_id).contains(&child_id) {
            self.sink.error(TreeError::Cycle { child, parent });
            return;
        }
        if self
            .arena
            .elements
            .get(&child_id)
            .is_none_or(|e| e.state != ObjectState::Standalone)
        {
            self.sink.error(TreeError::NotStandalone(child));
            return;
        }
        let Some(bucket_id) = bucket else {
            return;
        };

        let state = if parent.kind == ObjectKind::Cluster {
            ObjectState::Clustered
        } else {
            ObjectState::Grouped
        };
        self.move_element(child_id, parent_id, state);
        self.sink.action(Action::MemberNew {
            parent,
            child,
            bucket_id,
        });
        self.emit_move(child_id, parent);
    }

    /// Remove a member from its group or cluster, returning it to the bucket.
    pub fn detach(&mut self, child: ObjectRef, parent: ObjectRef) {
        let (Some(child_id), Some(parent_id)) = (self.resolve(child), self.resolve(parent)) else {
            return;
        };
        if self.parent_of(child_id) != Some(parent_id)
            || !matches!(parent.kind, ObjectKind::Group | ObjectKind::Cluster)
        {
            self.sink.error(TreeError::NotMember(child));
            return;
        }
        self.release_member(child_id, parent);
    }

    /// Move a member of `parent` back to its bucket and emit the changes.
    fn release_member(&mut self, child_id: Uuid, parent: ObjectRef) {
        let Some(bucket_id) = self.ancestor_of_kind(parent.id, ObjectKind::Bucket) else {
            return;
        };
        let Some(child) = self.arena.elements.get(&child_id).map(Element::object_ref) else {
            return;
        };
        self.move_element(child_id, bucket_id, ObjectState::Standalone);
        self.sink.action(Action::MemberRemoved {
            parent,
            child,
            bucket_id,
        });
        self.emit_move(child_id, ObjectRef::new(ObjectKind::Bucket, bucket_id));
    }

    fn move_element(&mut self, id: Uuid, parent: Uuid, state: ObjectState) {
        self.unlink(id);
        self.link(id, parent);
        if let Some(element) = self.arena.elements.get_mut(&id) {
            element.state = state;
        }
    }

    /// Re-inherit a moved subtree from its new parent chain and emit the changes.
    fn emit_move(&mut self, id: Uuid, parent: ObjectRef) {
        let before = self.capture(&self.subtree(id));
        self.reinherit(id);
        if let Some(snapshot) = self.snapshot(id) {
            self.sink.action(Action::Update {
                element: snapshot.clone(),
            });
            self.sink.action(Action::Attached {
                element: snapshot,
                parent,
            });
        }
        self.emit_attachment_diff(before);
    }

    /// Remove an element from the tree.
    ///
    /// Groups and clusters first return their members to the bucket; buckets
    /// and repositories take their whole subtree with them; a node is unassigned.
    pub fn destroy(&mut self, target: ObjectRef) {
        let Some(id) = self.resolve(target) else {
            return;
        };
        match target.kind {
            ObjectKind::Root | ObjectKind::Fault => {
                self.sink.error(TreeError::Fault);
            }
            ObjectKind::Group | ObjectKind::Cluster => {
                for member in self.children_of(id) {
                    self.release_member(member, target);
                }
                self.remove_subtree(id);
            }
            ObjectKind::Repository | ObjectKind::Bucket | ObjectKind::Node => {
                self.remove_subtree(id);
            }
        }
    }

    fn remove_subtree(&mut self, root: Uuid) {
        let ids = self.subtree(root);
        let before = self.capture(&ids);
        let mut snapshots = Vec::with_capacity(ids.len());
        let mut instances = Vec::new();
        for id in &ids {
            if let Some(mut snapshot) = self.snapshot(*id) {
                if snapshot.kind == ObjectKind::Node {
                    snapshot.state = ObjectState::Unassigned;
                }
                snapshots.push(snapshot);
            }
            if let Some(element) = self.arena.elements.get(id) {
                instances.extend(element.instances.values().cloned());
            }
        }
        for id in &ids {
            self.unlink(*id);
            self.arena.elements.remove(id);
            self.arena.children.remove(id);
        }
        for instance in instances {
            self.retire_instance(&instance);
            self.sink.action(Action::CheckInstanceDelete { instance });
        }
        self.emit_attachment_diff(before);
        for snapshot in snapshots.into_iter().rev() {
            self.sink.action(Action::Delete { element: snapshot });
        }
    }

    /// Required bucket name prefix below the repository containing `id`.
    fn bucket_prefix(&self, id: Uuid) -> Option<String> {
        let repository = self.ancestor_of_kind(id, ObjectKind::Repository)?;
        self.arena
            .elements
            .get(&repository)
            .map(|r| format!("{}_", r.name))
    }

    /// Rename an element. Bucket names keep the repository prefix.
    pub fn set_name(&mut self, target: ObjectRef, name: &str) {
        let Some(id) = self.resolve(target) else {
            return;
        };
        if target.kind == ObjectKind::Root {
            self.sink.error(TreeError::Fault);
            return;
        }
        if target.kind == ObjectKind::Bucket
            && let Some(prefix) = self.bucket_prefix(id)
            && !name.starts_with(&prefix)
        {
            self.sink.error(TreeError::BucketPrefix {
                name: name.to_string(),
                prefix,
            });
            return;
        }
        let Some(element) = self.arena.elements.get_mut(&id) else {
            return;
        };
        if element.name == name {
            return;
        }
        let old_name = std::mem::replace(&mut element.name, name.to_string());
        if let Some(snapshot) = self.snapshot(id) {
            self.sink.action(Action::Rename {
                element: snapshot,
                old_name,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::NewElement;

    fn repository(tree: &mut Tree, name: &str) -> ObjectRef {
        let id = Uuid::new_v4();
        tree.attach(
            NewElement {
                id,
                name: name.to_string(),
                team_id: Uuid::nil(),
                detail: ElementDetail::Repository { active: true },
            },
            ObjectRef::new(ObjectKind::Root, Tree::ROOT_ID),
        );
        ObjectRef::new(ObjectKind::Repository, id)
    }

    fn bucket(tree: &mut Tree, repository: ObjectRef, name: &str) -> ObjectRef {
        let id = Uuid::new_v4();
        tree.attach(
            NewElement {
                id,
                name: name.to_string(),
                team_id: Uuid::nil(),
                detail: ElementDetail::Bucket {
                    environment: "prod".to_string(),
                    frozen: false,
                },
            },
            repository,
        );
        ObjectRef::new(ObjectKind::Bucket, id)
    }

    fn group(tree: &mut Tree, bucket: ObjectRef, name: &str) -> ObjectRef {
        let id = Uuid::new_v4();
        tree.attach(
            NewElement {
                id,
                name: name.to_string(),
                team_id: Uuid::nil(),
                detail: ElementDetail::Group,
            },
            bucket,
        );
        ObjectRef::new(ObjectKind::Group, id)
    }

    #[test]
    fn test_bucket_requires_repository_prefix() {
        let mut tree = Tree::new();
        let repo = repository(&mut tree, "alpha");
        bucket(&mut tree, repo, "beta_prod");
        let errors = tree.drain_errors();
        assert!(matches!(errors.as_slice(), [TreeError::BucketPrefix { .. }]));

        bucket(&mut tree, repo, "alpha_prod");
        assert!(tree.drain_errors().is_empty());
    }

    #[test]
    fn test_member_assign_requires_standalone_child() {
        let mut tree = Tree::new();
        let repo = repository(&mut tree, "alpha");
        let b = bucket(&mut tree, repo, "alpha_prod");
        let g1 = group(&mut tree, b, "g1");
        let g2 = group(&mut tree, b, "g2");
        let g3 = group(&mut tree, b, "g3");
        tree.reattach(g3, g1);
        tree.drain_errors();
        tree.reattach(g3, g2);
        assert_eq!(tree.drain_errors(), vec![TreeError::NotStandalone(g3)]);
        tree.reattach(g1, g3);
        assert_eq!(
            tree.drain_errors(),
            vec![TreeError::Cycle {
                child: g1,
                parent: g3
            }]
        );
    }

    #[test]
    fn test_destroying_group_returns_members_to_bucket() {
        let mut tree = Tree::new();
        let repo = repository(&mut tree, "alpha");
        let b = bucket(&mut tree, repo, "alpha_prod");
        let outer = group(&mut tree, b, "outer");
        let inner = group(&mut tree, b, "inner");
        tree.reattach(inner, outer);
        tree.drain_actions();

        tree.destroy(outer);
        assert!(tree.drain_errors().is_empty());
        assert_eq!(tree.parent_of(inner.id), Some(b.id));
        assert_eq!(
            tree.element(inner.id).map(|e| e.state()),
            Some(ObjectState::Standalone)
        );
        let kinds: Vec<_> = tree.drain_actions().iter().map(|a| a.kind()).collect();
        assert_eq!(kinds.first(), Some(&"member_removed"));
        assert_eq!(kinds.last(), Some(&"delete"));
    }

    #[test]
    fn test_fault_placeholder_rejects_mutation() {
        let mut tree = Tree::new();
        let missing = ObjectRef::new(ObjectKind::Group, Uuid::new_v4());
        let fault = tree.find(missing, true).unwrap();
        assert_eq!(fault.kind, ObjectKind::Fault);
        assert_eq!(tree.find(missing, true), Some(fault));
        tree.set_name(fault, "x");
        assert_eq!(tree.drain_errors(), vec![TreeError::Fault]);
        assert_eq!(tree.find(missing, false), None);
        assert_eq!(tree.drain_errors(), vec![TreeError::NotFound(missing)]);
    }

    #[test]
    fn test_rollback_restores_structure() {
        let mut tree = Tree::new();
        let repo = repository(&mut tree, "alpha");
        tree.drain_actions();
        tree.begin();
        let b = bucket(&mut tree, repo, "alpha_prod");
        tree.rollback();
        assert!(tree.element(b.id).is_none());
        assert!(tree.drain_actions().is_empty());
    }
}
