// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Job to tree mutation routing.

use soma_tree::{ObjectKind, ObjectRef, Tree};

use crate::error::{Result, SomaError};
use crate::job::JobSpec;

/// Apply one job to the tree. Problems the tree detects land on its error stream.
pub(crate) fn apply(tree: &mut Tree, spec: &JobSpec) -> Result<()> {
    match spec {
        JobSpec::RepositoryCreate { .. } => {
            return Err(SomaError::invariant(
                "repository creation is not a TreeKeeper job",
            ));
        }
        JobSpec::Create { element, parent } => tree.attach(element.clone(), *parent),
        JobSpec::Destroy { object } => tree.destroy(*object),
        JobSpec::Rename { object, name } => tree.set_name(*object, name),
        JobSpec::MemberAssign { parent, member } => tree.reattach(*member, *parent),
        JobSpec::MemberUnassign { parent, member } => tree.detach(*member, *parent),
        JobSpec::NodeAssign { node, bucket_id } => {
            tree.attach(node.clone(), ObjectRef::new(ObjectKind::Bucket, *bucket_id))
        }
        JobSpec::NodeUnassign { node } => tree.destroy(*node),
        JobSpec::PropertyAdd { object, property } => tree.set_property(*object, property.clone()),
        JobSpec::PropertyRemove {
            object,
            source_instance_id,
            ..
        } => tree.delete_property(*object, *source_instance_id),
        JobSpec::PropertyUpdate { object, property } => {
            tree.update_property(*object, property.clone())
        }
        JobSpec::CheckConfigCreate { config } => tree.set_check(config.object, config.check_spec()),
        JobSpec::CheckConfigDestroy { config_id, object } => tree.delete_check(*object, *config_id),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use soma_tree::{Action, ElementDetail, NewElement, TreeError};
    use uuid::Uuid;

    fn repository(tree: &mut Tree) -> ObjectRef {
        tree.clear_load_info();
        let id = Uuid::new_v4();
        tree.attach(
            NewElement {
                id,
                name: "alpha".to_string(),
                team_id: Uuid::new_v4(),
                detail: ElementDetail::Repository { active: true },
            },
            ObjectRef::new(ObjectKind::Root, Tree::ROOT_ID),
        );
        tree.drain_actions();
        ObjectRef::new(ObjectKind::Repository, id)
    }

    #[test]
    fn test_create_bucket_attaches_below_repository() {
        let mut tree = Tree::new();
        let repo = repository(&mut tree);
        let spec = JobSpec::Create {
            element: NewElement {
                id: Uuid::new_v4(),
                name: "alpha_prod".to_string(),
                team_id: Uuid::new_v4(),
                detail: ElementDetail::Bucket {
                    environment: "prod".to_string(),
                    frozen: false,
                },
            },
            parent: repo,
        };
        apply(&mut tree, &spec).unwrap();
        assert!(tree.drain_errors().is_empty());
        assert!(
            tree.drain_actions()
                .iter()
                .any(|a| matches!(a, Action::Create { element, .. } if element.name == "alpha_prod"))
        );
    }

    #[test]
    fn test_bad_bucket_name_lands_on_error_stream() {
        let mut tree = Tree::new();
        let repo = repository(&mut tree);
        let spec = JobSpec::Create {
            element: NewElement {
                id: Uuid::new_v4(),
                name: "beta_prod".to_string(),
                team_id: Uuid::new_v4(),
                detail: ElementDetail::Bucket {
                    environment: "prod".to_string(),
                    frozen: false,
                },
            },
            parent: repo,
        };
        apply(&mut tree, &spec).unwrap();
        assert!(matches!(
            tree.drain_errors().as_slice(),
            [TreeError::BucketPrefix { .. }]
        ));
    }

    #[test]
    fn test_repository_create_is_rejected() {
        let mut tree = Tree::new();
        let spec = JobSpec::RepositoryCreate {
            repository: NewElement {
                id: Uuid::new_v4(),
                name: "alpha".to_string(),
                team_id: Uuid::new_v4(),
                detail: ElementDetail::Repository { active: true },
            },
        };
        assert!(matches!(
            apply(&mut tree, &spec),
            Err(SomaError::Invariant(_))
        ));
    }
}
