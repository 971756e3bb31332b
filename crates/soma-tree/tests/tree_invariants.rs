// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Property-based tests: structural invariants and deterministic instance computation.

use proptest::prelude::*;
use soma_tree::{
    CheckSpec, Constraint, ElementDetail, NewElement, ObjectKind, ObjectRef, PropertySpec,
    PropertyValue, ServiceAttribute, Tree,
};
use uuid::Uuid;

const REPO: u128 = 1;
const BUCKETS: [u128; 2] = [10, 11];

#[derive(Debug, Clone)]
enum Op {
    CreateGroup(u8, u8),
    CreateCluster(u8, u8),
    AssignNode(u8, u8),
    MemberAssign(u8, u8),
    MemberUnassign(u8),
    Destroy(u8),
    SetProperty(u8, u8),
    SetCheck(u8, bool),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u8..6, 0u8..2).prop_map(|(i, b)| Op::CreateGroup(i, b)),
        (0u8..3, 0u8..2).prop_map(|(i, b)| Op::CreateCluster(i, b)),
        (0u8..6, 0u8..2).prop_map(|(i, b)| Op::AssignNode(i, b)),
        (0u8..15, 0u8..15).prop_map(|(c, p)| Op::MemberAssign(c, p)),
        (0u8..15).prop_map(Op::MemberUnassign),
        (0u8..15).prop_map(Op::Destroy),
        (0u8..17, 0u8..3).prop_map(|(t, v)| Op::SetProperty(t, v)),
        (0u8..17, any::<bool>()).prop_map(|(t, s)| Op::SetCheck(t, s)),
    ]
}

/// Element universe: 0..6 groups, 6..9 clusters, 9..15 nodes, 15..17 buckets.
fn element(index: u8) -> ObjectRef {
    let index = index as u128;
    match index {
        0..6 => ObjectRef::new(ObjectKind::Group, Uuid::from_u128(100 + index)),
        6..9 => ObjectRef::new(ObjectKind::Cluster, Uuid::from_u128(100 + index)),
        9..15 => ObjectRef::new(ObjectKind::Node, Uuid::from_u128(100 + index)),
        _ => ObjectRef::new(ObjectKind::Bucket, Uuid::from_u128(BUCKETS[(index - 15) as usize])),
    }
}

fn bucket(index: u8) -> ObjectRef {
    ObjectRef::new(ObjectKind::Bucket, Uuid::from_u128(BUCKETS[index as usize]))
}

fn seeded() -> Tree {
    let mut tree = Tree::new();
    tree.clear_load_info();
    tree.attach(
        NewElement {
            id: Uuid::from_u128(REPO),
            name: "alpha".to_string(),
            team_id: Uuid::nil(),
            detail: ElementDetail::Repository { active: true },
        },
        ObjectRef::new(ObjectKind::Root, Tree::ROOT_ID),
    );
    for (i, id) in BUCKETS.iter().enumerate() {
        tree.attach(
            NewElement {
                id: Uuid::from_u128(*id),
                name: format!("alpha_b{}", i),
                team_id: Uuid::nil(),
                detail: ElementDetail::Bucket {
                    environment: if i == 0 { "prod" } else { "qa" }.to_string(),
                    frozen: false,
                },
            },
            ObjectRef::new(ObjectKind::Repository, Uuid::from_u128(REPO)),
        );
    }
    tree.drain_actions();
    tree
}

fn apply(tree: &mut Tree, op: &Op, step: usize) {
    tree.begin();
    match op {
        Op::CreateGroup(i, b) => tree.attach(
            NewElement {
                id: element(*i).id,
                name: format!("g{}", i),
                team_id: Uuid::nil(),
                detail: ElementDetail::Group,
            },
            bucket(*b),
        ),
        Op::CreateCluster(i, b) => tree.attach(
            NewElement {
                id: element(6 + *i).id,
                name: format!("c{}", i),
                team_id: Uuid::nil(),
                detail: ElementDetail::Cluster,
            },
            bucket(*b),
        ),
        Op::AssignNode(i, b) => tree.attach(
            NewElement {
                id: element(9 + *i).id,
                name: format!("n{}", i),
                team_id: Uuid::nil(),
                detail: ElementDetail::Node {
                    asset_id: *i as u64,
                    server_id: Uuid::nil(),
                    online: true,
                },
            },
            bucket(*b),
        ),
        Op::MemberAssign(c, p) => tree.reattach(element(*c), element(*p)),
        Op::MemberUnassign(c) => {
            let child = element(*c);
            let parent = tree
                .parent_of(child.id)
                .and_then(|p| tree.element(p))
                .map(|e| e.object_ref())
                .unwrap_or(child);
            tree.detach(child, parent)
        }
        Op::Destroy(i) => tree.destroy(element(*i)),
        Op::SetProperty(t, v) => tree.set_property(
            element(*t),
            PropertySpec {
                source_instance_id: Uuid::from_u128(1000 + step as u128),
                view: ["internal", "any", "local"][*v as usize].to_string(),
                inheritance: true,
                children_only: *v == 1,
                value: PropertyValue::Service {
                    name: format!("svc{}", step % 3),
                    attributes: vec![
                        ServiceAttribute::new("port", "80"),
                        ServiceAttribute::new("port", format!("{}", 8000 + step)),
                    ],
                },
            },
        ),
        Op::SetCheck(t, service_bound) => tree.set_check(
            element(*t),
            CheckSpec {
                config_id: Uuid::from_u128(2000 + step as u128),
                name: format!("check{}", step),
                capability_id: Uuid::from_u128(7),
                view: "internal".to_string(),
                inheritance: true,
                children_only: false,
                constraints: if *service_bound {
                    vec![Constraint::Attribute {
                        name: "port".to_string(),
                        value: "@defined".to_string(),
                    }]
                } else {
                    vec![]
                },
            },
        ),
    }
    tree.compute_check_instances();
    if tree.has_errors() {
        tree.rollback();
    } else {
        tree.drain_actions();
        tree.commit();
    }
}

fn fingerprint(tree: &Tree) -> Vec<(Uuid, String, String, u32)> {
    tree.check_instances()
        .into_iter()
        .map(|i| {
            (
                i.instance_id,
                i.constraint_hash.clone(),
                i.constraint_val_hash.clone(),
                i.version,
            )
        })
        .collect()
}

proptest! {
    #[test]
    fn structural_invariants_hold_after_every_job(ops in prop::collection::vec(op(), 1..40)) {
        let mut tree = seeded();
        for (step, op) in ops.iter().enumerate() {
            apply(&mut tree, op, step);
            let violations = tree.invariant_violations();
            prop_assert!(violations.is_empty(), "after {:?}: {:?}", op, violations);
        }
    }

    #[test]
    fn instance_computation_is_deterministic(ops in prop::collection::vec(op(), 1..40)) {
        let mut a = seeded();
        let mut b = seeded();
        for (step, op) in ops.iter().enumerate() {
            apply(&mut a, op, step);
            apply(&mut b, op, step);
        }
        prop_assert_eq!(fingerprint(&a), fingerprint(&b));

        a.compute_check_instances();
        prop_assert!(a.drain_actions().is_empty());
        prop_assert!(a.drain_errors().is_empty());
    }

    #[test]
    fn rollback_leaves_no_trace(ops in prop::collection::vec(op(), 1..20), extra in op()) {
        let mut tree = seeded();
        for (step, op) in ops.iter().enumerate() {
            apply(&mut tree, op, step);
        }
        let before = fingerprint(&tree);
        let size = tree.len();
        tree.begin();
        match extra {
            Op::Destroy(i) => tree.destroy(element(i)),
            _ => tree.destroy(bucket(0)),
        }
        tree.compute_check_instances();
        tree.rollback();
        prop_assert_eq!(tree.len(), size);
        prop_assert_eq!(fingerprint(&tree), before);
        prop_assert!(tree.drain_actions().is_empty());
    }
}
