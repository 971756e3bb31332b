// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Check instance computation.
//!
//! Every effective check on a group, cluster or node is evaluated against the
//! element's effective properties in the check's view. Filter constraints
//! (native, system, custom, oncall) must all hold; service and attribute
//! constraints select services and fan out over the allowed attribute values.

use std::collections::{BTreeMap, BTreeSet};

use uuid::Uuid;

use super::Tree;
use crate::action::Action;
use crate::check::{ATTRIBUTE_DEFINED, Check, Constraint};
use crate::error::TreeError;
use crate::instance::{CheckInstance, FieldHasher, ServiceConfig};
use crate::object::{ElementDetail, ObjectKind};
use crate::property::{Property, PropertyValue, ServiceAttribute};

/// One service selection: the service, its source attachment and the chosen attribute values.
type Selection = Option<(ServiceConfig, Uuid, Vec<ServiceAttribute>)>;

impl Tree {
    /// Seed a stored check instance during startup load.
    pub fn load_instance(&mut self, instance: CheckInstance) {
        let Some(id) = self.resolve(instance.object) else {
            return;
        };
        if !instance.object.kind.carries_instances() {
            self.sink.error(TreeError::LoadMismatch {
                instance_id: instance.instance_id,
                object: instance.object,
                reason: "not computed",
            });
            return;
        }
        self.loaded.insert(instance.instance_id);
        self.arena.retired.remove(&instance.instance_id);
        if let Some(element) = self.arena.elements.get_mut(&id) {
            element.instances.insert(instance.instance_id, instance);
        }
    }

    /// Remember the last stored version of an instance that is not live, so a
    /// recomputed instance with the same id continues past it.
    pub fn retire_version(&mut self, instance_id: Uuid, version: u32) {
        let last = self.arena.retired.entry(instance_id).or_default();
        *last = (*last).max(version);
    }

    /// Recompute check instances on every element and emit the differences.
    ///
    /// In load mode differences are recorded as [`TreeError::LoadMismatch`]
    /// because stored and computed state must agree after a reload.
    pub fn compute_check_instances(&mut self) {
        for id in self.subtree(Self::ROOT_ID) {
            let Some(element) = self.arena.elements.get(&id) else {
                continue;
            };
            if !element.kind.carries_instances() {
                continue;
            }
            let current = element.instances.clone();
            let desired = self.evaluate(id);

            let mut next = BTreeMap::new();
            for (instance_id, mut instance) in desired {
                match current.get(&instance_id) {
                    None => {
                        instance.version = self.revived_version(instance_id);
                        self.instance_changed(
                            Action::CheckInstanceCreate {
                                instance: instance.clone(),
                            },
                            "not stored",
                        );
                    }
                    Some(old)
                        if old.values_differ(&instance)
                            || old.check_id != instance.check_id
                            || old.config_id != instance.config_id =>
                    {
                        instance.version = old.version + 1;
                        self.instance_changed(
                            Action::CheckInstanceUpdate {
                                instance: instance.clone(),
                            },
                            "changed",
                        );
                    }
                    Some(old) => instance.version = old.version,
                }
                next.insert(instance_id, instance);
            }
            for (instance_id, old) in &current {
                if !next.contains_key(instance_id) {
                    self.retire_instance(old);
                    self.instance_changed(
                        Action::CheckInstanceDelete {
                            instance: old.clone(),
                        },
                        "not computed",
                    );
                }
            }
            if let Some(element) = self.arena.elements.get_mut(&id) {
                element.instances = next;
            }
        }
    }

    /// Version for an instance entering the tree: one past its last life, or 0.
    fn revived_version(&mut self, instance_id: Uuid) -> u32 {
        self.arena
            .retired
            .remove(&instance_id)
            .map_or(0, |last| last + 1)
    }

    pub(super) fn retire_instance(&mut self, instance: &CheckInstance) {
        self.retire_version(instance.instance_id, instance.version);
    }

    fn instance_changed(&mut self, action: Action, reason: &'static str) {
        if !self.loading {
            self.sink.action(action);
            return;
        }
        if let Action::CheckInstanceCreate { instance }
        | Action::CheckInstanceUpdate { instance }
        | Action::CheckInstanceDelete { instance } = action
        {
            self.sink.error(TreeError::LoadMismatch {
                instance_id: instance.instance_id,
                object: instance.object,
                reason,
            });
        }
    }

    /// Desired instances of one element keyed by instance id.
    fn evaluate(&mut self, id: Uuid) -> BTreeMap<Uuid, CheckInstance> {
        let mut out = BTreeMap::new();
        let mut duplicates = Vec::new();
        let Some(element) = self.arena.elements.get(&id) else {
            return out;
        };
        let object = element.object_ref();
        let environment = self
            .ancestor_of_kind(id, ObjectKind::Bucket)
            .and_then(|b| self.arena.elements.get(&b))
            .and_then(|b| match &b.detail {
                ElementDetail::Bucket { environment, .. } => Some(environment.clone()),
                _ => None,
            })
            .unwrap_or_default();
        let effective: Vec<&Property> = element
            .properties
            .values()
            .filter(|p| p.is_effective())
            .collect();

        for check in element.checks.values().filter(|c| c.is_effective()) {
            let visible: Vec<&Property> = effective
                .iter()
                .copied()
                .filter(|p| p.matches_view(&check.view))
                .collect();
            let native = |name: &str| match name {
                "object_type" => Some(element.kind.as_str().to_string()),
                "object_state" => Some(element.state.as_str().to_string()),
                "environment" => Some(environment.clone()),
                _ => None,
            };
            let Some(values) = resolve_filters(check, &visible, native) else {
                continue;
            };
            for selection in select_services(check, &visible) {
                let instance = build_instance(id, object, check, &values, selection);
                if out.contains_key(&instance.instance_id) {
                    duplicates.push(TreeError::DuplicateInstance {
                        instance_id: instance.instance_id,
                        object,
                    });
                    continue;
                }
                out.insert(instance.instance_id, instance);
            }
        }
        for error in duplicates {
            self.sink.error(error);
        }
        out
    }
}

/// Check the filter constraints and hash the values they resolved to.
///
/// Returns `None` when a filter does not hold. The value hasher also covers
/// every visible system, custom and oncall property, which are embedded in
/// the rendered deployment.
fn resolve_filters(
    check: &Check,
    visible: &[&Property],
    native: impl Fn(&str) -> Option<String>,
) -> Option<FieldHasher> {
    let mut hasher = FieldHasher::new("constraint-values");
    for constraint in &check.constraints {
        match constraint {
            Constraint::Native { name, value } => {
                if native(name).as_deref() != Some(value.as_str()) {
                    return None;
                }
                hasher.field(&constraint.canonical());
            }
            Constraint::System { name, value } => {
                let property = visible.iter().find(|p| {
                    matches!(&p.value, PropertyValue::System { name: n, value: v } if n == name && v == value)
                })?;
                hasher
                    .field(&property.source_instance_id.to_string())
                    .field(&property.value.canonical());
            }
            Constraint::Custom {
                custom_id, value, ..
            } => {
                let property = visible.iter().find(|p| {
                    matches!(&p.value, PropertyValue::Custom { custom_id: c, value: v, .. } if c == custom_id && v == value)
                })?;
                hasher
                    .field(&property.source_instance_id.to_string())
                    .field(&property.value.canonical());
            }
            Constraint::Oncall { oncall_id, .. } => {
                let property = visible.iter().find(|p| {
                    matches!(&p.value, PropertyValue::Oncall { oncall_id: o, .. } if o == oncall_id)
                })?;
                hasher
                    .field(&property.source_instance_id.to_string())
                    .field(&property.value.canonical());
            }
            Constraint::Service { .. } | Constraint::Attribute { .. } => {}
        }
    }
    let mut embedded: Vec<String> = visible
        .iter()
        .filter(|p| !matches!(p.value, PropertyValue::Service { .. }))
        .map(|p| p.value.canonical())
        .collect();
    embedded.sort();
    embedded.dedup();
    for value in &embedded {
        hasher.field(value);
    }
    Some(hasher)
}

/// Enumerate service selections. Without service-bound constraints there is
/// exactly one selection, `None`.
fn select_services(check: &Check, visible: &[&Property]) -> Vec<Selection> {
    if !check.constraints.iter().any(Constraint::is_service_bound) {
        return vec![None];
    }
    let names: BTreeSet<&str> = check
        .constraints
        .iter()
        .filter_map(|c| match c {
            Constraint::Service { name } => Some(name.as_str()),
            _ => None,
        })
        .collect();
    let mut wanted: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    for constraint in &check.constraints {
        if let Constraint::Attribute { name, value } = constraint {
            wanted.entry(name.as_str()).or_default().insert(value.as_str());
        }
    }

    // one candidate per service name, the lowest source id wins
    let mut services: BTreeMap<&str, (&Property, &[ServiceAttribute])> = BTreeMap::new();
    for property in visible {
        if let PropertyValue::Service { name, attributes } = &property.value {
            let entry = services
                .entry(name.as_str())
                .or_insert((property, attributes.as_slice()));
            if property.source_instance_id < entry.0.source_instance_id {
                *entry = (property, attributes.as_slice());
            }
        }
    }

    let mut out = Vec::new();
    for (name, (property, attributes)) in services {
        if names.iter().any(|n| *n != name) {
            continue;
        }
        let mut axes: Vec<Vec<ServiceAttribute>> = Vec::new();
        let mut matched = true;
        for (attribute, values) in &wanted {
            let present: Vec<&ServiceAttribute> =
                attributes.iter().filter(|a| a.name == *attribute).collect();
            let allowed: Vec<ServiceAttribute> = if values.contains(ATTRIBUTE_DEFINED) {
                present.iter().map(|a| (*a).clone()).collect()
            } else if values
                .iter()
                .all(|v| present.iter().any(|a| a.value == *v))
            {
                values
                    .iter()
                    .map(|v| ServiceAttribute::new(*attribute, *v))
                    .collect()
            } else {
                Vec::new()
            };
            if allowed.is_empty() {
                matched = false;
                break;
            }
            axes.push(allowed);
        }
        if !matched {
            continue;
        }
        let config = ServiceConfig::new(name, attributes.to_vec());
        for combination in cartesian(&axes) {
            out.push(Some((config.clone(), property.source_instance_id, combination)));
        }
    }
    out
}

fn cartesian(axes: &[Vec<ServiceAttribute>]) -> Vec<Vec<ServiceAttribute>> {
    let mut combinations = vec![Vec::new()];
    for axis in axes {
        let mut next = Vec::with_capacity(combinations.len() * axis.len());
        for prefix in &combinations {
            for value in axis {
                let mut combination = prefix.clone();
                combination.push(value.clone());
                next.push(combination);
            }
        }
        combinations = next;
    }
    combinations
}

fn build_instance(
    element_id: Uuid,
    object: crate::object::ObjectRef,
    check: &Check,
    values: &FieldHasher,
    selection: Selection,
) -> CheckInstance {
    let mut constraint = FieldHasher::new("constraint");
    constraint
        .field(&check.capability_id.to_string())
        .field(&check.origin(element_id).to_string())
        .field(&check.name);
    for c in &check.constraints {
        constraint.field(&c.canonical());
    }
    let mut value_hasher = values.clone();
    let (service, service_cfg_hash) = match selection {
        Some((config, source, combination)) => {
            constraint.field(&format!("service:{}", config.name));
            for attribute in &combination {
                constraint.field(&format!("{}={}", attribute.name, attribute.value));
            }
            let hash = config.hash();
            value_hasher.field(&source.to_string()).field(&hash);
            (Some(config), hash)
        }
        None => (None, String::new()),
    };
    let constraint_hash = constraint.finish();
    CheckInstance {
        instance_id: Uuid::new_v5(&element_id, constraint_hash.as_bytes()),
        check_id: check.check_id,
        config_id: check.config_id,
        object,
        version: 0,
        constraint_hash,
        constraint_val_hash: value_hasher.finish(),
        service,
        service_cfg_hash,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::check::CheckSpec;
    use crate::object::{NewElement, ObjectRef};
    use crate::property::PropertySpec;

    struct Fixture {
        tree: Tree,
        bucket: ObjectRef,
        node: ObjectRef,
    }

    /// A repository with one bucket holding one node; ids are fixed so two
    /// fixtures describe the same stored repository.
    fn fixture_in(loading: bool) -> Fixture {
        let mut tree = Tree::new();
        if !loading {
            tree.clear_load_info();
        }
        let repo = ObjectRef::new(ObjectKind::Repository, Uuid::from_u128(1));
        let bucket = ObjectRef::new(ObjectKind::Bucket, Uuid::from_u128(2));
        let node = ObjectRef::new(ObjectKind::Node, Uuid::from_u128(3));
        tree.attach(
            NewElement {
                id: repo.id,
                name: "alpha".to_string(),
                team_id: Uuid::nil(),
                detail: ElementDetail::Repository { active: true },
            },
            ObjectRef::new(ObjectKind::Root, Tree::ROOT_ID),
        );
        tree.attach(
            NewElement {
                id: bucket.id,
                name: "alpha_prod".to_string(),
                team_id: Uuid::nil(),
                detail: ElementDetail::Bucket {
                    environment: "prod".to_string(),
                    frozen: false,
                },
            },
            repo,
        );
        tree.attach(
            NewElement {
                id: node.id,
                name: "n1".to_string(),
                team_id: Uuid::nil(),
                detail: ElementDetail::Node {
                    asset_id: 42,
                    server_id: Uuid::nil(),
                    online: true,
                },
            },
            bucket,
        );
        tree.drain_actions();
        Fixture { tree, bucket, node }
    }

    fn fixture() -> Fixture {
        fixture_in(false)
    }

    fn check_spec(constraints: Vec<Constraint>) -> CheckSpec {
        CheckSpec {
            config_id: Uuid::new_v4(),
            name: "load-high".to_string(),
            capability_id: Uuid::new_v4(),
            view: "internal".to_string(),
            inheritance: true,
            children_only: false,
            constraints,
        }
    }

    fn service(source: Uuid, ports: &[&str]) -> PropertySpec {
        PropertySpec {
            source_instance_id: source,
            view: "internal".to_string(),
            inheritance: true,
            children_only: false,
            value: PropertyValue::Service {
                name: "www".to_string(),
                attributes: ports
                    .iter()
                    .map(|p| ServiceAttribute::new("port", *p))
                    .collect(),
            },
        }
    }

    fn instance_actions(tree: &mut Tree) -> Vec<Action> {
        tree.drain_actions()
            .into_iter()
            .filter(Action::is_instance_action)
            .collect()
    }

    #[test]
    fn test_unconstrained_check_yields_one_instance_per_node() {
        let mut f = fixture();
        f.tree.set_check(f.bucket, check_spec(vec![]));
        f.tree.compute_check_instances();
        let actions = instance_actions(&mut f.tree);
        assert_eq!(actions.len(), 1);
        let Action::CheckInstanceCreate { instance } = &actions[0] else {
            panic!("expected create");
        };
        assert_eq!(instance.object, f.node);
        assert_eq!(instance.version, 0);
        assert!(instance.service.is_none());
    }

    #[test]
    fn test_native_constraint_filters() {
        let mut f = fixture();
        f.tree.set_check(
            f.bucket,
            check_spec(vec![Constraint::Native {
                name: "environment".to_string(),
                value: "qa".to_string(),
            }]),
        );
        f.tree.compute_check_instances();
        assert!(instance_actions(&mut f.tree).is_empty());
    }

    #[test]
    fn test_defined_attribute_fans_out_per_value() {
        let mut f = fixture();
        f.tree
            .set_property(f.bucket, service(Uuid::new_v4(), &["80", "443"]));
        f.tree.set_check(
            f.bucket,
            check_spec(vec![
                Constraint::Service {
                    name: "www".to_string(),
                },
                Constraint::Attribute {
                    name: "port".to_string(),
                    value: ATTRIBUTE_DEFINED.to_string(),
                },
            ]),
        );
        f.tree.compute_check_instances();
        let actions = instance_actions(&mut f.tree);
        assert_eq!(actions.len(), 2);
        let hashes: BTreeSet<_> = f
            .tree
            .check_instances()
            .iter()
            .map(|i| i.constraint_hash.clone())
            .collect();
        assert_eq!(hashes.len(), 2);
    }

    #[test]
    fn test_value_change_bumps_version() {
        let mut f = fixture();
        let source = Uuid::new_v4();
        f.tree.set_property(f.bucket, service(source, &["80"]));
        f.tree.set_check(
            f.bucket,
            check_spec(vec![Constraint::Service {
                name: "www".to_string(),
            }]),
        );
        f.tree.compute_check_instances();
        let first = f.tree.check_instances()[0].clone();
        f.tree.drain_actions();

        f.tree.update_property(f.bucket, service(source, &["80", "8080"]));
        f.tree.compute_check_instances();
        let actions = instance_actions(&mut f.tree);
        let [Action::CheckInstanceUpdate { instance }] = actions.as_slice() else {
            panic!("expected a single update, got {:?}", actions);
        };
        assert_eq!(instance.instance_id, first.instance_id);
        assert_eq!(instance.version, 1);
        assert_ne!(instance.service_cfg_hash, first.service_cfg_hash);
    }

    #[test]
    fn test_recompute_without_change_is_silent() {
        let mut f = fixture();
        f.tree.set_check(f.bucket, check_spec(vec![]));
        f.tree.compute_check_instances();
        f.tree.drain_actions();
        f.tree.compute_check_instances();
        assert!(f.tree.drain_actions().is_empty());
    }

    #[test]
    fn test_deleting_check_deletes_instances() {
        let mut f = fixture();
        let spec = check_spec(vec![]);
        let config_id = spec.config_id;
        f.tree.set_check(f.bucket, spec);
        f.tree.compute_check_instances();
        f.tree.drain_actions();
        f.tree.delete_check(f.bucket, config_id);
        f.tree.compute_check_instances();
        let actions = instance_actions(&mut f.tree);
        assert!(matches!(
            actions.as_slice(),
            [Action::CheckInstanceDelete { .. }]
        ));
    }

    #[test]
    fn test_recreated_configuration_keeps_instance_identity() {
        let mut f = fixture();
        let first = check_spec(vec![]);
        let mut second = first.clone();
        second.config_id = Uuid::new_v4();
        f.tree.set_check(f.bucket, first.clone());
        f.tree.compute_check_instances();
        let id = f.tree.check_instances()[0].instance_id;

        f.tree.delete_check(f.bucket, first.config_id);
        f.tree.compute_check_instances();
        f.tree.set_check(f.bucket, second);
        f.tree.compute_check_instances();
        assert_eq!(f.tree.check_instances()[0].instance_id, id);
    }

    #[test]
    fn test_load_mode_reports_divergence() {
        let spec = check_spec(vec![]);
        let mut live = fixture();
        live.tree.set_check(live.bucket, spec.clone());
        live.tree.compute_check_instances();
        let stored = live.tree.check_instances()[0].clone();

        let mut reloaded = fixture_in(true);
        reloaded.tree.set_check(reloaded.bucket, spec.clone());
        reloaded.tree.load_instance(stored.clone());
        reloaded.tree.drain_actions();
        reloaded.tree.compute_check_instances();
        assert!(reloaded.tree.drain_errors().is_empty());
        assert!(reloaded.tree.drain_actions().is_empty());

        let mut corrupted = fixture_in(true);
        corrupted.tree.set_check(corrupted.bucket, spec);
        corrupted.tree.drain_actions();
        corrupted.tree.compute_check_instances();
        assert_eq!(
            corrupted.tree.drain_errors(),
            vec![TreeError::LoadMismatch {
                instance_id: stored.instance_id,
                object: corrupted.node,
                reason: "not stored",
            }]
        );
    }

    #[test]
    fn test_revived_instance_continues_its_versions() {
        let mut f = fixture();
        let source = Uuid::new_v4();
        let spec = check_spec(vec![Constraint::Service {
            name: "www".to_string(),
        }]);
        f.tree.set_property(f.bucket, service(source, &["80"]));
        f.tree.set_check(f.bucket, spec.clone());
        f.tree.compute_check_instances();
        f.tree.update_property(f.bucket, service(source, &["80", "8080"]));
        f.tree.compute_check_instances();
        let bumped = f.tree.check_instances()[0].clone();
        assert_eq!(bumped.version, 1);

        f.tree.delete_check(f.bucket, spec.config_id);
        f.tree.compute_check_instances();
        assert!(f.tree.check_instances().is_empty());
        f.tree.drain_actions();

        f.tree.set_check(
            f.bucket,
            CheckSpec {
                config_id: Uuid::new_v4(),
                ..spec
            },
        );
        f.tree.compute_check_instances();
        let actions = instance_actions(&mut f.tree);
        let [Action::CheckInstanceCreate { instance }] = actions.as_slice() else {
            panic!("expected a single create, got {:?}", actions);
        };
        assert_eq!(instance.instance_id, bumped.instance_id);
        assert_eq!(instance.version, 2);
    }
}
